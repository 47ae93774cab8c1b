use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::sync::broadcast;

use super::auth::Tenant;
use super::db::{DbHandle, LeadFilter, PageQuery, PageRequest};
use super::import::{DbSink, ImportKind, import_csv};
use super::models::*;
use super::ws::{ChangeEvent, WsMessage, broadcast_message};
use super::{admin_api, work_api};
use crate::config::PaginationSection;
use crate::errors::{CrmError, ImportError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<ChangeEvent>,
    pub pagination: PaginationSection,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: DbHandle, pagination: PaginationSection) -> Self {
        let (ws_tx, _rx) = broadcast::channel(256);
        Self {
            db,
            ws_tx,
            pagination,
        }
    }

    /// Clamp a raw page query to the configured bounds.
    pub fn page_request(&self, query: &PageQuery) -> PageRequest {
        let size = query
            .page_size
            .unwrap_or(self.pagination.default_page_size)
            .clamp(1, self.pagination.max_page_size.max(1));
        PageRequest::new(query.page.unwrap_or(1), size)
    }

    pub fn publish(&self, org_id: i64, msg: WsMessage) {
        broadcast_message(&self.ws_tx, org_id, msg);
    }
}

// ── Request payload types ─────────────────────────────────────────────

/// Body of the `.../{id}/move` endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest<S> {
    pub to_status: S,
    pub to_index: usize,
    #[serde(default)]
    pub from_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StageOrderRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DateRangeQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        let message = err.to_string();
        match err {
            CrmError::NotFound { .. } => ApiError::NotFound(message),
            CrmError::Validation(_) => ApiError::BadRequest(message),
            CrmError::PlanLimitExceeded { .. } | CrmError::Conflict(_) => {
                ApiError::Conflict(message)
            }
            CrmError::Unauthorized => ApiError::Unauthorized(message),
            CrmError::Forbidden(_) => ApiError::Forbidden(message),
            CrmError::LockPoisoned | CrmError::Database(_) | CrmError::Other(_) => {
                tracing::error!(error = ?err, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CrmError>() {
            Ok(crm) => crm.into(),
            Err(err) => match err.downcast::<ImportError>() {
                Ok(import) => import.into(),
                Err(err) => {
                    tracing::error!(error = ?err, "request failed");
                    ApiError::Internal(format!("{:#}", err))
                }
            },
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/me", get(me))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/stages", get(list_stages).post(create_stage))
        .route("/api/stages/order", put(reorder_stages))
        .route(
            "/api/stages/{id}",
            patch(update_stage).delete(delete_stage),
        )
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/board", get(lead_board))
        .route(
            "/api/leads/{id}",
            get(get_lead).patch(update_lead).delete(delete_lead),
        )
        .route("/api/leads/{id}/move", patch(move_lead))
        .route("/api/import/{kind}", post(import))
        .route("/api/reports/dashboard", get(dashboard))
        .merge(work_api::routes())
        .merge(admin_api::routes())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn me(tenant: Tenant) -> Json<Me> {
    Json(Me {
        user: tenant.user,
        organization: tenant.organization,
    })
}

async fn list_users(
    State(state): State<SharedState>,
    tenant: Tenant,
) -> Result<Json<Vec<User>>, ApiError> {
    let org_id = tenant.organization_id();
    let users = state.db.call(move |db| db.list_users(org_id)).await?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<SharedState>,
    tenant: Tenant,
    Json(req): Json<NewUser>,
) -> Result<impl IntoResponse, ApiError> {
    tenant.require_admin()?;
    let org_id = tenant.organization_id();
    let user = state
        .db
        .call(move |db| db.create_user(Some(org_id), &req))
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_stages(
    State(state): State<SharedState>,
    tenant: Tenant,
) -> Result<Json<Vec<Stage>>, ApiError> {
    let org_id = tenant.organization_id();
    let stages = state.db.call(move |db| db.list_stages(org_id)).await?;
    Ok(Json(stages))
}

/// Re-read the pipeline and tell every client of the organization.
async fn publish_stages(state: &SharedState, org_id: i64) -> Result<Vec<Stage>, ApiError> {
    let stages = state.db.call(move |db| db.list_stages(org_id)).await?;
    state.publish(
        org_id,
        WsMessage::StagesChanged {
            stages: stages.clone(),
        },
    );
    Ok(stages)
}

async fn create_stage(
    State(state): State<SharedState>,
    tenant: Tenant,
    Json(req): Json<NewStage>,
) -> Result<impl IntoResponse, ApiError> {
    tenant.require_admin()?;
    let org_id = tenant.organization_id();
    let stage = state.db.call(move |db| db.create_stage(org_id, &req)).await?;
    publish_stages(&state, org_id).await?;
    Ok((StatusCode::CREATED, Json(stage)))
}

async fn update_stage(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<StageUpdate>,
) -> Result<Json<Stage>, ApiError> {
    tenant.require_admin()?;
    let org_id = tenant.organization_id();
    let stage = state
        .db
        .call(move |db| db.update_stage(org_id, id, &req))
        .await?;
    publish_stages(&state, org_id).await?;
    Ok(Json(stage))
}

async fn reorder_stages(
    State(state): State<SharedState>,
    tenant: Tenant,
    Json(req): Json<StageOrderRequest>,
) -> Result<Json<Vec<Stage>>, ApiError> {
    tenant.require_admin()?;
    let org_id = tenant.organization_id();
    state
        .db
        .call(move |db| db.reorder_stages(org_id, &req.ids))
        .await?;
    Ok(Json(publish_stages(&state, org_id).await?))
}

async fn delete_stage(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    tenant.require_admin()?;
    let org_id = tenant.organization_id();
    state.db.call(move |db| db.delete_stage(org_id, id)).await?;
    publish_stages(&state, org_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_leads(
    State(state): State<SharedState>,
    tenant: Tenant,
    Query(filter): Query<LeadFilter>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<Lead>>, ApiError> {
    let org_id = tenant.organization_id();
    let page = state.page_request(&page);
    let leads = state
        .db
        .call(move |db| db.list_leads(org_id, &filter, page))
        .await?;
    Ok(Json(leads))
}

async fn create_lead(
    State(state): State<SharedState>,
    tenant: Tenant,
    Json(req): Json<NewLead>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = tenant.organization_id();
    let lead = state.db.call(move |db| db.create_lead(org_id, &req)).await?;
    state.publish(org_id, WsMessage::LeadCreated { lead: lead.clone() });
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn lead_board(
    State(state): State<SharedState>,
    tenant: Tenant,
) -> Result<Json<BoardView<Lead>>, ApiError> {
    let org_id = tenant.organization_id();
    let board = state.db.call(move |db| db.lead_board(org_id)).await?;
    Ok(Json(board))
}

async fn get_lead(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<Json<Lead>, ApiError> {
    let org_id = tenant.organization_id();
    let lead = state.db.call(move |db| db.get_lead(org_id, id)).await?;
    Ok(Json(lead))
}

async fn update_lead(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<LeadUpdate>,
) -> Result<Json<Lead>, ApiError> {
    let org_id = tenant.organization_id();
    let lead = state
        .db
        .call(move |db| db.update_lead(org_id, id, &req))
        .await?;
    state.publish(org_id, WsMessage::LeadUpdated { lead: lead.clone() });
    Ok(Json(lead))
}

async fn delete_lead(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let org_id = tenant.organization_id();
    state.db.call(move |db| db.delete_lead(org_id, id)).await?;
    state.publish(org_id, WsMessage::LeadDeleted { lead_id: id });
    Ok(StatusCode::NO_CONTENT)
}

async fn move_lead(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<MoveRequest<String>>,
) -> Result<Json<Lead>, ApiError> {
    let org_id = tenant.organization_id();
    let (from_status, lead) = state
        .db
        .call(move |db| {
            let before = db.get_lead(org_id, id)?;
            let lead = db.move_lead(org_id, id, &req.to_status, req.to_index, req.from_index)?;
            Ok((before.status, lead))
        })
        .await?;
    state.publish(
        org_id,
        WsMessage::LeadMoved {
            to_status: lead.status.clone(),
            from_status,
            lead: lead.clone(),
        },
    );
    Ok(Json(lead))
}

/// `POST /api/import/{kind}` with the CSV file as the request body.
async fn import(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(kind): Path<String>,
    body: String,
) -> Result<Json<super::import::ImportReport>, ApiError> {
    let kind: ImportKind = kind.parse()?;
    if kind == ImportKind::Users {
        tenant.require_admin()?;
    }
    let org_id = tenant.organization_id();
    let sink = DbSink::new(state.db.clone(), org_id).with_events(state.ws_tx.clone());
    let report = import_csv(kind, &body, &sink).await?;
    state.publish(
        org_id,
        WsMessage::ImportCompleted {
            report: report.clone(),
        },
    );
    Ok(Json(report))
}

async fn dashboard(
    State(state): State<SharedState>,
    tenant: Tenant,
    Query(range): Query<DateRangeQuery>,
) -> Result<Json<super::db::Dashboard>, ApiError> {
    if let (Some(from), Some(to)) = (range.from, range.to)
        && from > to
    {
        return Err(CrmError::validation(format!("'from' ({}) is after 'to' ({})", from, to)).into());
    }
    let org_id = tenant.organization_id();
    let today = chrono::Local::now().date_naive();
    let dashboard = state
        .db
        .call(move |db| db.dashboard(org_id, range.from, range.to, today))
        .await?;
    Ok(Json(dashboard))
}

// ── Tests ─────────────────────────────────────────────────────────────
