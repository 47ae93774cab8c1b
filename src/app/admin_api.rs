//! Superadmin console: plans, organizations and their users.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
};

use super::api::{ApiError, SharedState};
use super::auth::SuperAdmin;
use super::db::PageQuery;
use super::models::*;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/admin/plans", get(list_plans).post(create_plan))
        .route(
            "/api/admin/plans/{id}",
            get(get_plan).patch(update_plan).delete(delete_plan),
        )
        .route(
            "/api/admin/organizations",
            get(list_organizations).post(create_organization),
        )
        .route(
            "/api/admin/organizations/{id}",
            get(organization_usage)
                .patch(update_organization)
                .delete(delete_organization),
        )
        .route(
            "/api/admin/organizations/{id}/users",
            get(list_organization_users).post(create_organization_user),
        )
        .route(
            "/api/admin/users/{id}",
            patch(update_user).delete(delete_user),
        )
}

// ── Plans ─────────────────────────────────────────────────────────────

async fn list_plans(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
) -> Result<Json<Vec<Plan>>, ApiError> {
    let plans = state.db.call(|db| db.list_plans()).await?;
    Ok(Json(plans))
}

async fn create_plan(
    State(state): State<SharedState>,
    SuperAdmin(admin): SuperAdmin,
    Json(req): Json<NewPlan>,
) -> Result<impl IntoResponse, ApiError> {
    let plan = state.db.call(move |db| db.create_plan(&req)).await?;
    tracing::info!(admin_id = admin.id, plan = %plan.name, "plan created");
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn get_plan(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
) -> Result<Json<Plan>, ApiError> {
    let plan = state.db.call(move |db| db.get_plan(id)).await?;
    Ok(Json(plan))
}

async fn update_plan(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
    Json(req): Json<PlanUpdate>,
) -> Result<Json<Plan>, ApiError> {
    let plan = state.db.call(move |db| db.update_plan(id, &req)).await?;
    Ok(Json(plan))
}

async fn delete_plan(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.db.call(move |db| db.delete_plan(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Organizations ─────────────────────────────────────────────────────

async fn list_organizations(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<Organization>>, ApiError> {
    let page = state.page_request(&page);
    let orgs = state
        .db
        .call(move |db| db.list_organizations(page))
        .await?;
    Ok(Json(orgs))
}

async fn create_organization(
    State(state): State<SharedState>,
    SuperAdmin(admin): SuperAdmin,
    Json(req): Json<NewOrganization>,
) -> Result<impl IntoResponse, ApiError> {
    let org = state
        .db
        .call(move |db| db.create_organization(&req))
        .await?;
    tracing::info!(admin_id = admin.id, org_id = org.id, slug = %org.slug, "organization created");
    Ok((StatusCode::CREATED, Json(org)))
}

async fn organization_usage(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
) -> Result<Json<OrganizationUsage>, ApiError> {
    let usage = state
        .db
        .call(move |db| db.organization_usage(id))
        .await?;
    Ok(Json(usage))
}

async fn update_organization(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
    Json(req): Json<OrganizationUpdate>,
) -> Result<Json<Organization>, ApiError> {
    let org = state
        .db
        .call(move |db| db.update_organization(id, &req))
        .await?;
    Ok(Json(org))
}

async fn delete_organization(
    State(state): State<SharedState>,
    SuperAdmin(admin): SuperAdmin,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .db
        .call(move |db| db.delete_organization(id))
        .await?;
    tracing::info!(admin_id = admin.id, org_id = id, "organization deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Users ─────────────────────────────────────────────────────────────

async fn list_organization_users(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
) -> Result<Json<Vec<User>>, ApiError> {
    let users = state
        .db
        .call(move |db| {
            db.get_organization(id)?;
            db.list_users(id)
        })
        .await?;
    Ok(Json(users))
}

async fn create_organization_user(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
    Json(req): Json<NewUser>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .call(move |db| {
            db.get_organization(id)?;
            db.create_user(Some(id), &req)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<SharedState>,
    _admin: SuperAdmin,
    Path(id): Path<i64>,
    Json(req): Json<UserUpdate>,
) -> Result<Json<User>, ApiError> {
    let user = state.db.call(move |db| db.update_user(id, &req)).await?;
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<SharedState>,
    SuperAdmin(admin): SuperAdmin,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if admin.id == id {
        return Err(ApiError::Conflict("cannot delete your own account".into()));
    }
    state.db.call(move |db| db.delete_user(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
