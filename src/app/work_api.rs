//! Delivery routes: projects, tasks and service orders.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
};
use serde::Deserialize;

use super::api::{ApiError, MoveRequest, SharedState};
use super::auth::Tenant;
use super::db::{PageQuery, ProjectFilter, ServiceOrderFilter, TaskFilter};
use super::models::*;
use super::ws::WsMessage;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BoardQuery {
    pub project_id: Option<i64>,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/board", get(task_board))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/move", patch(move_task))
        .route(
            "/api/service-orders",
            get(list_service_orders).post(create_service_order),
        )
        .route("/api/service-orders/board", get(service_order_board))
        .route(
            "/api/service-orders/{id}",
            get(get_service_order)
                .patch(update_service_order)
                .delete(delete_service_order),
        )
        .route("/api/service-orders/{id}/move", patch(move_service_order))
}

// ── Projects ──────────────────────────────────────────────────────────

async fn list_projects(
    State(state): State<SharedState>,
    tenant: Tenant,
    Query(filter): Query<ProjectFilter>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<Project>>, ApiError> {
    let org_id = tenant.organization_id();
    let page = state.page_request(&page);
    let projects = state
        .db
        .call(move |db| db.list_projects(org_id, &filter, page))
        .await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    tenant: Tenant,
    Json(req): Json<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = tenant.organization_id();
    let project = state
        .db
        .call(move |db| db.create_project(org_id, &req))
        .await?;
    state.publish(
        org_id,
        WsMessage::ProjectCreated {
            project: project.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<Json<ProjectDetail>, ApiError> {
    let org_id = tenant.organization_id();
    let detail = state
        .db
        .call(move |db| db.get_project_detail(org_id, id))
        .await?;
    Ok(Json(detail))
}

async fn update_project(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<ProjectUpdate>,
) -> Result<Json<Project>, ApiError> {
    let org_id = tenant.organization_id();
    let project = state
        .db
        .call(move |db| db.update_project(org_id, id, &req))
        .await?;
    state.publish(
        org_id,
        WsMessage::ProjectUpdated {
            project: project.clone(),
        },
    );
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let org_id = tenant.organization_id();
    state
        .db
        .call(move |db| db.delete_project(org_id, id))
        .await?;
    state.publish(org_id, WsMessage::ProjectDeleted { project_id: id });
    Ok(StatusCode::NO_CONTENT)
}

// ── Tasks ─────────────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    tenant: Tenant,
    Query(filter): Query<TaskFilter>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<Task>>, ApiError> {
    let org_id = tenant.organization_id();
    let page = state.page_request(&page);
    let tasks = state
        .db
        .call(move |db| db.list_tasks(org_id, &filter, page))
        .await?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    tenant: Tenant,
    Json(req): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = tenant.organization_id();
    let task = state.db.call(move |db| db.create_task(org_id, &req)).await?;
    state.publish(org_id, WsMessage::TaskCreated { task: task.clone() });
    Ok((StatusCode::CREATED, Json(task)))
}

async fn task_board(
    State(state): State<SharedState>,
    tenant: Tenant,
    Query(query): Query<BoardQuery>,
) -> Result<Json<BoardView<Task>>, ApiError> {
    let org_id = tenant.organization_id();
    let board = state
        .db
        .call(move |db| db.task_board(org_id, query.project_id))
        .await?;
    Ok(Json(board))
}

async fn get_task(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<Json<Task>, ApiError> {
    let org_id = tenant.organization_id();
    let task = state.db.call(move |db| db.get_task(org_id, id)).await?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<TaskUpdate>,
) -> Result<Json<Task>, ApiError> {
    let org_id = tenant.organization_id();
    let task = state
        .db
        .call(move |db| db.update_task(org_id, id, &req))
        .await?;
    state.publish(org_id, WsMessage::TaskUpdated { task: task.clone() });
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let org_id = tenant.organization_id();
    state.db.call(move |db| db.delete_task(org_id, id)).await?;
    state.publish(org_id, WsMessage::TaskDeleted { task_id: id });
    Ok(StatusCode::NO_CONTENT)
}

async fn move_task(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<MoveRequest<TaskStatus>>,
) -> Result<Json<Task>, ApiError> {
    let org_id = tenant.organization_id();
    let (from_status, task) = state
        .db
        .call(move |db| {
            let before = db.get_task(org_id, id)?;
            let task = db.move_task(org_id, id, req.to_status, req.to_index, req.from_index)?;
            Ok((before.status, task))
        })
        .await?;
    state.publish(
        org_id,
        WsMessage::TaskMoved {
            to_status: task.status,
            from_status,
            task: task.clone(),
        },
    );
    Ok(Json(task))
}

// ── Service orders ────────────────────────────────────────────────────

async fn list_service_orders(
    State(state): State<SharedState>,
    tenant: Tenant,
    Query(filter): Query<ServiceOrderFilter>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<ServiceOrder>>, ApiError> {
    let org_id = tenant.organization_id();
    let page = state.page_request(&page);
    let orders = state
        .db
        .call(move |db| db.list_service_orders(org_id, &filter, page))
        .await?;
    Ok(Json(orders))
}

async fn create_service_order(
    State(state): State<SharedState>,
    tenant: Tenant,
    Json(req): Json<NewServiceOrder>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = tenant.organization_id();
    let order = state
        .db
        .call(move |db| db.create_service_order(org_id, &req))
        .await?;
    state.publish(
        org_id,
        WsMessage::ServiceOrderCreated {
            service_order: order.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(order)))
}

async fn service_order_board(
    State(state): State<SharedState>,
    tenant: Tenant,
    Query(query): Query<BoardQuery>,
) -> Result<Json<BoardView<ServiceOrder>>, ApiError> {
    let org_id = tenant.organization_id();
    let board = state
        .db
        .call(move |db| db.service_order_board(org_id, query.project_id))
        .await?;
    Ok(Json(board))
}

async fn get_service_order(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<Json<ServiceOrder>, ApiError> {
    let org_id = tenant.organization_id();
    let order = state
        .db
        .call(move |db| db.get_service_order(org_id, id))
        .await?;
    Ok(Json(order))
}

async fn update_service_order(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<ServiceOrderUpdate>,
) -> Result<Json<ServiceOrder>, ApiError> {
    let org_id = tenant.organization_id();
    let order = state
        .db
        .call(move |db| db.update_service_order(org_id, id, &req))
        .await?;
    state.publish(
        org_id,
        WsMessage::ServiceOrderUpdated {
            service_order: order.clone(),
        },
    );
    Ok(Json(order))
}

async fn delete_service_order(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let org_id = tenant.organization_id();
    state
        .db
        .call(move |db| db.delete_service_order(org_id, id))
        .await?;
    state.publish(
        org_id,
        WsMessage::ServiceOrderDeleted {
            service_order_id: id,
        },
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn move_service_order(
    State(state): State<SharedState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(req): Json<MoveRequest<OsStatus>>,
) -> Result<Json<ServiceOrder>, ApiError> {
    let org_id = tenant.organization_id();
    let (from_status, order) = state
        .db
        .call(move |db| {
            let before = db.get_service_order(org_id, id)?;
            let order =
                db.move_service_order(org_id, id, req.to_status, req.to_index, req.from_index)?;
            Ok((before.status, order))
        })
        .await?;
    state.publish(
        org_id,
        WsMessage::ServiceOrderMoved {
            to_status: order.status,
            from_status,
            service_order: order.clone(),
        },
    );
    Ok(Json(order))
}

#[cfg(test)]
mod tests {
    use super::super::api::test_support::{send, test_app};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_project_detail_reports_progress() {
        let app = test_app();
        let token = Some(app.member_token.as_str());
        let (status, project) =
            send(&app.router, "POST", "/api/projects", token, Some(json!({"name": "Site"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let pid = project["id"].clone();

        send(&app.router, "POST", "/api/tasks", token, Some(json!({"title": "A", "projectId": pid}))).await;
        send(
            &app.router,
            "POST",
            "/api/tasks",
            token,
            Some(json!({"title": "B", "projectId": pid, "status": "done"})),
        )
        .await;

        let (status, detail) =
            send(&app.router, "GET", &format!("/api/projects/{}", pid), token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["project"]["name"], "Site");
        assert_eq!(detail["taskProgress"]["total"], 2);
        assert_eq!(detail["taskProgress"]["done"], 1);
        assert_eq!(detail["taskProgress"]["percent"], 50);
    }

    #[tokio::test]
    async fn test_task_move_and_board() {
        let app = test_app();
        let token = Some(app.member_token.as_str());
        let (_, task) = send(&app.router, "POST", "/api/tasks", token, Some(json!({"title": "Ligar"}))).await;
        assert_eq!(task["status"], "todo");

        let uri = format!("/api/tasks/{}/move", task["id"]);
        let (status, moved) = send(
            &app.router,
            "PATCH",
            &uri,
            token,
            Some(json!({"toStatus": "done", "toIndex": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["status"], "done");
        assert!(moved["completedAt"].is_string());

        let (_, board) = send(&app.router, "GET", "/api/tasks/board", token, None).await;
        let done = board["columns"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["key"] == "done")
            .unwrap();
        assert_eq!(done["items"][0]["id"], task["id"]);
    }

    #[tokio::test]
    async fn test_invalid_task_status_is_rejected() {
        let app = test_app();
        let (status, _) = send(
            &app.router,
            "POST",
            "/api/tasks",
            Some(&app.member_token),
            Some(json!({"title": "X", "status": "someday"})),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_service_order_numbering_and_delete() {
        let app = test_app();
        let token = Some(app.member_token.as_str());
        let (_, project) =
            send(&app.router, "POST", "/api/projects", token, Some(json!({"name": "Obra"}))).await;
        let body = json!({"projectId": project["id"], "title": "Instalação"});
        let (status, first) = send(&app.router, "POST", "/api/service-orders", token, Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, second) = send(&app.router, "POST", "/api/service-orders", token, Some(body)).await;
        assert_eq!(first["number"], 1);
        assert_eq!(second["number"], 2);
        assert_ne!(first["code"], second["code"]);

        let uri = format!("/api/service-orders/{}", first["id"]);
        let (status, _) = send(&app.router, "DELETE", &uri, token, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app.router, "GET", &uri, token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, list) = send(&app.router, "GET", "/api/service-orders", token, None).await;
        assert_eq!(list["total"], 1);
        assert_eq!(list["items"][0]["number"], 2);
    }

    #[tokio::test]
    async fn test_service_order_requires_own_project() {
        let app = test_app();
        let (status, _) = send(
            &app.router,
            "POST",
            "/api/service-orders",
            Some(&app.member_token),
            Some(json!({"projectId": 4242, "title": "X"})),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_service_order_board_filters_by_project() {
        let app = test_app();
        let token = Some(app.member_token.as_str());
        let (_, p1) = send(&app.router, "POST", "/api/projects", token, Some(json!({"name": "P1"}))).await;
        let (_, p2) = send(&app.router, "POST", "/api/projects", token, Some(json!({"name": "P2"}))).await;
        for pid in [&p1["id"], &p2["id"], &p2["id"]] {
            send(&app.router, "POST", "/api/service-orders", token, Some(json!({"projectId": pid, "title": "OS"}))).await;
        }
        let uri = format!("/api/service-orders/board?projectId={}", p2["id"]);
        let (status, board) = send(&app.router, "GET", &uri, token, None).await;
        assert_eq!(status, StatusCode::OK);
        let count: usize = board["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["items"].as_array().unwrap().len())
            .sum();
        assert_eq!(count, 2);
    }
}
