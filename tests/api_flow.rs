//! End-to-end HTTP flows through the public router.
//!
//! Covers the superadmin provisioning path down to tenant work: a fresh
//! organization gets its default pipeline, leads land in the first stage,
//! cards move between columns, CSV imports report per-line errors and
//! tenants never see each other's data.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use crm::app::api::AppState;
use crm::app::db::{CrmDb, DbHandle};
use crm::app::models::{NewUser, Role};
use crm::app::server::build_router;
use crm::app::ws::WsMessage;
use crm::config::PaginationSection;

struct Harness {
    router: Router,
    state: Arc<AppState>,
    root: String,
}

impl Harness {
    fn new() -> Self {
        let db = CrmDb::new_in_memory().unwrap();
        let root = db
            .create_user(
                None,
                &NewUser {
                    name: "Root".into(),
                    email: "root@crm.io".into(),
                    role: Some(Role::Superadmin),
                },
            )
            .unwrap();
        let root = db.create_session(root.id).unwrap();
        let state = Arc::new(AppState::new(DbHandle::new(db), PaginationSection::default()));
        Self {
            router: build_router(state.clone()),
            state,
            root,
        }
    }

    async fn call(&self, method: &str, uri: &str, token: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token));
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn upload(&self, uri: &str, token: &str, csv: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "text/csv")
            .body(Body::from(csv.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Provision an organization with an admin and return the admin's token.
    async fn tenant(&self, name: &str, email: &str, plan: Value) -> String {
        let (status, plan) = self.call("POST", "/api/admin/plans", &self.root, Some(plan)).await;
        assert_eq!(status, StatusCode::CREATED, "{plan}");
        let (status, org) = self
            .call(
                "POST",
                "/api/admin/organizations",
                &self.root,
                Some(json!({"name": name, "planId": plan["id"]})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{org}");
        let (status, user) = self
            .call(
                "POST",
                &format!("/api/admin/organizations/{}/users", org["id"]),
                &self.root,
                Some(json!({"name": "Admin", "email": email, "role": "admin"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{user}");
        let db = self.state.db.lock_sync().unwrap();
        db.create_session(user["id"].as_i64().unwrap()).unwrap()
    }
}

fn column<'a>(board: &'a Value, key: &str) -> &'a Vec<Value> {
    board["columns"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["key"] == key)
        .unwrap()["items"]
        .as_array()
        .unwrap()
}

fn ids(items: &[Value]) -> Vec<i64> {
    items.iter().map(|i| i["id"].as_i64().unwrap()).collect()
}

#[tokio::test]
async fn lead_pipeline_flow() {
    let h = Harness::new();
    let token = h.tenant("Acme", "ana@acme.com", json!({"name": "Pro", "priceCents": 9900})).await;

    let (_, stages) = h.call("GET", "/api/stages", &token, None).await;
    let first_stage = stages[0]["key"].as_str().unwrap().to_string();
    let second_stage = stages[1]["key"].as_str().unwrap().to_string();

    // No status given: the lead lands in the first configured stage.
    let (status, lead) = h.call("POST", "/api/leads", &token, Some(json!({"name": "Padaria"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(lead["status"], first_stage.as_str());

    let mut targets = Vec::new();
    for name in ["B0", "B1", "B2"] {
        let (_, l) = h
            .call("POST", "/api/leads", &token, Some(json!({"name": name, "status": second_stage})))
            .await;
        targets.push(l["id"].as_i64().unwrap());
    }

    let mut rx = h.state.ws_tx.subscribe();
    let lead_id = lead["id"].as_i64().unwrap();
    let (status, moved) = h
        .call(
            "PATCH",
            &format!("/api/leads/{}/move", lead_id),
            &token,
            Some(json!({"toStatus": second_stage, "toIndex": 2, "fromIndex": 0})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["status"], second_stage.as_str());

    let (_, board) = h.call("GET", "/api/leads/board", &token, None).await;
    assert!(column(&board, &first_stage).is_empty());
    assert_eq!(
        ids(column(&board, &second_stage)),
        vec![targets[0], targets[1], lead_id, targets[2]]
    );

    let change = rx.recv().await.unwrap();
    match change.event {
        WsMessage::LeadMoved {
            from_status,
            to_status,
            lead,
        } => {
            assert_eq!(from_status, first_stage);
            assert_eq!(to_status, second_stage);
            assert_eq!(lead.id, lead_id);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn csv_import_counts_successes_and_errors() {
    let h = Harness::new();
    let token = h.tenant("Acme", "ana@acme.com", json!({"name": "Pro", "priceCents": 0})).await;

    let csv = "nome,email,telefone,empresa,status,origem\n\
               Ana,ana@cliente.com,(11) 91234-5678,Acme,,site\n\
               Bruno,bruno-sem-arroba,,,,\n\
               Carla,carla@cliente.com,,\"Carla, Filhos & Cia\",,indicacao\n\
               ,vazio@cliente.com,,,,\n\
               Davi,davi@cliente.com,abc,,,\n";
    let (status, report) = h.upload("/api/import/leads", &token, csv).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["totalRows"], 5);
    assert_eq!(report["imported"], 2);
    let lines: Vec<u64> = report["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["line"].as_u64().unwrap())
        .collect();
    assert_eq!(lines, vec![3, 5, 6]);

    let (_, leads) = h.call("GET", "/api/leads?search=carla", &token, None).await;
    assert_eq!(leads["total"], 1);
    assert_eq!(leads["items"][0]["company"], "Carla, Filhos & Cia");
}

#[tokio::test]
async fn plan_limits_apply_to_imports() {
    let h = Harness::new();
    let token = h
        .tenant("Tiny", "ana@tiny.com", json!({"name": "Tiny", "maxLeads": 2, "priceCents": 0}))
        .await;
    let csv = "nome,email\nA,a@x.com\nB,b@x.com\nC,c@x.com\n";
    let (status, report) = h.upload("/api/import/leads", &token, csv).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["imported"], 2);
    assert_eq!(report["errors"][0]["line"], 4);
    assert!(report["errors"][0]["message"].as_str().unwrap().contains("limit"));

    let (status, body) = h.call("POST", "/api/leads", &token, Some(json!({"name": "D"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("limit 2"));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let h = Harness::new();
    let acme = h.tenant("Acme", "ana@acme.com", json!({"name": "A", "priceCents": 0})).await;
    let globex = h.tenant("Globex", "gil@globex.com", json!({"name": "G", "priceCents": 0})).await;

    let (_, lead) = h.call("POST", "/api/leads", &acme, Some(json!({"name": "Segredo"}))).await;
    let uri = format!("/api/leads/{}", lead["id"]);

    let (status, _) = h.call("GET", &uri, &globex, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = h.call("DELETE", &uri, &globex, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, list) = h.call("GET", "/api/leads", &globex, None).await;
    assert_eq!(list["total"], 0);

    let (status, _) = h.call("GET", &uri, &acme, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn project_delivery_flow() {
    let h = Harness::new();
    let token = h.tenant("Acme", "ana@acme.com", json!({"name": "Pro", "priceCents": 0})).await;

    let (_, project) = h
        .call(
            "POST",
            "/api/projects",
            &token,
            Some(json!({"name": "Loja", "startDate": "2024-03-01", "dueDate": "2024-06-30"})),
        )
        .await;
    let pid = project["id"].as_i64().unwrap();

    let (status, _) = h
        .call(
            "POST",
            "/api/projects",
            &token,
            Some(json!({"name": "Errado", "startDate": "2024-06-01", "dueDate": "2024-01-01"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, os) = h
        .call("POST", "/api/service-orders", &token, Some(json!({"projectId": pid, "title": "Montagem"})))
        .await;
    let (status, os) = h
        .call(
            "PATCH",
            &format!("/api/service-orders/{}/move", os["id"]),
            &token,
            Some(json!({"toStatus": "done", "toIndex": 0})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(os["status"], "done");

    h.call("POST", "/api/tasks", &token, Some(json!({"title": "Orçamento", "projectId": pid})))
        .await;

    let (_, detail) = h.call("GET", &format!("/api/projects/{pid}"), &token, None).await;
    assert_eq!(detail["serviceOrderProgress"]["percent"], 100);
    assert_eq!(detail["taskProgress"]["percent"], 0);

    let (_, dash) = h.call("GET", "/api/reports/dashboard", &token, None).await;
    let done = dash["serviceOrdersByStatus"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["status"] == "done")
        .unwrap();
    assert_eq!(done["count"], 1);
}
