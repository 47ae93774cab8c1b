//! HTTP client for a running CRM server.
//!
//! Used by `crm import` to submit CSV rows one request at a time. Any
//! non-2xx response is turned into an error carrying the server's
//! `{"error": ...}` message.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::import::{ImportKind, ImportPayload, ImportReport, RowSink};
use crate::app::models::Me;

#[derive(Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl CrmClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to send GET {}", path))?;
        decode(resp, path).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send POST {}", path))?;
        decode(resp, path).await
    }

    pub async fn me(&self) -> Result<Me> {
        self.get_json("/api/me").await
    }

    /// Upload a whole CSV file and let the server import it.
    pub async fn import(&self, kind: ImportKind, csv: String) -> Result<ImportReport> {
        let path = format!("/api/import/{}", kind.as_str());
        let resp = self
            .http
            .post(self.url(&path))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(csv)
            .send()
            .await
            .with_context(|| format!("Failed to send POST {}", path))?;
        decode(resp, &path).await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response, path: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{} ({}): {}", path, status, error_message(&body));
    }
    resp.json::<T>()
        .await
        .with_context(|| format!("Failed to parse response from {}", path))
}

/// The `error` field of an API error body, or the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Submits each imported row to the matching REST create endpoint.
pub struct HttpSink {
    client: CrmClient,
}

impl HttpSink {
    pub fn new(client: CrmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RowSink for HttpSink {
    async fn submit(&self, payload: ImportPayload) -> Result<(), String> {
        let result: Result<serde_json::Value> = match &payload {
            ImportPayload::Lead(new) => self.client.post_json("/api/leads", new).await,
            ImportPayload::Task(new) => self.client.post_json("/api/tasks", new).await,
            ImportPayload::ServiceOrder(new) => {
                self.client.post_json("/api/service-orders", new).await
            }
            ImportPayload::Project(new) => self.client.post_json("/api/projects", new).await,
            ImportPayload::User(new) => self.client.post_json("/api/users", new).await,
        };
        result.map(|_| ()).map_err(|e| {
            let message = format!("{:#}", e);
            // Drop the "<path> (<status>): " prefix; the report already has the line.
            match message.split_once("): ") {
                Some((_, rest)) => rest.to_string(),
                None => message,
            }
        })
    }
}
