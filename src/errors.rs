//! Typed error hierarchy for the CRM back-end.
//!
//! Two enums cover the two failure families:
//! - `CrmError`: domain and persistence failures raised by `app::db` and
//!   mapped onto HTTP status codes by `app::api`
//! - `ImportError`: fatal CSV import failures (row-level problems are
//!   collected into the import report instead)

use thiserror::Error;

/// Errors from the tenant data layer and the REST surface.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Plan limit reached for {resource} (limit {limit})")]
    PlanLimitExceeded { resource: &'static str, limit: i64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrmError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Errors that abort a whole CSV import before any row is submitted.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("CSV file is empty")]
    Empty,

    #[error("Missing required columns: {}", missing.join(", "))]
    MissingColumns { missing: Vec<String> },

    #[error("Unknown import kind '{0}'")]
    UnknownKind(String),

    #[error("Failed to read CSV header: {0}")]
    Header(#[source] csv::Error),
}
