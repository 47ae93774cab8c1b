//! SQLite persistence for every tenant resource.
//!
//! `CrmDb` owns the connection and exposes synchronous CRUD methods, split
//! across submodules by area:
//!
//! | Submodule  | Tables                                   |
//! |------------|------------------------------------------|
//! | `tenancy`  | plans, organizations, users, sessions    |
//! | `pipeline` | stages, leads                            |
//! | `work`     | projects, tasks, service_orders          |
//! | `reports`  | read-only aggregates for the dashboard   |
//!
//! Every tenant-owned query filters on `organization_id`; a row owned by
//! another organization is indistinguishable from a missing one.

mod pipeline;
mod reports;
mod tenancy;
mod work;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::Deserialize;

use super::board::Board;
use super::models::Page;
use crate::errors::CrmError;

pub use pipeline::LeadFilter;
pub use reports::{Dashboard, LeadStageCount, StatusCount};
pub use work::{ProjectFilter, ServiceOrderFilter, TaskFilter};

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| CrmError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For CLI commands and
    /// tests only; async handlers go through [`DbHandle::call`].
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CrmDb>> {
        self.inner
            .lock()
            .map_err(|_| CrmError::LockPoisoned.into())
    }
}

/// Page selection for list endpoints. `page` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Raw pagination query (`?page=2&pageSize=50`), clamped by the API layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// Accumulates `AND`-joined WHERE clauses with positional `?` parameters.
#[derive(Default)]
struct SqlFilter {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl SqlFilter {
    fn scoped(org_id: i64) -> Self {
        let mut f = Self::default();
        f.push("organization_id = ?", Value::Integer(org_id));
        f
    }

    fn push(&mut self, clause: &str, value: Value) {
        self.clauses.push(clause.to_string());
        self.values.push(value);
    }

    /// Case-insensitive substring match over several columns.
    fn push_search(&mut self, columns: &[&str], term: Option<&str>) {
        let Some(term) = term.map(str::trim).filter(|t| !t.is_empty()) else {
            return;
        };
        let pattern = format!("%{}%", term.to_lowercase());
        let ors: Vec<String> = columns
            .iter()
            .map(|c| format!("LOWER(COALESCE({}, '')) LIKE ?", c))
            .collect();
        self.clauses.push(format!("({})", ors.join(" OR ")));
        for _ in columns {
            self.values.push(Value::Text(pattern.clone()));
        }
    }

    fn push_date(&mut self, clause: &str, value: Option<chrono::NaiveDate>) {
        if let Some(d) = value {
            self.push(clause, Value::Text(d.format("%Y-%m-%d").to_string()));
        }
    }

    fn push_text(&mut self, clause: &str, value: Option<&str>) {
        if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.push(clause, Value::Text(v.to_string()));
        }
    }

    fn push_int(&mut self, clause: &str, value: Option<i64>) {
        if let Some(v) = value {
            self.push(clause, Value::Integer(v));
        }
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Tenant-owned tables counted against plan limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Users,
    Leads,
    Projects,
    ServiceOrders,
}

impl Resource {
    fn table(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Leads => "leads",
            Self::Projects => "projects",
            Self::ServiceOrders => "service_orders",
        }
    }

    fn plan_column(&self) -> &'static str {
        match self {
            Self::Users => "max_users",
            Self::Leads => "max_leads",
            Self::Projects => "max_projects",
            Self::ServiceOrders => "max_service_orders",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Leads => "leads",
            Self::Projects => "projects",
            Self::ServiceOrders => "service orders",
        }
    }
}

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS plans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    max_users INTEGER,
                    max_leads INTEGER,
                    max_projects INTEGER,
                    max_service_orders INTEGER,
                    price_cents INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS organizations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    plan_id INTEGER NOT NULL REFERENCES plans(id),
                    active INTEGER NOT NULL DEFAULT 1,
                    next_os_number INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER REFERENCES organizations(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    role TEXT NOT NULL DEFAULT 'member',
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS stages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    name TEXT NOT NULL,
                    color TEXT NOT NULL DEFAULT '#64748b',
                    position INTEGER NOT NULL DEFAULT 0,
                    kind TEXT NOT NULL DEFAULT 'open',
                    UNIQUE(organization_id, key)
                );

                CREATE TABLE IF NOT EXISTS leads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    email TEXT,
                    phone TEXT,
                    company TEXT,
                    status TEXT NOT NULL,
                    origin TEXT,
                    value_cents INTEGER NOT NULL DEFAULT 0,
                    notes TEXT NOT NULL DEFAULT '',
                    assignee_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                    lead_id INTEGER REFERENCES leads(id) ON DELETE SET NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'planning',
                    start_date TEXT,
                    due_date TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                    project_id INTEGER REFERENCES projects(id) ON DELETE CASCADE,
                    lead_id INTEGER REFERENCES leads(id) ON DELETE SET NULL,
                    assignee_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'todo',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    due_date TEXT,
                    completed_at TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS service_orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'open',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    assignee_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                    due_date TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(organization_id, number)
                );

                CREATE INDEX IF NOT EXISTS idx_users_org ON users(organization_id);
                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                CREATE INDEX IF NOT EXISTS idx_stages_org ON stages(organization_id, position);
                CREATE INDEX IF NOT EXISTS idx_leads_column ON leads(organization_id, status, position);
                CREATE INDEX IF NOT EXISTS idx_projects_org ON projects(organization_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_column ON tasks(organization_id, status, position);
                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE INDEX IF NOT EXISTS idx_service_orders_column ON service_orders(organization_id, status, position);
                CREATE INDEX IF NOT EXISTS idx_service_orders_project ON service_orders(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Shared helpers ────────────────────────────────────────────────

    fn count_where(&self, table: &str, filter: &SqlFilter) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} {}", table, filter.where_sql());
        self.conn
            .query_row(&sql, params_from_iter(filter.values.iter()), |row| row.get(0))
            .with_context(|| format!("Failed to count {}", table))
    }

    fn select_where<T>(
        &self,
        table: &str,
        columns: &str,
        filter: &SqlFilter,
        tail: &str,
        extra: &[Value],
        map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let sql = format!(
            "SELECT {} FROM {} {} {}",
            columns,
            table,
            filter.where_sql(),
            tail
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare query on {}", table))?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter().chain(extra)), map)
            .with_context(|| format!("Failed to query {}", table))?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.with_context(|| format!("Failed to read {} row", table))?);
        }
        Ok(items)
    }

    fn select_page<T>(
        &self,
        table: &str,
        columns: &str,
        filter: &SqlFilter,
        order_by: &str,
        page: PageRequest,
        map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Page<T>> {
        let total = self.count_where(table, filter)?;
        let items = self.select_where(
            table,
            columns,
            filter,
            &format!("ORDER BY {} LIMIT ? OFFSET ?", order_by),
            &[Value::Integer(page.limit()), Value::Integer(page.offset())],
            map,
        )?;
        Ok(Page::new(items, page.page, page.page_size, total))
    }

    fn count_for_org(&self, table: &str, org_id: i64) -> Result<i64> {
        self.count_where(table, &SqlFilter::scoped(org_id))
    }

    /// Reject the insert when the organization's plan caps `resource` and
    /// the cap is already reached.
    pub fn check_plan_limit(&self, org_id: i64, resource: Resource) -> Result<()> {
        let sql = format!(
            "SELECT p.{} FROM organizations o JOIN plans p ON p.id = o.plan_id WHERE o.id = ?1",
            resource.plan_column()
        );
        let limit: Option<i64> = self
            .conn
            .query_row(&sql, params![org_id], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    anyhow::Error::from(CrmError::not_found("Organization", org_id))
                }
                other => anyhow::Error::from(other).context("Failed to read plan limit"),
            })?;
        if let Some(limit) = limit {
            let used = self.count_for_org(resource.table(), org_id)?;
            if used >= limit {
                return Err(CrmError::PlanLimitExceeded {
                    resource: resource.label(),
                    limit,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Ids of one board column in display order.
    fn column_ids(&self, table: &str, org_id: i64, status: &str) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE organization_id = ?1 AND status = ?2 ORDER BY position, id",
            table
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare column query on {}", table))?;
        let rows = stmt
            .query_map(params![org_id, status], |row| row.get::<_, i64>(0))
            .context("Failed to query column ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read column id")?);
        }
        Ok(ids)
    }

    fn next_position(&self, table: &str, org_id: i64, status: &str) -> Result<i32> {
        let sql = format!(
            "SELECT COALESCE(MAX(position), -1) FROM {} WHERE organization_id = ?1 AND status = ?2",
            table
        );
        let max_pos: i32 = self
            .conn
            .query_row(&sql, params![org_id, status], |row| row.get(0))
            .context("Failed to get max position")?;
        Ok(max_pos + 1)
    }

    /// Write back the orderings of a board after a move: every id gets its
    /// column as status and its index as position. Only the moved card's
    /// `updated_at` is touched.
    fn persist_board<C: std::fmt::Display + Clone + PartialEq>(
        &self,
        table: &str,
        board: &Board<C>,
        moved_id: i64,
    ) -> Result<()> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let reposition = format!("UPDATE {} SET status = ?1, position = ?2 WHERE id = ?3", table);
        let touch = format!("UPDATE {} SET updated_at = datetime('now') WHERE id = ?1", table);
        for (column, ids) in board.columns() {
            let status = column.to_string();
            for (position, id) in ids.iter().enumerate() {
                tx.execute(&reposition, params![status, position as i32, id])
                    .context("Failed to reposition card")?;
            }
        }
        tx.execute(&touch, params![moved_id])
            .context("Failed to touch moved card")?;
        tx.commit().context("Failed to commit board move")?;
        Ok(())
    }

    fn last_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Ensure an optional foreign id points at a row of the same organization.
    fn check_owned(&self, table: &str, entity: &'static str, org_id: i64, id: Option<i64>) -> Result<()> {
        let Some(id) = id else {
            return Ok(());
        };
        let sql = format!(
            "SELECT COUNT(*) > 0 FROM {} WHERE id = ?1 AND organization_id = ?2",
            table
        );
        let exists: bool = self
            .conn
            .query_row(&sql, params![id, org_id], |row| row.get(0))
            .with_context(|| format!("Failed to check {} ownership", entity))?;
        if !exists {
            return Err(CrmError::validation(format!(
                "{} {} does not belong to this organization",
                entity, id
            ))
            .into());
        }
        Ok(())
    }
}

/// Read a TEXT column holding an enum's `as_str` form.
fn parse_col<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(CrmError::Database(anyhow::anyhow!(e))),
        )
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// `Some("")` clears an optional text column, `None` keeps `current`.
fn merge_optional(current: Option<String>, update: Option<String>) -> Option<String> {
    match update {
        Some(v) => super::validate::non_blank(Some(v)),
        None => current,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::seeded;
    use super::*;
    use crate::app::models::*;

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = CrmDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('plans', 'organizations', 'users', 'sessions', 'stages', 'leads', 'projects', 'tasks', 'service_orders')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 9);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("crm.db");
        CrmDb::new(&path)?;
        CrmDb::new(&path)?;
        Ok(())
    }

    #[test]
    fn test_plan_limit_blocks_insert_at_cap() -> Result<()> {
        let (db, org, _) = seeded();
        let small = db.create_plan(&NewPlan {
            name: "Free".into(),
            max_users: None,
            max_leads: Some(1),
            max_projects: None,
            max_service_orders: None,
            price_cents: 0,
        })?;
        db.conn.execute(
            "UPDATE organizations SET plan_id = ?1 WHERE id = ?2",
            params![small.id, org.id],
        )?;

        db.check_plan_limit(org.id, Resource::Leads)?;
        db.create_lead(org.id, &NewLead { name: "First".into(), ..Default::default() })?;
        let err = db.check_plan_limit(org.id, Resource::Leads).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrmError>(),
            Some(CrmError::PlanLimitExceeded { limit: 1, .. })
        ));
        // Unlimited resources never block
        db.check_plan_limit(org.id, Resource::Projects)?;
        Ok(())
    }

    #[test]
    fn test_check_owned_rejects_foreign_rows() -> Result<()> {
        let (db, org, admin) = seeded();
        db.check_owned("users", "User", org.id, Some(admin.id))?;
        db.check_owned("users", "User", org.id, None)?;
        let err = db.check_owned("users", "User", org.id + 1, Some(admin.id)).unwrap_err();
        assert!(matches!(err.downcast_ref::<CrmError>(), Some(CrmError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_page_request_offsets() {
        let page = PageRequest::new(3, 20);
        assert_eq!(page.offset(), 40);
        assert_eq!(page.limit(), 20);
        assert_eq!(PageRequest::new(0, 0), PageRequest::new(1, 1));
    }
}
