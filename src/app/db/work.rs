use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;

use super::{CrmDb, PageRequest, Resource, SqlFilter, parse_col};
use crate::app::board::{Board, CardMove};
use crate::app::models::*;
use crate::app::validate::require_non_empty;
use crate::errors::CrmError;

const PROJECT_COLUMNS: &str =
    "id, organization_id, lead_id, name, description, status, start_date, due_date, created_at, updated_at";
const TASK_COLUMNS: &str = "id, organization_id, project_id, lead_id, assignee_id, title, description, status, priority, due_date, completed_at, position, created_at, updated_at";
const SERVICE_ORDER_COLUMNS: &str = "id, organization_id, project_id, number, title, description, status, priority, assignee_id, due_date, position, created_at, updated_at";

/// Keeps `completed_at` in step with the `done` column.
const SYNC_COMPLETED_AT: &str = "UPDATE tasks SET completed_at = CASE
        WHEN status = 'done' THEN COALESCE(completed_at, datetime('now'))
        ELSE NULL END
     WHERE id = ?1";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub lead_id: Option<i64>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub project_id: Option<i64>,
    pub lead_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub due_from: Option<NaiveDate>,
    pub due_to: Option<NaiveDate>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOrderFilter {
    pub status: Option<OsStatus>,
    pub priority: Option<Priority>,
    pub project_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub search: Option<String>,
}

fn check_date_range(start: Option<NaiveDate>, due: Option<NaiveDate>) -> Result<(), CrmError> {
    match (start, due) {
        (Some(s), Some(d)) if d < s => Err(CrmError::validation(format!(
            "due date {} is before start date {}",
            d, s
        ))),
        _ => Ok(()),
    }
}

impl CrmDb {
    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, org_id: i64, new: &NewProject) -> Result<Project> {
        require_non_empty("name", &new.name)?;
        check_date_range(new.start_date, new.due_date)?;
        self.check_owned("leads", "Lead", org_id, new.lead_id)?;
        self.check_plan_limit(org_id, Resource::Projects)?;
        let status = new.status.unwrap_or(ProjectStatus::Planning);
        self.conn
            .execute(
                "INSERT INTO projects (organization_id, lead_id, name, description, status, start_date, due_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    org_id,
                    new.lead_id,
                    new.name.trim(),
                    new.description.clone().unwrap_or_default(),
                    status.as_str(),
                    new.start_date,
                    new.due_date
                ],
            )
            .context("Failed to insert project")?;
        let project = self.get_project(org_id, self.last_id())?;
        tracing::debug!(org_id, project_id = project.id, "project created");
        Ok(project)
    }

    pub fn list_projects(
        &self,
        org_id: i64,
        filter: &ProjectFilter,
        page: PageRequest,
    ) -> Result<Page<Project>> {
        let mut sql = SqlFilter::scoped(org_id);
        sql.push_text("status = ?", filter.status.as_ref().map(ProjectStatus::as_str));
        sql.push_int("lead_id = ?", filter.lead_id);
        sql.push_search(&["name", "description"], filter.search.as_deref());
        self.select_page(
            "projects",
            PROJECT_COLUMNS,
            &sql,
            "created_at DESC, id DESC",
            page,
            project_from_row,
        )
    }

    pub fn get_project(&self, org_id: i64, id: i64) -> Result<Project> {
        let sql = format!(
            "SELECT {} FROM projects WHERE id = ?1 AND organization_id = ?2",
            PROJECT_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id, org_id], project_from_row)
            .optional()
            .context("Failed to query project")?
            .ok_or_else(|| CrmError::not_found("Project", id).into())
    }

    /// A project with completion figures for its tasks and service orders.
    pub fn get_project_detail(&self, org_id: i64, id: i64) -> Result<ProjectDetail> {
        let project = self.get_project(org_id, id)?;
        let progress = |table: &str| -> Result<Progress> {
            let sql = format!(
                "SELECT COUNT(*), COALESCE(SUM(status = 'done'), 0) FROM {} WHERE project_id = ?1",
                table
            );
            let (total, done): (i64, i64) = self
                .conn
                .query_row(&sql, params![id], |row| Ok((row.get(0)?, row.get(1)?)))
                .with_context(|| format!("Failed to compute {} progress", table))?;
            Ok(Progress::new(total, done))
        };
        Ok(ProjectDetail {
            task_progress: progress("tasks")?,
            service_order_progress: progress("service_orders")?,
            project,
        })
    }

    pub fn update_project(&self, org_id: i64, id: i64, update: &ProjectUpdate) -> Result<Project> {
        let mut project = self.get_project(org_id, id)?;
        if let Some(name) = &update.name {
            require_non_empty("name", name)?;
            project.name = name.trim().to_string();
        }
        if let Some(description) = &update.description {
            project.description = description.clone();
        }
        if let Some(status) = update.status {
            project.status = status;
        }
        if update.lead_id.is_some() {
            self.check_owned("leads", "Lead", org_id, update.lead_id)?;
            project.lead_id = update.lead_id;
        }
        if update.start_date.is_some() {
            project.start_date = update.start_date;
        }
        if update.due_date.is_some() {
            project.due_date = update.due_date;
        }
        check_date_range(project.start_date, project.due_date)?;
        self.conn
            .execute(
                "UPDATE projects SET name = ?1, description = ?2, status = ?3, lead_id = ?4,
                 start_date = ?5, due_date = ?6, updated_at = datetime('now') WHERE id = ?7",
                params![
                    project.name,
                    project.description,
                    project.status.as_str(),
                    project.lead_id,
                    project.start_date,
                    project.due_date,
                    id
                ],
            )
            .context("Failed to update project")?;
        self.get_project(org_id, id)
    }

    /// Delete a project together with its tasks and service orders.
    pub fn delete_project(&self, org_id: i64, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM projects WHERE id = ?1 AND organization_id = ?2",
                params![id, org_id],
            )
            .context("Failed to delete project")?;
        if deleted == 0 {
            return Err(CrmError::not_found("Project", id).into());
        }
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(&self, org_id: i64, new: &NewTask) -> Result<Task> {
        require_non_empty("title", &new.title)?;
        self.check_owned("projects", "Project", org_id, new.project_id)?;
        self.check_owned("leads", "Lead", org_id, new.lead_id)?;
        self.check_owned("users", "User", org_id, new.assignee_id)?;
        let status = new.status.unwrap_or(TaskStatus::Todo);
        let position = self.next_position("tasks", org_id, status.as_str())?;
        self.conn
            .execute(
                "INSERT INTO tasks (organization_id, project_id, lead_id, assignee_id, title, description,
                 status, priority, due_date, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    org_id,
                    new.project_id,
                    new.lead_id,
                    new.assignee_id,
                    new.title.trim(),
                    new.description.clone().unwrap_or_default(),
                    status.as_str(),
                    new.priority.unwrap_or_default().as_str(),
                    new.due_date,
                    position
                ],
            )
            .context("Failed to insert task")?;
        let task_id = self.last_id();
        self.conn
            .execute(SYNC_COMPLETED_AT, params![task_id])
            .context("Failed to set task completion")?;
        let task = self.get_task(org_id, task_id)?;
        tracing::debug!(org_id, task_id, status = %task.status, "task created");
        Ok(task)
    }

    pub fn list_tasks(&self, org_id: i64, filter: &TaskFilter, page: PageRequest) -> Result<Page<Task>> {
        let mut sql = SqlFilter::scoped(org_id);
        sql.push_text("status = ?", filter.status.as_ref().map(TaskStatus::as_str));
        sql.push_text("priority = ?", filter.priority.as_ref().map(Priority::as_str));
        sql.push_int("project_id = ?", filter.project_id);
        sql.push_int("lead_id = ?", filter.lead_id);
        sql.push_int("assignee_id = ?", filter.assignee_id);
        sql.push_date("due_date >= ?", filter.due_from);
        sql.push_date("due_date <= ?", filter.due_to);
        sql.push_search(&["title", "description"], filter.search.as_deref());
        self.select_page(
            "tasks",
            TASK_COLUMNS,
            &sql,
            "due_date IS NULL, due_date, id",
            page,
            task_from_row,
        )
    }

    pub fn get_task(&self, org_id: i64, id: i64) -> Result<Task> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE id = ?1 AND organization_id = ?2",
            TASK_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id, org_id], task_from_row)
            .optional()
            .context("Failed to query task")?
            .ok_or_else(|| CrmError::not_found("Task", id).into())
    }

    /// Update task fields. A status change appends the task to the end of
    /// its new column; entering `done` stamps `completed_at`, leaving it
    /// clears the stamp.
    pub fn update_task(&self, org_id: i64, id: i64, update: &TaskUpdate) -> Result<Task> {
        let mut task = self.get_task(org_id, id)?;
        if let Some(title) = &update.title {
            require_non_empty("title", title)?;
            task.title = title.trim().to_string();
        }
        if let Some(description) = &update.description {
            task.description = description.clone();
        }
        if let Some(priority) = update.priority {
            task.priority = priority;
        }
        if update.project_id.is_some() {
            self.check_owned("projects", "Project", org_id, update.project_id)?;
            task.project_id = update.project_id;
        }
        if update.lead_id.is_some() {
            self.check_owned("leads", "Lead", org_id, update.lead_id)?;
            task.lead_id = update.lead_id;
        }
        if update.assignee_id.is_some() {
            self.check_owned("users", "User", org_id, update.assignee_id)?;
            task.assignee_id = update.assignee_id;
        }
        if update.due_date.is_some() {
            task.due_date = update.due_date;
        }
        if let Some(status) = update.status.filter(|s| *s != task.status) {
            task.position = self.next_position("tasks", org_id, status.as_str())?;
            task.status = status;
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE tasks SET title = ?1, description = ?2, status = ?3, priority = ?4, project_id = ?5,
             lead_id = ?6, assignee_id = ?7, due_date = ?8, position = ?9, updated_at = datetime('now')
             WHERE id = ?10",
            params![
                task.title,
                task.description,
                task.status.as_str(),
                task.priority.as_str(),
                task.project_id,
                task.lead_id,
                task.assignee_id,
                task.due_date,
                task.position,
                id
            ],
        )
        .context("Failed to update task")?;
        tx.execute(SYNC_COMPLETED_AT, params![id])
            .context("Failed to sync task completion")?;
        tx.commit().context("Failed to commit task update")?;
        self.get_task(org_id, id)
    }

    pub fn delete_task(&self, org_id: i64, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM tasks WHERE id = ?1 AND organization_id = ?2",
                params![id, org_id],
            )
            .context("Failed to delete task")?;
        if deleted == 0 {
            return Err(CrmError::not_found("Task", id).into());
        }
        Ok(())
    }

    pub fn move_task(
        &self,
        org_id: i64,
        id: i64,
        to: TaskStatus,
        to_index: usize,
        from_index: Option<usize>,
    ) -> Result<Task> {
        let task = self.get_task(org_id, id)?;
        let mut board = Board::new();
        for status in TaskStatus::ALL {
            if status == task.status || status == to {
                board.push_column(status, self.column_ids("tasks", org_id, status.as_str())?);
            }
        }
        board
            .apply_move(&CardMove {
                item_id: id,
                from: task.status,
                from_index,
                to,
                to_index,
            })
            .map_err(|e| CrmError::Conflict(e.to_string()))?;
        self.persist_board("tasks", &board, id)?;
        self.conn
            .execute(SYNC_COMPLETED_AT, params![id])
            .context("Failed to sync task completion")?;
        tracing::debug!(org_id, task_id = id, from = %task.status, %to, "task moved");
        self.get_task(org_id, id)
    }

    /// Columns in `TaskStatus::ALL` order, optionally limited to a project.
    pub fn task_board(&self, org_id: i64, project_id: Option<i64>) -> Result<BoardView<Task>> {
        let mut filter = SqlFilter::scoped(org_id);
        filter.push_int("project_id = ?", project_id);
        let tasks = self.select_where(
            "tasks",
            TASK_COLUMNS,
            &filter,
            "ORDER BY position, id",
            &[],
            task_from_row,
        )?;
        let columns = TaskStatus::ALL
            .iter()
            .map(|status| ColumnView {
                key: status.as_str().to_string(),
                name: status.label().to_string(),
                items: tasks.iter().filter(|t| t.status == *status).cloned().collect(),
            })
            .collect();
        Ok(BoardView { columns })
    }

    // ── Service orders ────────────────────────────────────────────────

    /// Create a service order with the organization's next sequential number.
    pub fn create_service_order(&self, org_id: i64, new: &NewServiceOrder) -> Result<ServiceOrder> {
        require_non_empty("title", &new.title)?;
        self.check_owned("projects", "Project", org_id, Some(new.project_id))?;
        self.check_owned("users", "User", org_id, new.assignee_id)?;
        self.check_plan_limit(org_id, Resource::ServiceOrders)?;
        let status = new.status.unwrap_or(OsStatus::Open);
        let position = self.next_position("service_orders", org_id, status.as_str())?;

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let number: i64 = tx
            .query_row(
                "SELECT next_os_number FROM organizations WHERE id = ?1",
                params![org_id],
                |row| row.get(0),
            )
            .context("Failed to read next service order number")?;
        tx.execute(
            "INSERT INTO service_orders (organization_id, project_id, number, title, description,
             status, priority, assignee_id, due_date, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                org_id,
                new.project_id,
                number,
                new.title.trim(),
                new.description.clone().unwrap_or_default(),
                status.as_str(),
                new.priority.unwrap_or_default().as_str(),
                new.assignee_id,
                new.due_date,
                position
            ],
        )
        .context("Failed to insert service order")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE organizations SET next_os_number = next_os_number + 1 WHERE id = ?1",
            params![org_id],
        )
        .context("Failed to advance service order number")?;
        tx.commit().context("Failed to commit service order")?;

        let order = self.get_service_order(org_id, id)?;
        tracing::debug!(org_id, service_order_id = id, code = %order.code, "service order created");
        Ok(order)
    }

    pub fn list_service_orders(
        &self,
        org_id: i64,
        filter: &ServiceOrderFilter,
        page: PageRequest,
    ) -> Result<Page<ServiceOrder>> {
        let mut sql = SqlFilter::scoped(org_id);
        sql.push_text("status = ?", filter.status.as_ref().map(OsStatus::as_str));
        sql.push_text("priority = ?", filter.priority.as_ref().map(Priority::as_str));
        sql.push_int("project_id = ?", filter.project_id);
        sql.push_int("assignee_id = ?", filter.assignee_id);
        sql.push_search(&["title", "description"], filter.search.as_deref());
        self.select_page(
            "service_orders",
            SERVICE_ORDER_COLUMNS,
            &sql,
            "number DESC",
            page,
            service_order_from_row,
        )
    }

    pub fn get_service_order(&self, org_id: i64, id: i64) -> Result<ServiceOrder> {
        let sql = format!(
            "SELECT {} FROM service_orders WHERE id = ?1 AND organization_id = ?2",
            SERVICE_ORDER_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id, org_id], service_order_from_row)
            .optional()
            .context("Failed to query service order")?
            .ok_or_else(|| CrmError::not_found("Service order", id).into())
    }

    pub fn update_service_order(
        &self,
        org_id: i64,
        id: i64,
        update: &ServiceOrderUpdate,
    ) -> Result<ServiceOrder> {
        let mut order = self.get_service_order(org_id, id)?;
        if let Some(title) = &update.title {
            require_non_empty("title", title)?;
            order.title = title.trim().to_string();
        }
        if let Some(description) = &update.description {
            order.description = description.clone();
        }
        if let Some(priority) = update.priority {
            order.priority = priority;
        }
        if update.assignee_id.is_some() {
            self.check_owned("users", "User", org_id, update.assignee_id)?;
            order.assignee_id = update.assignee_id;
        }
        if update.due_date.is_some() {
            order.due_date = update.due_date;
        }
        if let Some(status) = update.status.filter(|s| *s != order.status) {
            order.position = self.next_position("service_orders", org_id, status.as_str())?;
            order.status = status;
        }
        self.conn
            .execute(
                "UPDATE service_orders SET title = ?1, description = ?2, status = ?3, priority = ?4,
                 assignee_id = ?5, due_date = ?6, position = ?7, updated_at = datetime('now')
                 WHERE id = ?8",
                params![
                    order.title,
                    order.description,
                    order.status.as_str(),
                    order.priority.as_str(),
                    order.assignee_id,
                    order.due_date,
                    order.position,
                    id
                ],
            )
            .context("Failed to update service order")?;
        self.get_service_order(org_id, id)
    }

    pub fn delete_service_order(&self, org_id: i64, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM service_orders WHERE id = ?1 AND organization_id = ?2",
                params![id, org_id],
            )
            .context("Failed to delete service order")?;
        if deleted == 0 {
            return Err(CrmError::not_found("Service order", id).into());
        }
        Ok(())
    }

    pub fn move_service_order(
        &self,
        org_id: i64,
        id: i64,
        to: OsStatus,
        to_index: usize,
        from_index: Option<usize>,
    ) -> Result<ServiceOrder> {
        let order = self.get_service_order(org_id, id)?;
        let mut board = Board::new();
        for status in OsStatus::ALL {
            if status == order.status || status == to {
                board.push_column(
                    status,
                    self.column_ids("service_orders", org_id, status.as_str())?,
                );
            }
        }
        board
            .apply_move(&CardMove {
                item_id: id,
                from: order.status,
                from_index,
                to,
                to_index,
            })
            .map_err(|e| CrmError::Conflict(e.to_string()))?;
        self.persist_board("service_orders", &board, id)?;
        tracing::debug!(org_id, service_order_id = id, from = %order.status, %to, "service order moved");
        self.get_service_order(org_id, id)
    }

    /// Columns in `OsStatus::ALL` order, optionally limited to a project.
    pub fn service_order_board(
        &self,
        org_id: i64,
        project_id: Option<i64>,
    ) -> Result<BoardView<ServiceOrder>> {
        let mut filter = SqlFilter::scoped(org_id);
        filter.push_int("project_id = ?", project_id);
        let orders = self.select_where(
            "service_orders",
            SERVICE_ORDER_COLUMNS,
            &filter,
            "ORDER BY position, id",
            &[],
            service_order_from_row,
        )?;
        let columns = OsStatus::ALL
            .iter()
            .map(|status| ColumnView {
                key: status.as_str().to_string(),
                name: status.label().to_string(),
                items: orders.iter().filter(|o| o.status == *status).cloned().collect(),
            })
            .collect();
        Ok(BoardView { columns })
    }
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        lead_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        status: parse_col(row, 5)?,
        start_date: row.get(6)?,
        due_date: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        project_id: row.get(2)?,
        lead_id: row.get(3)?,
        assignee_id: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        status: parse_col(row, 7)?,
        priority: parse_col(row, 8)?,
        due_date: row.get(9)?,
        completed_at: row.get(10)?,
        position: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn service_order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceOrder> {
    let number: i64 = row.get(3)?;
    Ok(ServiceOrder {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        project_id: row.get(2)?,
        number,
        code: service_order_code(number),
        title: row.get(4)?,
        description: row.get(5)?,
        status: parse_col(row, 6)?,
        priority: parse_col(row, 7)?,
        assignee_id: row.get(8)?,
        due_date: row.get(9)?,
        position: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
