use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};

use super::{CrmDb, SqlFilter};
use crate::app::models::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeadStageCount {
    pub key: String,
    pub name: String,
    pub kind: StageKind,
    pub count: i64,
    pub value_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub status: String,
    pub label: String,
    pub count: i64,
}

/// Aggregates behind the reports page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub leads_by_stage: Vec<LeadStageCount>,
    pub total_leads: i64,
    pub won_leads: i64,
    pub lost_leads: i64,
    /// Won leads over all leads in the range, between 0 and 1.
    pub conversion_rate: f64,
    pub tasks_by_status: Vec<StatusCount>,
    pub overdue_tasks: i64,
    pub service_orders_by_status: Vec<StatusCount>,
    pub projects_by_status: Vec<StatusCount>,
}

impl CrmDb {
    /// Build the dashboard. Lead figures honour the optional created-date
    /// range; `today` decides which tasks are overdue.
    pub fn dashboard(
        &self,
        org_id: i64,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<Dashboard> {
        let mut lead_filter = SqlFilter::scoped(org_id);
        lead_filter.push_date("date(created_at) >= ?", from);
        lead_filter.push_date("date(created_at) <= ?", to);
        let sql = format!(
            "SELECT status, COUNT(*), COALESCE(SUM(value_cents), 0) FROM leads {} GROUP BY status",
            lead_filter.where_sql()
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare lead aggregates")?;
        let rows = stmt
            .query_map(params_from_iter(lead_filter.values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("Failed to query lead aggregates")?;
        let mut per_stage: HashMap<String, (i64, i64)> = HashMap::new();
        for row in rows {
            let (status, count, value) = row.context("Failed to read lead aggregate")?;
            per_stage.insert(status, (count, value));
        }

        let leads_by_stage: Vec<LeadStageCount> = self
            .list_stages(org_id)?
            .into_iter()
            .map(|stage| {
                let (count, value_cents) = per_stage.get(&stage.key).copied().unwrap_or((0, 0));
                LeadStageCount {
                    key: stage.key,
                    name: stage.name,
                    kind: stage.kind,
                    count,
                    value_cents,
                }
            })
            .collect();
        let total_leads: i64 = per_stage.values().map(|(count, _)| count).sum();
        let count_kind = |kind: StageKind| -> i64 {
            leads_by_stage
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.count)
                .sum()
        };
        let won_leads = count_kind(StageKind::Won);
        let lost_leads = count_kind(StageKind::Lost);
        let conversion_rate = if total_leads == 0 {
            0.0
        } else {
            won_leads as f64 / total_leads as f64
        };

        let tasks = self.status_counts("tasks", org_id)?;
        let service_orders = self.status_counts("service_orders", org_id)?;
        let projects = self.status_counts("projects", org_id)?;

        let overdue_tasks: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE organization_id = ?1 AND due_date IS NOT NULL AND due_date < ?2 AND status != 'done'",
                rusqlite::params![org_id, today],
                |row| row.get(0),
            )
            .context("Failed to count overdue tasks")?;

        Ok(Dashboard {
            leads_by_stage,
            total_leads,
            won_leads,
            lost_leads,
            conversion_rate,
            tasks_by_status: TaskStatus::ALL
                .iter()
                .map(|s| status_count(&tasks, s.as_str(), s.label()))
                .collect(),
            overdue_tasks,
            service_orders_by_status: OsStatus::ALL
                .iter()
                .map(|s| status_count(&service_orders, s.as_str(), s.label()))
                .collect(),
            projects_by_status: ProjectStatus::ALL
                .iter()
                .map(|s| status_count(&projects, s.as_str(), s.as_str()))
                .collect(),
        })
    }

    fn status_counts(&self, table: &str, org_id: i64) -> Result<HashMap<String, i64>> {
        let sql = format!(
            "SELECT status, COUNT(*) FROM {} WHERE organization_id = ?1 GROUP BY status",
            table
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare {} status counts", table))?;
        let rows = stmt
            .query_map([org_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .with_context(|| format!("Failed to query {} status counts", table))?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row.context("Failed to read status count")?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

fn status_count(counts: &HashMap<String, i64>, status: &str, label: &str) -> StatusCount {
    StatusCount {
        status: status.to_string(),
        label: label.to_string(),
        count: counts.get(status).copied().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seeded;
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn test_dashboard_empty_org() -> Result<()> {
        let (db, org, _) = seeded();
        let dash = db.dashboard(org.id, None, None, today())?;
        assert_eq!(dash.total_leads, 0);
        assert_eq!(dash.conversion_rate, 0.0);
        assert_eq!(dash.leads_by_stage.len(), 6);
        assert!(dash.tasks_by_status.iter().all(|s| s.count == 0));
        assert_eq!(dash.projects_by_status.len(), 5);
        Ok(())
    }

    #[test]
    fn test_dashboard_counts_and_conversion() -> Result<()> {
        let (db, org, _) = seeded();
        for (name, status, value) in [
            ("a", "novo", 100),
            ("b", "proposta", 250),
            ("c", "ganho", 1000),
            ("d", "perdido", 0),
        ] {
            db.create_lead(
                org.id,
                &NewLead {
                    name: name.into(),
                    status: Some(status.into()),
                    value_cents: Some(value),
                    ..Default::default()
                },
            )?;
        }
        let due = |d| NaiveDate::from_ymd_opt(2024, 6, d);
        db.create_task(org.id, &NewTask { title: "late".into(), due_date: due(1), ..Default::default() })?;
        db.create_task(
            org.id,
            &NewTask {
                title: "late but done".into(),
                status: Some(TaskStatus::Done),
                due_date: due(1),
                ..Default::default()
            },
        )?;
        db.create_task(org.id, &NewTask { title: "future".into(), due_date: due(30), ..Default::default() })?;

        let dash = db.dashboard(org.id, None, None, today())?;
        assert_eq!(dash.total_leads, 4);
        assert_eq!(dash.won_leads, 1);
        assert_eq!(dash.lost_leads, 1);
        assert!((dash.conversion_rate - 0.25).abs() < f64::EPSILON);
        let ganho = dash.leads_by_stage.iter().find(|s| s.key == "ganho").unwrap();
        assert_eq!(ganho.value_cents, 1000);
        assert_eq!(ganho.kind, StageKind::Won);
        assert_eq!(dash.overdue_tasks, 1);
        assert_eq!(dash.tasks_by_status[0].status, "todo");
        assert_eq!(dash.tasks_by_status[0].count, 2);

        // A range in the past excludes every lead
        let past = db.dashboard(
            org.id,
            NaiveDate::from_ymd_opt(2001, 1, 1),
            NaiveDate::from_ymd_opt(2001, 12, 31),
            today(),
        )?;
        assert_eq!(past.total_leads, 0);
        Ok(())
    }
}
