use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;

use super::{CrmDb, PageRequest, Resource, SqlFilter, is_unique_violation, merge_optional, parse_col};
use crate::app::board::{Board, CardMove};
use crate::app::models::*;
use crate::app::validate::{check_email, check_phone, non_blank, require_non_empty, slugify};
use crate::errors::CrmError;

const STAGE_COLUMNS: &str = "id, organization_id, key, name, color, position, kind";
const LEAD_COLUMNS: &str = "id, organization_id, name, email, phone, company, status, origin, value_cents, notes, assignee_id, position, created_at, updated_at";

/// Query filters for `GET /api/leads`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadFilter {
    pub status: Option<String>,
    pub origin: Option<String>,
    /// Substring match over name, email and company.
    pub search: Option<String>,
    pub assignee_id: Option<i64>,
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
}

impl CrmDb {
    // ── Stages ────────────────────────────────────────────────────────

    pub fn list_stages(&self, org_id: i64) -> Result<Vec<Stage>> {
        self.select_where(
            "stages",
            STAGE_COLUMNS,
            &SqlFilter::scoped(org_id),
            "ORDER BY position, id",
            &[],
            stage_from_row,
        )
    }

    pub fn get_stage(&self, org_id: i64, id: i64) -> Result<Stage> {
        let sql = format!(
            "SELECT {} FROM stages WHERE id = ?1 AND organization_id = ?2",
            STAGE_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id, org_id], stage_from_row)
            .optional()
            .context("Failed to query stage")?
            .ok_or_else(|| CrmError::not_found("Stage", id).into())
    }

    fn find_stage_by_key(&self, org_id: i64, key: &str) -> Result<Option<Stage>> {
        let sql = format!(
            "SELECT {} FROM stages WHERE organization_id = ?1 AND key = ?2",
            STAGE_COLUMNS
        );
        self.conn
            .query_row(&sql, params![org_id, key], stage_from_row)
            .optional()
            .context("Failed to query stage by key")
    }

    /// Append a stage at the end of the pipeline.
    pub fn create_stage(&self, org_id: i64, new: &NewStage) -> Result<Stage> {
        require_non_empty("name", &new.name)?;
        let key = match new.key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) => slugify(k, '_'),
            None => slugify(&new.name, '_'),
        };
        if key.is_empty() {
            return Err(CrmError::validation("stage key must contain letters or digits").into());
        }
        let position: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM stages WHERE organization_id = ?1",
                params![org_id],
                |row| row.get(0),
            )
            .context("Failed to get next stage position")?;
        let color = non_blank(new.color.clone()).unwrap_or_else(|| "#64748b".to_string());
        let kind = new.kind.unwrap_or(StageKind::Open);
        self.conn
            .execute(
                "INSERT INTO stages (organization_id, key, name, color, position, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![org_id, key, new.name.trim(), color, position, kind.as_str()],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    anyhow::Error::from(CrmError::Conflict(format!("stage '{}' already exists", key)))
                } else {
                    anyhow::Error::from(e).context("Failed to insert stage")
                }
            })?;
        self.get_stage(org_id, self.last_id())
    }

    pub fn update_stage(&self, org_id: i64, id: i64, update: &StageUpdate) -> Result<Stage> {
        let mut stage = self.get_stage(org_id, id)?;
        if let Some(name) = &update.name {
            require_non_empty("name", name)?;
            stage.name = name.trim().to_string();
        }
        if let Some(color) = non_blank(update.color.clone()) {
            stage.color = color;
        }
        if let Some(kind) = update.kind {
            stage.kind = kind;
        }
        self.conn
            .execute(
                "UPDATE stages SET name = ?1, color = ?2, kind = ?3 WHERE id = ?4",
                params![stage.name, stage.color, stage.kind.as_str(), id],
            )
            .context("Failed to update stage")?;
        Ok(stage)
    }

    /// Rewrite stage order. `ids` must list every stage of the
    /// organization exactly once.
    pub fn reorder_stages(&self, org_id: i64, ids: &[i64]) -> Result<Vec<Stage>> {
        let current = self.list_stages(org_id)?;
        let mut expected: Vec<i64> = current.iter().map(|s| s.id).collect();
        let mut given = ids.to_vec();
        expected.sort_unstable();
        given.sort_unstable();
        if expected != given {
            return Err(CrmError::validation(
                "stage order must list every stage of the organization exactly once",
            )
            .into());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for (position, id) in ids.iter().enumerate() {
            tx.execute(
                "UPDATE stages SET position = ?1 WHERE id = ?2",
                params![position as i32, id],
            )
            .context("Failed to reposition stage")?;
        }
        tx.commit().context("Failed to commit stage order")?;
        self.list_stages(org_id)
    }

    /// Delete a stage. Refused while leads sit in it or when it is the
    /// last stage of the pipeline.
    pub fn delete_stage(&self, org_id: i64, id: i64) -> Result<()> {
        let stage = self.get_stage(org_id, id)?;
        let mut filter = SqlFilter::scoped(org_id);
        filter.push_text("status = ?", Some(&stage.key));
        let leads = self.count_where("leads", &filter)?;
        if leads > 0 {
            return Err(CrmError::Conflict(format!(
                "stage '{}' still holds {} lead(s)",
                stage.key, leads
            ))
            .into());
        }
        if self.count_for_org("stages", org_id)? <= 1 {
            return Err(CrmError::Conflict("the pipeline needs at least one stage".into()).into());
        }
        self.conn
            .execute("DELETE FROM stages WHERE id = ?1", params![id])
            .context("Failed to delete stage")?;
        Ok(())
    }

    // ── Leads ─────────────────────────────────────────────────────────

    /// Resolve the stage a new lead lands in: the requested key, or the
    /// first stage of the pipeline.
    fn resolve_lead_status(&self, org_id: i64, requested: Option<&str>) -> Result<String> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(key) => match self.find_stage_by_key(org_id, key)? {
                Some(stage) => Ok(stage.key),
                None => Err(CrmError::validation(format!("unknown stage '{}'", key)).into()),
            },
            None => self
                .list_stages(org_id)?
                .into_iter()
                .next()
                .map(|s| s.key)
                .ok_or_else(|| CrmError::validation("no pipeline stages configured").into()),
        }
    }

    pub fn create_lead(&self, org_id: i64, new: &NewLead) -> Result<Lead> {
        require_non_empty("name", &new.name)?;
        check_email(new.email.as_deref())?;
        check_phone(new.phone.as_deref())?;
        self.check_owned("users", "User", org_id, new.assignee_id)?;
        let status = self.resolve_lead_status(org_id, new.status.as_deref())?;
        self.check_plan_limit(org_id, Resource::Leads)?;

        let position = self.next_position("leads", org_id, &status)?;
        self.conn
            .execute(
                "INSERT INTO leads (organization_id, name, email, phone, company, status, origin,
                 value_cents, notes, assignee_id, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    org_id,
                    new.name.trim(),
                    non_blank(new.email.clone()),
                    non_blank(new.phone.clone()),
                    non_blank(new.company.clone()),
                    status,
                    non_blank(new.origin.clone()),
                    new.value_cents.unwrap_or(0),
                    new.notes.clone().unwrap_or_default(),
                    new.assignee_id,
                    position
                ],
            )
            .context("Failed to insert lead")?;
        let lead = self.get_lead(org_id, self.last_id())?;
        tracing::debug!(org_id, lead_id = lead.id, status = %lead.status, "lead created");
        Ok(lead)
    }

    pub fn list_leads(&self, org_id: i64, filter: &LeadFilter, page: PageRequest) -> Result<Page<Lead>> {
        let mut sql = SqlFilter::scoped(org_id);
        sql.push_text("status = ?", filter.status.as_deref());
        sql.push_text("origin = ?", filter.origin.as_deref());
        sql.push_int("assignee_id = ?", filter.assignee_id);
        sql.push_search(&["name", "email", "company"], filter.search.as_deref());
        sql.push_date("date(created_at) >= ?", filter.created_from);
        sql.push_date("date(created_at) <= ?", filter.created_to);
        self.select_page(
            "leads",
            LEAD_COLUMNS,
            &sql,
            "created_at DESC, id DESC",
            page,
            lead_from_row,
        )
    }

    pub fn get_lead(&self, org_id: i64, id: i64) -> Result<Lead> {
        let sql = format!(
            "SELECT {} FROM leads WHERE id = ?1 AND organization_id = ?2",
            LEAD_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id, org_id], lead_from_row)
            .optional()
            .context("Failed to query lead")?
            .ok_or_else(|| CrmError::not_found("Lead", id).into())
    }

    /// Update lead fields. Status changes go through [`CrmDb::move_lead`].
    pub fn update_lead(&self, org_id: i64, id: i64, update: &LeadUpdate) -> Result<Lead> {
        let mut lead = self.get_lead(org_id, id)?;
        if let Some(name) = &update.name {
            require_non_empty("name", name)?;
            lead.name = name.trim().to_string();
        }
        check_email(update.email.as_deref())?;
        check_phone(update.phone.as_deref())?;
        self.check_owned("users", "User", org_id, update.assignee_id)?;
        lead.email = merge_optional(lead.email, update.email.clone());
        lead.phone = merge_optional(lead.phone, update.phone.clone());
        lead.company = merge_optional(lead.company, update.company.clone());
        lead.origin = merge_optional(lead.origin, update.origin.clone());
        if let Some(value) = update.value_cents {
            lead.value_cents = value;
        }
        if let Some(notes) = &update.notes {
            lead.notes = notes.clone();
        }
        if update.assignee_id.is_some() {
            lead.assignee_id = update.assignee_id;
        }
        self.conn
            .execute(
                "UPDATE leads SET name = ?1, email = ?2, phone = ?3, company = ?4, origin = ?5,
                 value_cents = ?6, notes = ?7, assignee_id = ?8, updated_at = datetime('now')
                 WHERE id = ?9",
                params![
                    lead.name,
                    lead.email,
                    lead.phone,
                    lead.company,
                    lead.origin,
                    lead.value_cents,
                    lead.notes,
                    lead.assignee_id,
                    id
                ],
            )
            .context("Failed to update lead")?;
        self.get_lead(org_id, id)
    }

    pub fn delete_lead(&self, org_id: i64, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM leads WHERE id = ?1 AND organization_id = ?2",
                params![id, org_id],
            )
            .context("Failed to delete lead")?;
        if deleted == 0 {
            return Err(CrmError::not_found("Lead", id).into());
        }
        Ok(())
    }

    /// Drag a lead card to `to_status` at `to_index`, updating the order of
    /// both columns and, across columns, the lead's status.
    pub fn move_lead(
        &self,
        org_id: i64,
        id: i64,
        to_status: &str,
        to_index: usize,
        from_index: Option<usize>,
    ) -> Result<Lead> {
        let lead = self.get_lead(org_id, id)?;
        let target = self
            .find_stage_by_key(org_id, to_status.trim())?
            .ok_or_else(|| CrmError::validation(format!("unknown stage '{}'", to_status.trim())))?;

        let mut board = Board::new();
        board.push_column(lead.status.clone(), self.column_ids("leads", org_id, &lead.status)?);
        if target.key != lead.status {
            board.push_column(target.key.clone(), self.column_ids("leads", org_id, &target.key)?);
        }
        let outcome = board
            .apply_move(&CardMove {
                item_id: id,
                from: lead.status.clone(),
                from_index,
                to: target.key.clone(),
                to_index,
            })
            .map_err(|e| CrmError::Conflict(e.to_string()))?;
        self.persist_board("leads", &board, id)?;
        tracing::debug!(
            org_id,
            lead_id = id,
            from = %lead.status,
            to = %target.key,
            index = outcome.index,
            "lead moved"
        );
        self.get_lead(org_id, id)
    }

    /// One column per stage, in pipeline order.
    pub fn lead_board(&self, org_id: i64) -> Result<BoardView<Lead>> {
        let stages = self.list_stages(org_id)?;
        let leads = self.select_where(
            "leads",
            LEAD_COLUMNS,
            &SqlFilter::scoped(org_id),
            "ORDER BY position, id",
            &[],
            lead_from_row,
        )?;
        let mut columns: Vec<ColumnView<Lead>> = stages
            .into_iter()
            .map(|s| ColumnView {
                key: s.key,
                name: s.name,
                items: Vec::new(),
            })
            .collect();
        for lead in leads {
            if let Some(col) = columns.iter_mut().find(|c| c.key == lead.status) {
                col.items.push(lead);
            }
        }
        Ok(BoardView { columns })
    }
}

fn stage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Stage> {
    Ok(Stage {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        color: row.get(4)?,
        position: row.get(5)?,
        kind: parse_col(row, 6)?,
    })
}

fn lead_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        company: row.get(5)?,
        status: row.get(6)?,
        origin: row.get(7)?,
        value_cents: row.get(8)?,
        notes: row.get(9)?,
        assignee_id: row.get(10)?,
        position: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seeded;
    use super::*;

    fn lead(db: &CrmDb, org_id: i64, name: &str, status: Option<&str>) -> Lead {
        db.create_lead(
            org_id,
            &NewLead {
                name: name.into(),
                status: status.map(String::from),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn ids(db: &CrmDb, org_id: i64, status: &str) -> Vec<i64> {
        db.column_ids("leads", org_id, status).unwrap()
    }

    #[test]
    fn test_create_lead_defaults_to_first_stage() -> Result<()> {
        let (db, org, _) = seeded();
        let l = lead(&db, org.id, "Padaria Pão Quente", None);
        assert_eq!(l.status, "novo");
        assert_eq!(l.position, 0);

        // Reordering the pipeline changes the default
        let stages = db.list_stages(org.id)?;
        let mut order: Vec<i64> = stages.iter().map(|s| s.id).collect();
        order.rotate_left(1);
        db.reorder_stages(org.id, &order)?;
        assert_eq!(lead(&db, org.id, "Second", None).status, "contato");
        Ok(())
    }

    #[test]
    fn test_create_lead_rejects_unknown_stage_and_bad_email() {
        let (db, org, _) = seeded();
        let err = db
            .create_lead(org.id, &NewLead { name: "X".into(), status: Some("limbo".into()), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<CrmError>(), Some(CrmError::Validation(_))));

        let err = db
            .create_lead(org.id, &NewLead { name: "X".into(), email: Some("x.com".into()), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<CrmError>(), Some(CrmError::Validation(_))));
    }

    #[test]
    fn test_leads_append_to_end_of_column() {
        let (db, org, _) = seeded();
        let a = lead(&db, org.id, "A", Some("proposta"));
        let b = lead(&db, org.id, "B", Some("proposta"));
        assert_eq!(a.position, 0);
        assert_eq!(b.position, 1);
    }

    #[test]
    fn test_move_lead_across_columns() -> Result<()> {
        let (db, org, _) = seeded();
        let x = lead(&db, org.id, "X", Some("novo"));
        let y = lead(&db, org.id, "Y", Some("novo"));
        let b: Vec<i64> = ["B1", "B2", "B3"]
            .iter()
            .map(|n| lead(&db, org.id, n, Some("contato")).id)
            .collect();

        let moved = db.move_lead(org.id, x.id, "contato", 2, Some(0))?;
        assert_eq!(moved.status, "contato");
        assert_eq!(moved.position, 2);
        assert_eq!(ids(&db, org.id, "novo"), vec![y.id]);
        assert_eq!(ids(&db, org.id, "contato"), vec![b[0], b[1], x.id, b[2]]);
        assert_eq!(db.get_lead(org.id, y.id)?.position, 0);
        Ok(())
    }

    #[test]
    fn test_move_lead_within_column_reorders() -> Result<()> {
        let (db, org, _) = seeded();
        let a = lead(&db, org.id, "A", None);
        let b = lead(&db, org.id, "B", None);
        let c = lead(&db, org.id, "C", None);
        let moved = db.move_lead(org.id, c.id, "novo", 0, Some(2))?;
        assert_eq!(moved.status, "novo");
        assert_eq!(ids(&db, org.id, "novo"), vec![c.id, a.id, b.id]);
        Ok(())
    }

    #[test]
    fn test_move_lead_to_unknown_stage_is_rejected() {
        let (db, org, _) = seeded();
        let a = lead(&db, org.id, "A", None);
        let err = db.move_lead(org.id, a.id, "nowhere", 0, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<CrmError>(), Some(CrmError::Validation(_))));
    }

    #[test]
    fn test_other_tenant_lead_is_not_found() -> Result<()> {
        let (db, org, _) = seeded();
        let other = db.create_organization(&NewOrganization {
            name: "Other".into(),
            plan_id: org.plan_id,
            slug: None,
        })?;
        let l = lead(&db, org.id, "Mine", None);
        let err = db.get_lead(other.id, l.id).unwrap_err();
        assert!(matches!(err.downcast_ref::<CrmError>(), Some(CrmError::NotFound { .. })));
        assert!(db.delete_lead(other.id, l.id).is_err());
        assert!(db.move_lead(other.id, l.id, "contato", 0, None).is_err());
        Ok(())
    }

    #[test]
    fn test_list_leads_filters_and_paginates() -> Result<()> {
        let (db, org, _) = seeded();
        for i in 0..5 {
            db.create_lead(
                org.id,
                &NewLead {
                    name: format!("Lead {i}"),
                    company: Some(if i % 2 == 0 { "Padaria".into() } else { "Oficina".into() }),
                    origin: Some("site".into()),
                    ..Default::default()
                },
            )?;
        }
        lead(&db, org.id, "Won", Some("ganho"));

        let page = db.list_leads(org.id, &LeadFilter::default(), PageRequest::new(1, 4))?;
        assert_eq!(page.total, 6);
        assert_eq!(page.items.len(), 4);
        assert_eq!(page.total_pages, 2);

        let filter = LeadFilter { search: Some("PADA".into()), ..Default::default() };
        assert_eq!(db.list_leads(org.id, &filter, PageRequest::default())?.total, 3);

        let filter = LeadFilter { status: Some("ganho".into()), ..Default::default() };
        assert_eq!(db.list_leads(org.id, &filter, PageRequest::default())?.items[0].name, "Won");

        let filter = LeadFilter {
            created_from: Some(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()),
            created_to: Some(NaiveDate::from_ymd_opt(2000, 12, 31).unwrap()),
            ..Default::default()
        };
        assert_eq!(db.list_leads(org.id, &filter, PageRequest::default())?.total, 0);
        Ok(())
    }

    #[test]
    fn test_update_lead_merges_and_clears_fields() -> Result<()> {
        let (db, org, admin) = seeded();
        let l = db.create_lead(
            org.id,
            &NewLead { name: "A".into(), phone: Some("(11) 98765-4321".into()), ..Default::default() },
        )?;
        let updated = db.update_lead(
            org.id,
            l.id,
            &LeadUpdate {
                phone: Some(String::new()),
                company: Some("Acme".into()),
                assignee_id: Some(admin.id),
                value_cents: Some(150_00),
                ..Default::default()
            },
        )?;
        assert_eq!(updated.phone, None);
        assert_eq!(updated.company.as_deref(), Some("Acme"));
        assert_eq!(updated.assignee_id, Some(admin.id));
        assert_eq!(updated.value_cents, 15000);
        assert_eq!(updated.status, l.status);
        Ok(())
    }

    #[test]
    fn test_stage_lifecycle() -> Result<()> {
        let (db, org, _) = seeded();
        let stage = db.create_stage(
            org.id,
            &NewStage { name: "Pós-venda".into(), key: None, color: None, kind: None },
        )?;
        assert_eq!(stage.key, "pos_venda");
        assert_eq!(stage.position, 6);

        let dup = db
            .create_stage(org.id, &NewStage { name: "Pos venda".into(), key: None, color: None, kind: None })
            .unwrap_err();
        assert!(matches!(dup.downcast_ref::<CrmError>(), Some(CrmError::Conflict(_))));

        let renamed = db.update_stage(
            org.id,
            stage.id,
            &StageUpdate { name: Some("Suporte".into()), kind: Some(StageKind::Won), ..Default::default() },
        )?;
        assert_eq!(renamed.key, "pos_venda");
        assert_eq!(renamed.kind, StageKind::Won);

        lead(&db, org.id, "Busy", Some("pos_venda"));
        let err = db.delete_stage(org.id, stage.id).unwrap_err();
        assert!(matches!(err.downcast_ref::<CrmError>(), Some(CrmError::Conflict(_))));
        Ok(())
    }

    #[test]
    fn test_reorder_stages_requires_permutation() -> Result<()> {
        let (db, org, _) = seeded();
        let stages = db.list_stages(org.id)?;
        let mut order: Vec<i64> = stages.iter().map(|s| s.id).collect();
        order.pop();
        let err = db.reorder_stages(org.id, &order).unwrap_err();
        assert!(matches!(err.downcast_ref::<CrmError>(), Some(CrmError::Validation(_))));

        let mut reversed: Vec<i64> = stages.iter().map(|s| s.id).collect();
        reversed.reverse();
        let reordered = db.reorder_stages(org.id, &reversed)?;
        assert_eq!(reordered[0].key, "perdido");
        Ok(())
    }

    #[test]
    fn test_lead_board_follows_stage_order() -> Result<()> {
        let (db, org, _) = seeded();
        let a = lead(&db, org.id, "A", Some("proposta"));
        let b = lead(&db, org.id, "B", Some("proposta"));
        db.move_lead(org.id, b.id, "proposta", 0, None)?;
        let board = db.lead_board(org.id)?;
        assert_eq!(board.columns.len(), 6);
        assert_eq!(board.columns[0].key, "novo");
        let proposta = &board.columns[2];
        assert_eq!(proposta.name, "Proposta");
        let order: Vec<i64> = proposta.items.iter().map(|l| l.id).collect();
        assert_eq!(order, vec![b.id, a.id]);
        Ok(())
    }
}
