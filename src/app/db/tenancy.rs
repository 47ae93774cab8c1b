use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::{CrmDb, PageRequest, Resource, is_unique_violation};
use crate::app::models::*;
use crate::app::validate::{check_email, require_non_empty, slugify};
use crate::errors::CrmError;

const PLAN_COLUMNS: &str =
    "id, name, max_users, max_leads, max_projects, max_service_orders, price_cents, created_at";
const ORG_COLUMNS: &str = "id, name, slug, plan_id, active, created_at";
const USER_COLUMNS: &str = "id, organization_id, name, email, role, active, created_at";

impl CrmDb {
    // ── Plans ─────────────────────────────────────────────────────────

    pub fn create_plan(&self, new: &NewPlan) -> Result<Plan> {
        require_non_empty("name", &new.name)?;
        for limit in [new.max_users, new.max_leads, new.max_projects, new.max_service_orders]
            .into_iter()
            .flatten()
        {
            if limit < 0 {
                return Err(CrmError::validation("plan limits must not be negative").into());
            }
        }
        self.conn
            .execute(
                "INSERT INTO plans (name, max_users, max_leads, max_projects, max_service_orders, price_cents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.name.trim(),
                    new.max_users,
                    new.max_leads,
                    new.max_projects,
                    new.max_service_orders,
                    new.price_cents
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    anyhow::Error::from(CrmError::Conflict(format!(
                        "plan '{}' already exists",
                        new.name.trim()
                    )))
                } else {
                    anyhow::Error::from(e).context("Failed to insert plan")
                }
            })?;
        self.get_plan(self.last_id())
    }

    pub fn list_plans(&self) -> Result<Vec<Plan>> {
        let sql = format!("SELECT {} FROM plans ORDER BY price_cents, id", PLAN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_plans")?;
        let rows = stmt
            .query_map([], plan_from_row)
            .context("Failed to query plans")?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(row.context("Failed to read plan row")?);
        }
        Ok(plans)
    }

    pub fn get_plan(&self, id: i64) -> Result<Plan> {
        self.find_plan(id)?
            .ok_or_else(|| CrmError::not_found("Plan", id).into())
    }

    pub fn find_plan_by_name(&self, name: &str) -> Result<Option<Plan>> {
        let sql = format!("SELECT {} FROM plans WHERE name = ?1", PLAN_COLUMNS);
        self.conn
            .query_row(&sql, params![name.trim()], plan_from_row)
            .optional()
            .context("Failed to query plan by name")
    }

    fn find_plan(&self, id: i64) -> Result<Option<Plan>> {
        let sql = format!("SELECT {} FROM plans WHERE id = ?1", PLAN_COLUMNS);
        self.conn
            .query_row(&sql, params![id], plan_from_row)
            .optional()
            .context("Failed to query plan")
    }

    /// A negative limit in the update removes the cap. Lowering a limit
    /// below what a subscribed organization already uses is refused.
    pub fn update_plan(&self, id: i64, update: &PlanUpdate) -> Result<Plan> {
        let mut plan = self.get_plan(id)?;
        if let Some(name) = &update.name {
            require_non_empty("name", name)?;
            plan.name = name.trim().to_string();
        }
        let merge = |current: Option<i64>, next: Option<i64>| match next {
            Some(n) if n < 0 => None,
            Some(n) => Some(n),
            None => current,
        };
        plan.max_users = merge(plan.max_users, update.max_users);
        plan.max_leads = merge(plan.max_leads, update.max_leads);
        plan.max_projects = merge(plan.max_projects, update.max_projects);
        plan.max_service_orders = merge(plan.max_service_orders, update.max_service_orders);
        if let Some(price) = update.price_cents {
            plan.price_cents = price;
        }
        for org_id in self.organization_ids_on_plan(id)? {
            self.check_usage_fits(org_id, &plan)?;
        }
        self.conn
            .execute(
                "UPDATE plans SET name = ?1, max_users = ?2, max_leads = ?3, max_projects = ?4,
                 max_service_orders = ?5, price_cents = ?6 WHERE id = ?7",
                params![
                    plan.name,
                    plan.max_users,
                    plan.max_leads,
                    plan.max_projects,
                    plan.max_service_orders,
                    plan.price_cents,
                    id
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    anyhow::Error::from(CrmError::Conflict(format!(
                        "plan '{}' already exists",
                        plan.name
                    )))
                } else {
                    anyhow::Error::from(e).context("Failed to update plan")
                }
            })?;
        self.get_plan(id)
    }

    pub fn delete_plan(&self, id: i64) -> Result<()> {
        self.get_plan(id)?;
        let in_use: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM organizations WHERE plan_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to count plan subscribers")?;
        if in_use > 0 {
            return Err(CrmError::Conflict(format!(
                "plan {} is used by {} organization(s)",
                id, in_use
            ))
            .into());
        }
        self.conn
            .execute("DELETE FROM plans WHERE id = ?1", params![id])
            .context("Failed to delete plan")?;
        Ok(())
    }

    // ── Organizations ─────────────────────────────────────────────────

    /// Create an organization and seed its default pipeline stages.
    pub fn create_organization(&self, new: &NewOrganization) -> Result<Organization> {
        require_non_empty("name", &new.name)?;
        self.get_plan(new.plan_id)?;

        let slug = match new.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(explicit) => {
                let slug = slugify(explicit, '-');
                if self.slug_taken(&slug)? {
                    return Err(
                        CrmError::Conflict(format!("slug '{}' is already taken", slug)).into(),
                    );
                }
                slug
            }
            None => self.unique_slug(&new.name)?,
        };
        if slug.is_empty() {
            return Err(CrmError::validation("organization name must contain letters or digits").into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO organizations (name, slug, plan_id) VALUES (?1, ?2, ?3)",
            params![new.name.trim(), slug, new.plan_id],
        )
        .context("Failed to insert organization")?;
        let org_id = tx.last_insert_rowid();
        for (position, (key, name, color, kind)) in DEFAULT_STAGES.iter().enumerate() {
            tx.execute(
                "INSERT INTO stages (organization_id, key, name, color, position, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![org_id, key, name, color, position as i32, kind.as_str()],
            )
            .context("Failed to seed stage")?;
        }
        tx.commit().context("Failed to commit organization")?;
        tracing::debug!(org_id, %slug, "organization created");
        self.get_organization(org_id)
    }

    /// Create an organization together with its first admin. Nothing is
    /// left behind when the admin cannot be created.
    pub fn bootstrap_organization(
        &self,
        new: &NewOrganization,
        admin: &NewUser,
    ) -> Result<(Organization, User)> {
        require_non_empty("name", &admin.name)?;
        require_non_empty("email", &admin.email)?;
        check_email(Some(&admin.email))?;
        if self.find_user_by_email(&admin.email)?.is_some() {
            return Err(CrmError::Conflict(format!(
                "email '{}' is already registered",
                admin.email.trim().to_lowercase()
            ))
            .into());
        }
        let plan = self.get_plan(new.plan_id)?;
        if plan.max_users == Some(0) {
            return Err(CrmError::PlanLimitExceeded {
                resource: Resource::Users.label(),
                limit: 0,
            }
            .into());
        }

        let org = self.create_organization(new)?;
        let admin = NewUser {
            role: Some(Role::Admin),
            ..admin.clone()
        };
        match self.create_user(Some(org.id), &admin) {
            Ok(user) => Ok((org, user)),
            Err(e) => {
                self.delete_organization(org.id)
                    .context("Failed to remove organization after admin creation failed")?;
                Err(e)
            }
        }
    }

    fn slug_taken(&self, slug: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM organizations WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .context("Failed to check slug")
    }

    fn unique_slug(&self, name: &str) -> Result<String> {
        let base = slugify(name, '-');
        if base.is_empty() || !self.slug_taken(&base)? {
            return Ok(base);
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !self.slug_taken(&candidate)? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    pub fn list_organizations(&self, page: PageRequest) -> Result<Page<Organization>> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM organizations", [], |row| row.get(0))
            .context("Failed to count organizations")?;
        let sql = format!(
            "SELECT {} FROM organizations ORDER BY name COLLATE NOCASE, id LIMIT ?1 OFFSET ?2",
            ORG_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_organizations")?;
        let rows = stmt
            .query_map(params![page.limit(), page.offset()], org_from_row)
            .context("Failed to query organizations")?;
        let mut orgs = Vec::new();
        for row in rows {
            orgs.push(row.context("Failed to read organization row")?);
        }
        Ok(Page::new(orgs, page.page, page.page_size, total))
    }

    pub fn get_organization(&self, id: i64) -> Result<Organization> {
        let sql = format!("SELECT {} FROM organizations WHERE id = ?1", ORG_COLUMNS);
        self.conn
            .query_row(&sql, params![id], org_from_row)
            .optional()
            .context("Failed to query organization")?
            .ok_or_else(|| CrmError::not_found("Organization", id).into())
    }

    /// Update name, active flag or plan. Moving to a plan whose limits are
    /// below the current usage is refused.
    pub fn update_organization(&self, id: i64, update: &OrganizationUpdate) -> Result<Organization> {
        let mut org = self.get_organization(id)?;
        if let Some(name) = &update.name {
            require_non_empty("name", name)?;
            org.name = name.trim().to_string();
        }
        if let Some(active) = update.active {
            org.active = active;
        }
        if let Some(plan_id) = update.plan_id.filter(|p| *p != org.plan_id) {
            let plan = self.get_plan(plan_id)?;
            self.check_usage_fits(id, &plan)?;
            org.plan_id = plan_id;
        }
        self.conn
            .execute(
                "UPDATE organizations SET name = ?1, active = ?2, plan_id = ?3 WHERE id = ?4",
                params![org.name, org.active, org.plan_id, id],
            )
            .context("Failed to update organization")?;
        self.get_organization(id)
    }

    /// Refuse when the organization already uses more than `plan` allows.
    fn check_usage_fits(&self, org_id: i64, plan: &Plan) -> Result<()> {
        let usage = self.organization_usage(org_id)?;
        let checks = [
            (Resource::Users, usage.users, plan.max_users),
            (Resource::Leads, usage.leads, plan.max_leads),
            (Resource::Projects, usage.projects, plan.max_projects),
            (Resource::ServiceOrders, usage.service_orders, plan.max_service_orders),
        ];
        for (resource, used, limit) in checks {
            if let Some(limit) = limit.filter(|l| used > *l) {
                return Err(CrmError::Conflict(format!(
                    "organization '{}' has {} {} but plan '{}' allows {}",
                    usage.organization.name,
                    used,
                    resource.label(),
                    plan.name,
                    limit
                ))
                .into());
            }
        }
        Ok(())
    }

    fn organization_ids_on_plan(&self, plan_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM organizations WHERE plan_id = ?1 ORDER BY id")
            .context("Failed to prepare plan subscribers query")?;
        let rows = stmt
            .query_map(params![plan_id], |row| row.get::<_, i64>(0))
            .context("Failed to query plan subscribers")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read plan subscriber")?);
        }
        Ok(ids)
    }

    /// Delete an organization with everything it owns.
    pub fn delete_organization(&self, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM organizations WHERE id = ?1", params![id])
            .context("Failed to delete organization")?;
        if deleted == 0 {
            return Err(CrmError::not_found("Organization", id).into());
        }
        tracing::debug!(org_id = id, "organization deleted");
        Ok(())
    }

    pub fn organization_usage(&self, id: i64) -> Result<OrganizationUsage> {
        let organization = self.get_organization(id)?;
        let plan = self.get_plan(organization.plan_id)?;
        Ok(OrganizationUsage {
            users: self.count_for_org("users", id)?,
            leads: self.count_for_org("leads", id)?,
            projects: self.count_for_org("projects", id)?,
            service_orders: self.count_for_org("service_orders", id)?,
            organization,
            plan,
        })
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Create a user. Organization users count against the plan;
    /// superadmins are created without an organization.
    pub fn create_user(&self, org_id: Option<i64>, new: &NewUser) -> Result<User> {
        require_non_empty("name", &new.name)?;
        require_non_empty("email", &new.email)?;
        check_email(Some(&new.email))?;
        let role = new.role.unwrap_or(Role::Member);
        match (org_id, role) {
            (Some(_), Role::Superadmin) => {
                return Err(
                    CrmError::validation("superadmins cannot belong to an organization").into(),
                );
            }
            (None, Role::Admin | Role::Member) => {
                return Err(CrmError::validation("organization users need an organization").into());
            }
            _ => {}
        }
        if let Some(org_id) = org_id {
            self.get_organization(org_id)?;
            self.check_plan_limit(org_id, Resource::Users)?;
        }

        let email = new.email.trim().to_lowercase();
        self.conn
            .execute(
                "INSERT INTO users (organization_id, name, email, role) VALUES (?1, ?2, ?3, ?4)",
                params![org_id, new.name.trim(), email, role.as_str()],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    anyhow::Error::from(CrmError::Conflict(format!(
                        "email '{}' is already registered",
                        email
                    )))
                } else {
                    anyhow::Error::from(e).context("Failed to insert user")
                }
            })?;
        let user = self.get_user(self.last_id())?;
        tracing::debug!(user_id = user.id, ?org_id, role = %user.role, "user created");
        Ok(user)
    }

    pub fn list_users(&self, org_id: i64) -> Result<Vec<User>> {
        let sql = format!(
            "SELECT {} FROM users WHERE organization_id = ?1 ORDER BY name COLLATE NOCASE, id",
            USER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map(params![org_id], UserRow::from_row)
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(users)
    }

    pub fn get_user(&self, id: i64) -> Result<User> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        self.conn
            .query_row(&sql, params![id], UserRow::from_row)
            .optional()
            .context("Failed to query user")?
            .ok_or_else(|| anyhow::Error::from(CrmError::not_found("User", id)))?
            .into_user()
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS);
        self.conn
            .query_row(&sql, params![email.trim().to_lowercase()], UserRow::from_row)
            .optional()
            .context("Failed to query user by email")?
            .map(UserRow::into_user)
            .transpose()
    }

    pub fn update_user(&self, id: i64, update: &UserUpdate) -> Result<User> {
        let mut user = self.get_user(id)?;
        if let Some(name) = &update.name {
            require_non_empty("name", name)?;
            user.name = name.trim().to_string();
        }
        if let Some(role) = update.role {
            let allowed = match user.organization_id {
                Some(_) => role != Role::Superadmin,
                None => role == Role::Superadmin,
            };
            if !allowed {
                return Err(CrmError::validation(format!(
                    "role '{}' is not valid for this user",
                    role
                ))
                .into());
            }
            user.role = role;
        }
        if let Some(active) = update.active {
            user.active = active;
        }
        self.conn
            .execute(
                "UPDATE users SET name = ?1, role = ?2, active = ?3 WHERE id = ?4",
                params![user.name, user.role.as_str(), user.active, id],
            )
            .context("Failed to update user")?;
        if !user.active {
            self.conn
                .execute("DELETE FROM sessions WHERE user_id = ?1", params![id])
                .context("Failed to revoke sessions")?;
        }
        self.get_user(id)
    }

    pub fn delete_user(&self, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1", params![id])
            .context("Failed to delete user")?;
        if deleted == 0 {
            return Err(CrmError::not_found("User", id).into());
        }
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Mint a new opaque session token for a user.
    pub fn create_session(&self, user_id: i64) -> Result<String> {
        let user = self.get_user(user_id)?;
        if !user.active {
            return Err(CrmError::Forbidden(format!("user {} is inactive", user_id)).into());
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id) VALUES (?1, ?2)",
                params![token, user_id],
            )
            .context("Failed to insert session")?;
        Ok(token)
    }

    /// Resolve a session token to its user, if the token exists.
    pub fn resolve_session(&self, token: &str) -> Result<Option<User>> {
        let sql = format!(
            "SELECT {} FROM users WHERE id = (SELECT user_id FROM sessions WHERE token = ?1)",
            USER_COLUMNS
        );
        self.conn
            .query_row(&sql, params![token], UserRow::from_row)
            .optional()
            .context("Failed to resolve session")?
            .map(UserRow::into_user)
            .transpose()
    }

    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .context("Failed to delete session")?;
        Ok(deleted > 0)
    }
}

fn plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        id: row.get(0)?,
        name: row.get(1)?,
        max_users: row.get(2)?,
        max_leads: row.get(3)?,
        max_projects: row.get(4)?,
        max_service_orders: row.get(5)?,
        price_cents: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn org_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Organization> {
    Ok(Organization {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        plan_id: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

struct UserRow {
    id: i64,
    organization_id: Option<i64>,
    name: String,
    email: String,
    role: String,
    active: bool,
    created_at: String,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            role: row.get(4)?,
            active: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_user(self) -> Result<User> {
        let role = self
            .role
            .parse::<Role>()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(User {
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
            email: self.email,
            role,
            active: self.active,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seeded;
    use super::*;

    fn err_of(result: Result<impl std::fmt::Debug>) -> CrmError {
        match result.unwrap_err().downcast::<CrmError>() {
            Ok(e) => e,
            Err(other) => panic!("expected CrmError, got {other:?}"),
        }
    }

    #[test]
    fn test_create_organization_seeds_default_stages() -> Result<()> {
        let (db, org, _) = seeded();
        assert_eq!(org.slug, "acme-ltda");
        assert!(org.active);
        let stages = db.list_stages(org.id)?;
        let keys: Vec<&str> = stages.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["novo", "contato", "proposta", "negociacao", "ganho", "perdido"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_org_names_get_distinct_slugs() -> Result<()> {
        let (db, org, _) = seeded();
        let second = db.create_organization(&NewOrganization {
            name: "ACME LTDA".into(),
            plan_id: org.plan_id,
            slug: None,
        })?;
        assert_eq!(second.slug, "acme-ltda-2");

        let err = err_of(db.create_organization(&NewOrganization {
            name: "Other".into(),
            plan_id: org.plan_id,
            slug: Some("acme-ltda".into()),
        }));
        assert!(matches!(err, CrmError::Conflict(_)));
        Ok(())
    }

    #[test]
    fn test_plan_downgrade_below_usage_is_refused() -> Result<()> {
        let (db, org, _) = seeded();
        db.create_user(
            Some(org.id),
            &NewUser { name: "Bia".into(), email: "bia@acme.com".into(), role: None },
        )?;
        let tiny = db.create_plan(&NewPlan {
            name: "Solo".into(),
            max_users: Some(1),
            max_leads: None,
            max_projects: None,
            max_service_orders: None,
            price_cents: 0,
        })?;
        let err = err_of(db.update_organization(
            org.id,
            &OrganizationUpdate { plan_id: Some(tiny.id), ..Default::default() },
        ));
        assert!(matches!(err, CrmError::Conflict(_)));
        assert_eq!(db.get_organization(org.id)?.plan_id, org.plan_id);
        Ok(())
    }

    #[test]
    fn test_lowering_plan_limit_below_usage_is_refused() -> Result<()> {
        let (db, org, _) = seeded();
        for name in ["A", "B", "C"] {
            db.create_lead(org.id, &NewLead { name: name.into(), ..Default::default() })?;
        }
        let err = err_of(db.update_plan(
            org.plan_id,
            &PlanUpdate { max_leads: Some(1), ..Default::default() },
        ));
        match err {
            CrmError::Conflict(message) => {
                assert!(message.contains("Acme Ltda"), "{message}");
                assert!(message.contains("leads"), "{message}");
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(db.get_plan(org.plan_id)?.max_leads, Some(100));

        // Exactly the current usage is still allowed.
        let plan = db.update_plan(
            org.plan_id,
            &PlanUpdate { max_leads: Some(3), ..Default::default() },
        )?;
        assert_eq!(plan.max_leads, Some(3));
        Ok(())
    }

    #[test]
    fn test_bootstrap_organization_creates_admin() -> Result<()> {
        let (db, org, _) = seeded();
        let (created, admin) = db.bootstrap_organization(
            &NewOrganization { name: "Globex".into(), plan_id: org.plan_id, slug: None },
            &NewUser { name: "Gil".into(), email: "Gil@Globex.com".into(), role: None },
        )?;
        assert_eq!(created.slug, "globex");
        assert_eq!(admin.organization_id, Some(created.id));
        assert_eq!(admin.role, Role::Admin);
        assert_eq!(admin.email, "gil@globex.com");
        Ok(())
    }

    #[test]
    fn test_bootstrap_with_taken_email_leaves_no_organization() -> Result<()> {
        let (db, org, _) = seeded();
        let page = PageRequest { page: 1, page_size: 50 };
        for _ in 0..2 {
            let err = err_of(db.bootstrap_organization(
                &NewOrganization { name: "Acme Ltda".into(), plan_id: org.plan_id, slug: None },
                &NewUser { name: "Ana".into(), email: "ANA@acme.com".into(), role: None },
            ));
            assert!(matches!(err, CrmError::Conflict(_)));
        }
        assert_eq!(db.list_organizations(page)?.total, 1);

        let err = err_of(db.bootstrap_organization(
            &NewOrganization { name: "Other".into(), plan_id: org.plan_id, slug: None },
            &NewUser { name: "Otto".into(), email: "not-an-email".into(), role: None },
        ));
        assert!(matches!(err, CrmError::Validation(_)));
        assert_eq!(db.list_organizations(page)?.total, 1);
        Ok(())
    }

    #[test]
    fn test_delete_plan_in_use_is_refused() -> Result<()> {
        let (db, org, _) = seeded();
        let err = err_of(db.delete_plan(org.plan_id));
        assert!(matches!(err, CrmError::Conflict(_)));
        db.delete_organization(org.id)?;
        db.delete_plan(org.plan_id)?;
        assert!(db.list_plans()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_plan_negative_limit_removes_cap() -> Result<()> {
        let (db, org, _) = seeded();
        let plan = db.update_plan(
            org.plan_id,
            &PlanUpdate { max_leads: Some(-1), price_cents: Some(0), ..Default::default() },
        )?;
        assert_eq!(plan.max_leads, None);
        assert_eq!(plan.max_users, Some(5));
        assert_eq!(plan.price_cents, 0);
        Ok(())
    }

    #[test]
    fn test_user_plan_limit_and_duplicate_email() -> Result<()> {
        let (db, org, _) = seeded();
        for i in 0..4 {
            db.create_user(
                Some(org.id),
                &NewUser { name: format!("U{i}"), email: format!("u{i}@acme.com"), role: None },
            )?;
        }
        let err = err_of(db.create_user(
            Some(org.id),
            &NewUser { name: "Extra".into(), email: "extra@acme.com".into(), role: None },
        ));
        assert!(matches!(err, CrmError::PlanLimitExceeded { limit: 5, .. }));

        let root = db.create_user(
            None,
            &NewUser { name: "Root".into(), email: "ROOT@crm.io".into(), role: Some(Role::Superadmin) },
        )?;
        assert_eq!(root.email, "root@crm.io");
        let err = err_of(db.create_user(
            None,
            &NewUser { name: "Again".into(), email: "root@crm.io".into(), role: Some(Role::Superadmin) },
        ));
        assert!(matches!(err, CrmError::Conflict(_)));
        Ok(())
    }

    #[test]
    fn test_user_role_must_match_tenancy() {
        let (db, org, admin) = seeded();
        let err = err_of(db.create_user(
            Some(org.id),
            &NewUser { name: "X".into(), email: "x@acme.com".into(), role: Some(Role::Superadmin) },
        ));
        assert!(matches!(err, CrmError::Validation(_)));
        let err = err_of(db.update_user(
            admin.id,
            &UserUpdate { role: Some(Role::Superadmin), ..Default::default() },
        ));
        assert!(matches!(err, CrmError::Validation(_)));
    }

    #[test]
    fn test_session_lifecycle() -> Result<()> {
        let (db, _, admin) = seeded();
        let token = db.create_session(admin.id)?;
        assert_eq!(token.len(), 32);
        assert_eq!(db.resolve_session(&token)?.map(|u| u.id), Some(admin.id));
        assert!(db.resolve_session("bogus")?.is_none());

        // Deactivating a user revokes their sessions
        db.update_user(admin.id, &UserUpdate { active: Some(false), ..Default::default() })?;
        assert!(db.resolve_session(&token)?.is_none());
        assert!(matches!(err_of(db.create_session(admin.id)), CrmError::Forbidden(_)));
        Ok(())
    }

    #[test]
    fn test_delete_organization_cascades() -> Result<()> {
        let (db, org, admin) = seeded();
        db.create_lead(org.id, &NewLead { name: "Lead".into(), ..Default::default() })?;
        db.delete_organization(org.id)?;
        assert!(matches!(err_of(db.get_user(admin.id)), CrmError::NotFound { .. }));
        assert_eq!(db.count_for_org("leads", org.id)?, 0);
        assert_eq!(db.count_for_org("stages", org.id)?, 0);
        Ok(())
    }

    #[test]
    fn test_organization_usage_counts() -> Result<()> {
        let (db, org, _) = seeded();
        db.create_lead(org.id, &NewLead { name: "A".into(), ..Default::default() })?;
        db.create_lead(org.id, &NewLead { name: "B".into(), ..Default::default() })?;
        let usage = db.organization_usage(org.id)?;
        assert_eq!(usage.users, 1);
        assert_eq!(usage.leads, 2);
        assert_eq!(usage.projects, 0);
        assert_eq!(usage.plan.name, "Pro");
        let page = db.list_organizations(PageRequest::new(1, 10))?;
        assert_eq!(page.total, 1);
        Ok(())
    }
}
