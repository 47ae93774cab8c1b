//! Database provisioning commands: `crm init`, `crm bootstrap`,
//! `crm superadmin` and `crm session`.
//!
//! These talk to the SQLite file directly, so they work before any user
//! (and therefore any session) exists.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::super::SessionCommands;
use crm::app::db::CrmDb;
use crm::app::models::{NewOrganization, NewPlan, NewUser, Role};
use crm::app::server::open_database;
use crm::config::{CrmConfig, DEFAULT_CONFIG_PATH};

pub struct BootstrapArgs {
    pub org: String,
    pub plan: String,
    pub admin_email: String,
    pub admin_name: String,
    pub max_users: Option<i64>,
    pub max_leads: Option<i64>,
    pub max_projects: Option<i64>,
    pub max_service_orders: Option<i64>,
}

fn open(config: &CrmConfig) -> Result<CrmDb> {
    open_database(&config.server.db_path)
}

pub fn cmd_init(config: &CrmConfig, config_path: Option<&Path>) -> Result<()> {
    open(config)?;
    println!(
        "{} Database ready at {}",
        style("✓").green(),
        config.server.db_path.display()
    );

    let config_path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    if config_path.exists() {
        println!("Config file {} already exists, left untouched.", config_path.display());
    } else {
        config.save(config_path)?;
        println!("{} Wrote {}", style("✓").green(), config_path.display());
    }
    Ok(())
}

pub fn cmd_bootstrap(config: &CrmConfig, args: &BootstrapArgs) -> Result<()> {
    let db = open(config)?;
    if db.find_user_by_email(&args.admin_email)?.is_some() {
        anyhow::bail!("A user with email '{}' already exists", args.admin_email);
    }

    let plan = match db.find_plan_by_name(&args.plan)? {
        Some(plan) => plan,
        None => db
            .create_plan(&NewPlan {
                name: args.plan.clone(),
                max_users: args.max_users,
                max_leads: args.max_leads,
                max_projects: args.max_projects,
                max_service_orders: args.max_service_orders,
                price_cents: 0,
            })
            .context("Failed to create plan")?,
    };
    let (org, admin) = db
        .bootstrap_organization(
            &NewOrganization {
                name: args.org.clone(),
                plan_id: plan.id,
                slug: None,
            },
            &NewUser {
                name: args.admin_name.clone(),
                email: args.admin_email.clone(),
                role: Some(Role::Admin),
            },
        )
        .context("Failed to create organization")?;

    println!("{}", style("Organization created").bold().cyan());
    println!("  plan:         {} (id {})", plan.name, plan.id);
    println!("  organization: {} (slug {}, id {})", org.name, org.slug, org.id);
    println!("  admin:        {} <{}> (id {})", admin.name, admin.email, admin.id);
    println!();
    println!(
        "Run 'crm session create --email {}' to get a token.",
        admin.email
    );
    Ok(())
}

pub fn cmd_superadmin(config: &CrmConfig, email: &str, name: &str) -> Result<()> {
    let db = open(config)?;
    let user = db
        .create_user(
            None,
            &NewUser {
                name: name.to_string(),
                email: email.to_string(),
                role: Some(Role::Superadmin),
            },
        )
        .context("Failed to create superadmin")?;
    println!(
        "{} Superadmin {} <{}> created (id {})",
        style("✓").green(),
        user.name,
        user.email,
        user.id
    );
    Ok(())
}

pub fn cmd_session(config: &CrmConfig, command: SessionCommands) -> Result<()> {
    let db = open(config)?;
    match command {
        SessionCommands::Create { email, .. } => {
            let user = db
                .find_user_by_email(&email)?
                .with_context(|| format!("No user with email '{}'", email))?;
            let token = db.create_session(user.id)?;
            // Token alone on stdout so it can be captured by scripts.
            println!("{}", token);
        }
        SessionCommands::Revoke { token, .. } => {
            if db.delete_session(&token)? {
                println!("{} Session revoked", style("✓").green());
            } else {
                anyhow::bail!("Unknown session token");
            }
        }
    }
    Ok(())
}
