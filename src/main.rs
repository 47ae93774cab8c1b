use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crm::app::import::ImportKind;
use crm::config::{CliOverrides, CrmConfig, LogFormat, LoggingSection};

mod cmd;

#[derive(Parser)]
#[command(name = "crm")]
#[command(version, about = "Multi-tenant CRM server and admin tool")]
pub struct Cli {
    /// Path to crm.toml (defaults to .crm/crm.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of the configured filter
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the database and write a default crm.toml
    Init {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create a plan, an organization and its first admin user
    Bootstrap {
        /// Organization name
        #[arg(long)]
        org: String,

        /// Plan name; created with the given limits when it does not exist
        #[arg(long)]
        plan: String,

        #[arg(long)]
        admin_email: String,

        #[arg(long)]
        admin_name: String,

        #[arg(long)]
        max_users: Option<i64>,

        #[arg(long)]
        max_leads: Option<i64>,

        #[arg(long)]
        max_projects: Option<i64>,

        #[arg(long)]
        max_service_orders: Option<i64>,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create a platform superadmin
    Superadmin {
        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Manage session tokens
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Import a CSV file into a running server, row by row
    Import {
        /// leads, tasks, service-orders, projects or users
        kind: ImportKind,

        file: PathBuf,

        #[arg(long, env = "CRM_SERVER", default_value = "http://127.0.0.1:3141")]
        server: String,

        #[arg(long, env = "CRM_TOKEN")]
        token: String,

        /// Send the whole file to the server-side importer instead
        #[arg(long)]
        upload: bool,
    },
    /// Print the CSV header line expected for an import kind
    Template { kind: ImportKind },
}

#[derive(Subcommand, Clone)]
pub enum SessionCommands {
    /// Mint a session token for a user and print it
    Create {
        #[arg(long)]
        email: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Revoke a session token
    Revoke {
        token: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

impl Commands {
    fn overrides(&self) -> CliOverrides {
        match self {
            Commands::Serve {
                host,
                port,
                db_path,
                dev,
            } => CliOverrides {
                host: host.clone(),
                port: *port,
                db_path: db_path.clone(),
                dev_mode: *dev,
            },
            Commands::Init { db_path }
            | Commands::Bootstrap { db_path, .. }
            | Commands::Superadmin { db_path, .. }
            | Commands::Session {
                command:
                    SessionCommands::Create { db_path, .. } | SessionCommands::Revoke { db_path, .. },
            } => CliOverrides {
                db_path: db_path.clone(),
                ..Default::default()
            },
            Commands::Import { .. } | Commands::Template { .. } => CliOverrides::default(),
        }
    }
}

fn init_tracing(logging: &LoggingSection, verbose: bool) -> Result<()> {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_new(&logging.filter)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match logging.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CrmConfig::resolve(cli.config.as_deref(), &cli.command.overrides())?;
    init_tracing(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(&config).await?,
        Commands::Init { .. } => cmd::cmd_init(&config, cli.config.as_deref())?,
        Commands::Bootstrap {
            org,
            plan,
            admin_email,
            admin_name,
            max_users,
            max_leads,
            max_projects,
            max_service_orders,
            ..
        } => cmd::cmd_bootstrap(
            &config,
            &cmd::BootstrapArgs {
                org: org.clone(),
                plan: plan.clone(),
                admin_email: admin_email.clone(),
                admin_name: admin_name.clone(),
                max_users: *max_users,
                max_leads: *max_leads,
                max_projects: *max_projects,
                max_service_orders: *max_service_orders,
            },
        )?,
        Commands::Superadmin { email, name, .. } => cmd::cmd_superadmin(&config, email, name)?,
        Commands::Session { command } => cmd::cmd_session(&config, command.clone())?,
        Commands::Import {
            kind,
            file,
            server,
            token,
            upload,
        } => cmd::cmd_import(*kind, file, server, token, *upload).await?,
        Commands::Template { kind } => println!("{}", kind.template().header_line()),
    }

    Ok(())
}
