//! HTTP server command: `crm serve`.

use anyhow::Result;

use crm::app::server::{ServerConfig, start_server};
use crm::config::CrmConfig;

pub async fn cmd_serve(config: &CrmConfig) -> Result<()> {
    start_server(ServerConfig::from(config)).await
}
