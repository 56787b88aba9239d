use std::sync::Arc;

use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;

use qcommerce_router::config::Config;
use qcommerce_router::context::AppContext;
use qcommerce_router::server::RouterServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Configuration and API keys are required; fail early if missing.
    let config = Config::from_env().map_err(|e| {
        format!("{e}. Set the database URLs and API keys in the environment or a .env file.")
    })?;
    let ctx = AppContext::from_config(config)?;
    info!(databases = ?ctx.databases.ids(), "Starting qcommerce-router tool server");

    let server = RouterServer::new(Arc::new(ctx));
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
