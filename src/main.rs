//! The `mcp-composer(1)` command.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use composer_registry::DownstreamRegistry;
use mcp_composer::api::{self, AppState};
use mcp_composer::composer::Composer;
use mcp_composer::config::ConfigurationManager;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration document.
    #[arg(long, env = "MCP_SERVERS_CONFIG_PATH", default_value = "mcp-servers.json")]
    config_path: std::path::PathBuf,

    /// Base URL advertised to clients as each gateway's external endpoint prefix.
    #[arg(long, env = "MCP_COMPOSER_PROXY_URL", default_value = "http://localhost:8000")]
    proxy_url: String,

    /// HTTP bind host.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// HTTP bind port.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".to_string().into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Arc::new(ConfigurationManager::new(cli.config_path.clone()));
    let doc = config.load().await.context("loading configuration document")?;

    let registry = Arc::new(DownstreamRegistry::new());
    registry
        .initialize_all(doc.server_specs())
        .await
        .context("initializing downstream servers")?;

    let composer = Arc::new(Composer::new(registry.clone(), config.clone(), cli.proxy_url.clone()));

    for (kit_name, assignment) in doc.server_kit_assignments.clone() {
        let default_enabled = !assignment.assigned_servers.is_empty();
        composer.create_kit(&kit_name, default_enabled).ok();
        composer.add_gateway(&kit_name).ok();
    }
    if composer.list_gateway_names().is_empty() {
        composer.create_kit("default", true)?;
        composer.add_gateway("default")?;
    }
    composer
        .migrate_kits()
        .await
        .context("migrating legacy kit assignments")?;

    let app_state = AppState {
        composer: composer.clone(),
        started_at: Instant::now(),
    };

    let router = axum::Router::new()
        .nest("/api/v1", api::router(app_state))
        .merge(composer.dynamic_router());

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("parsing HOST/PORT into a socket address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(%addr, "mcp-composer listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving HTTP")?;

    tracing::info!("shutting down downstream sessions");
    registry.shutdown().await;

    Ok(())
}
