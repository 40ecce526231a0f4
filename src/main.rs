use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use mcp_gateway::commands::{router, AppState};
use mcp_gateway::{build_gateway, data_dir, init_tracing, shutdown_signal, BootstrapConfig, StoreKind};

/// Multi-user MCP gateway: per-user tool backends over stdio and
/// streamable HTTP.
#[derive(Debug, Parser)]
#[command(name = "mcp-gateway", version, about)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "MCP_GATEWAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind.
    #[arg(long, env = "MCP_GATEWAY_PORT", default_value_t = 7002)]
    port: u16,

    /// Gateway settings file (YAML or JSON) with shared `mcpServers`.
    #[arg(long, env = "MCP_GATEWAY_CONF")]
    mcp_conf: Option<PathBuf>,

    /// Directory for persisted configs and logs.
    #[arg(long, env = "MCP_GATEWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Backend config persistence.
    #[arg(long, value_enum, default_value_t = StoreKind::File)]
    store: StoreKind,

    /// Bearer token clients must present; any token is accepted when unset.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    /// Log to `gateway.log` in the data directory instead of stderr.
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(data_dir);

    init_tracing(cli.log_file.then_some(data_dir.as_path()), cli.log_json)
        .context("failed to initialize logging")?;

    if cli.api_key.is_none() {
        tracing::warn!("no API key configured; any bearer token is accepted");
    }

    let gateway = build_gateway(&BootstrapConfig {
        settings_path: cli.mcp_conf.clone(),
        data_dir,
        store: cli.store,
    })
    .await
    .context("failed to start gateway")?;

    let app = router(AppState::new(gateway.clone(), cli.api_key.clone()));
    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Release backends even if the server stopped with an error.
    gateway.shutdown().await;
    served.context("server error")?;
    tracing::info!("shutdown complete");
    Ok(())
}
