pub mod commands;
pub mod gateway;
pub mod mcp_client;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gateway::{
    ConfigStore, Gateway, GatewayError, GatewaySettings, JsonFileStore, KvStore, MemoryStore,
    SqliteStore,
};
use mcp_client::TransportConnector;

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/mcp-gateway/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-gateway\`
/// - Linux: `$XDG_DATA_HOME/mcp-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-gateway/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-gateway")
}

// ─── Tracing ─────────────────────────────────────────────────────────────────

/// Initialize the tracing subscriber.
///
/// With `log_dir`, logs go to `gateway.log` in that directory through a
/// line-flushing writer, after rotating earlier logs
/// (gateway.log → .1 → .2 → .3). Otherwise they go to stderr.
pub fn init_tracing(log_dir: Option<&Path>, json: bool) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let (writer, log_path) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join("gateway.log");
            rotate_log_file(&log_path, 3);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (BoxMakeWriter::new(FlushingWriter::new(log_file)), Some(log_path))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_gateway=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_path.is_none())
        .with_target(true)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "stderr".into()),
        pid = std::process::id(),
        "=== mcp-gateway starting ==="
    );
    Ok(())
}

/// Rotate log files: `gateway.log` → `gateway.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process dies.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Bootstrap ───────────────────────────────────────────────────────────────

/// Where backend configs are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    /// One JSON document per key under `<data-dir>/configs/`.
    File,
    /// `<data-dir>/gateway.db`.
    Sqlite,
    /// Nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub settings_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub store: StoreKind,
}

/// Load settings and stored configs, then build a gateway with its idle
/// sweeper running.
pub async fn build_gateway(config: &BootstrapConfig) -> Result<Arc<Gateway>, GatewayError> {
    let settings = GatewaySettings::load(config.settings_path.as_deref())?;

    let store: Arc<dyn KvStore> = match config.store {
        StoreKind::File => Arc::new(JsonFileStore::open(config.data_dir.join("configs"))?),
        StoreKind::Sqlite => {
            std::fs::create_dir_all(&config.data_dir)?;
            Arc::new(SqliteStore::open(config.data_dir.join("gateway.db"))?)
        }
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };

    let config_store = Arc::new(ConfigStore::load(store).await?);
    let global = settings.global_backends();
    tracing::info!(
        store = ?config.store,
        data_dir = %config.data_dir.display(),
        global_backends = global.len(),
        servers = ?global.keys().collect::<Vec<_>>(),
        "gateway configured"
    );
    config_store.seed_global(global);

    let connector = Arc::new(TransportConnector::new(
        settings.connect_timeout(),
        settings.call_timeout(),
    ));
    let gateway = Gateway::new(config_store, connector)
        .with_allowed_commands(settings.allowed_commands.clone());
    gateway.start_sweeper(settings.sweep_interval(), settings.idle_timeout());
    Ok(Arc::new(gateway))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C, initiating shutdown"),
            Err(e) => {
                tracing::error!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
