use serde::Deserialize;
use std::path::PathBuf;
use tracing::error;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8001;
const DEFAULT_WEBAPP_URL: &str = "http://localhost:8000";
const DEFAULT_LOG: &str = "info";

fn default_sock_name() -> String {
    #[cfg(unix)]
    {
        default_data_dir().join("broker.sock").to_string_lossy().into_owned()
    }
    #[cfg(not(unix))]
    {
        "127.0.0.1:8002".to_string()
    }
}

/// `{config_path}` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    sock_name: Option<String>,
    workers: Option<usize>,
    webapp_url: Option<String>,
    log: Option<String>,
}

fn load_toml(path: &std::path::Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

/// Fully resolved runtime configuration for the broker process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Interface the device WebSocket server binds to.
    pub host: String,
    /// Port the device WebSocket server binds to.
    pub port: u16,
    /// Address of the application-facing IPC socket: `host:port` for TCP,
    /// or a filesystem path for a Unix domain socket.
    pub sock_name: String,
    /// Number of worker tasks; 0 means "one per available CPU".
    pub workers: usize,
    /// Base URL of the external web application.
    pub webapp_url: String,
    /// `tracing_subscriber::EnvFilter` directive string.
    pub log: String,
    /// Where logs are additionally written, if set (daily-rotated).
    pub log_file: Option<PathBuf>,
}

impl BrokerConfig {
    /// Build config from CLI/env args plus an optional TOML override file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `config_path`, if given
    ///   3. Built-in defaults
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: Option<String>,
        port: Option<u16>,
        sock_name: Option<String>,
        workers: Option<usize>,
        webapp_url: Option<String>,
        log: Option<String>,
        log_file: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Self {
        let toml = config_path.as_deref().and_then(load_toml).unwrap_or_default();

        let host = host.or(toml.host).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let sock_name = sock_name.or(toml.sock_name).unwrap_or_else(default_sock_name);
        let workers = workers.or(toml.workers).unwrap_or(0);
        let webapp_url = webapp_url.or(toml.webapp_url).unwrap_or_else(|| DEFAULT_WEBAPP_URL.to_string());
        let log = log.or(toml.log).unwrap_or_else(|| DEFAULT_LOG.to_string());

        Self { host, port, sock_name, workers, webapp_url, log, log_file }
    }

    /// Resolve `workers` against the host's CPU count: 0 means "one per core".
    pub fn resolved_worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.workers
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support").join("devicebroker");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("devicebroker");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("devicebroker");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("devicebroker");
        }
    }
    PathBuf::from(".devicebroker")
}
