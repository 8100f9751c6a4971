use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use devicebroker::balancer::LoadBalancer;
use devicebroker::config::BrokerConfig;
use devicebroker::doctor;
use devicebroker::ipc;
use devicebroker::webapp::WebAppClient;
use devicebroker::worker::pool::WorkerPool;

#[derive(Parser)]
#[command(name = "devicebroker", about = "Device broker — WebSocket device gateway with an application IPC socket", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Interface the device WebSocket server binds to.
    #[arg(long, env = "DEVICEBROKER_HOST")]
    host: Option<String>,

    /// Port the device WebSocket server binds to.
    #[arg(long, env = "DEVICEBROKER_PORT")]
    port: Option<u16>,

    /// Application-facing IPC address: `host:port` for TCP, or a filesystem
    /// path for a Unix domain socket.
    #[arg(long = "sock-name", env = "DEVICEBROKER_SOCK_NAME")]
    sock_name: Option<String>,

    /// Number of worker tasks; 0 selects one per available CPU.
    #[arg(long, env = "DEVICEBROKER_WORKERS")]
    workers: Option<usize>,

    /// Base URL of the external web application that owns device identity.
    #[arg(long = "webapp-url", env = "DEVICEBROKER_WEBAPP_URL")]
    webapp_url: Option<String>,

    /// Log level / EnvFilter directive string (e.g. "info", "debug,devicebroker=trace").
    #[arg(long, env = "DEVICEBROKER_LOG")]
    log: Option<String>,

    /// Write logs to this file path too (rotated daily).
    #[arg(long = "log-file", env = "DEVICEBROKER_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Optional TOML file overriding the built-in defaults.
    #[arg(long, env = "DEVICEBROKER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker (default when no subcommand is given).
    Serve,
    /// Check the configured ports and web application, then exit.
    ///
    /// Examples:
    ///   devicebroker doctor
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let config = BrokerConfig::new(
        args.host,
        args.port,
        args.sock_name,
        args.workers,
        args.webapp_url,
        args.log,
        args.log_file,
        args.config,
    );

    match args.command {
        Some(Command::Doctor) => {
            let results = doctor::run_doctor(&config).await;
            doctor::print_doctor_results(&results);
            let failed = results.iter().filter(|r| !r.passed).count();
            std::process::exit(if failed == 0 { 0 } else { 1 });
        }
        None | Some(Command::Serve) => run_server(config).await?,
    }

    Ok(())
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only
/// logging with a warning — never panics.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("devicebroker.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

async fn run_server(config: BrokerConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "devicebroker starting");

    let num_workers = config.resolved_worker_count();
    info!(
        host = %config.host,
        port = config.port,
        sock_name = %config.sock_name,
        workers = num_workers,
        webapp_url = %config.webapp_url,
        "config loaded"
    );

    let webapp = WebAppClient::new(config.webapp_url.clone()).context("building web application client")?;

    let (balancer, to_worker_rx) = LoadBalancer::new(num_workers);
    let (pool, from_worker_rx) = WorkerPool::spawn(webapp, to_worker_rx);

    for (worker_index, rx) in from_worker_rx.into_iter().enumerate() {
        let balancer = balancer.clone();
        tokio::spawn(async move { balancer.receive_messages_from_worker(worker_index, rx).await });
    }

    let device_listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding device websocket port {}:{}", config.host, config.port))?;
    info!(addr = %device_listener.local_addr()?, "device websocket server listening");

    let device_balancer: Arc<LoadBalancer> = balancer.clone();
    let device_server = tokio::spawn(async move {
        loop {
            match device_listener.accept().await {
                Ok((stream, peer)) => {
                    let balancer = device_balancer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = balancer.serve_device(stream, peer).await {
                            warn!(peer = %peer, err = %e, "device connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(err = %e, "failed to accept device connection"),
            }
        }
    });

    let sock_name = config.sock_name.clone();
    let ipc_balancer = balancer.clone();
    let ipc_server = tokio::spawn(async move {
        if let Err(e) = ipc::run(ipc_balancer, &sock_name).await {
            warn!(err = %e, "ipc server exited with error");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        res = device_server => {
            if let Err(e) = res {
                warn!(err = %e, "device server task panicked");
            }
        }
        res = ipc_server => {
            if let Err(e) = res {
                warn!(err = %e, "ipc server task panicked");
            }
        }
    }

    pool.stop();
    Ok(())
}
