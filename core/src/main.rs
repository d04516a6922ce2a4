use clap::Parser;
use relaymq::{BrokerConfig, BrokerServer, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber;

/// Command-line overrides. Configuration is loaded from `RELAYMQ_*`
/// environment variables first; any flag given here wins over both the
/// environment and the built-in defaults.
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(about = "A multi-pattern message broker (req/res, push/pull, pub/sub)")]
struct Args {
    /// Bind host (RELAYMQ_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (RELAYMQ_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen on a unix socket path instead of TCP (RELAYMQ_SOCKET_PATH)
    #[arg(long)]
    socket_path: Option<String>,

    /// The broker's own channel name (RELAYMQ_NAME)
    #[arg(long)]
    name: Option<String>,

    /// Connection limit (RELAYMQ_MAX_CONNECTIONS)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Upper bound on a single frame, in bytes (RELAYMQ_MAX_FRAME_SIZE)
    #[arg(long)]
    max_frame_size: Option<usize>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(self, config: &mut BrokerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = self.socket_path {
            config.socket_path = Some(path);
        }
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(limit) = self.max_connections {
            config.max_connections = limit;
        }
        if let Some(limit) = self.max_frame_size {
            config.max_frame_size = limit;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let mut config = BrokerConfig::from_env()?;
    args.apply_to(&mut config);

    if let Some(ref path) = config.socket_path {
        info!("Starting RelayMQ broker '{}' on {}", config.name, path);
    } else {
        info!(
            "Starting RelayMQ broker '{}' on {}:{}",
            config.name, config.host, config.port
        );
    }

    let server = BrokerServer::new(config)?;
    let handle = server.handle();
    let metrics = server.metrics();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
        }
        _ = server_handle => {
            info!("Server task completed");
        }
    }

    info!("Final counters: {:?}", metrics.snapshot());
    info!("RelayMQ shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
