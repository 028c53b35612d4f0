//! rv-client: exposes a local web server through an rv relay session.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rv_client::{ClusterConfig, ClusterEvent, ConfigError, TunnelCluster};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Keeps a pool of tunnels open to an rv relay and forwards relayed requests
/// to the destination the relay names.
#[derive(Parser, Debug)]
#[command(name = "rv-client", version)]
struct Args {
    /// Relay session url, e.g. https://relay.example.com/my-session
    #[arg(env = "RV_URL")]
    url: Option<String>,

    /// JSON config file; flags override its values
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Tunnels kept open while requests are flowing
    #[arg(long, env = "RV_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Milliseconds without activity before the pool shrinks to one tunnel
    #[arg(long, value_name = "MS")]
    idle_timeout: Option<u64>,

    /// Reconnect attempts before giving up
    #[arg(long)]
    retry_count: Option<u32>,

    /// Milliseconds between reconnect attempts
    #[arg(long, value_name = "MS")]
    retry_delay: Option<u64>,

    /// Stop when the relay closes the session instead of reconnecting
    #[arg(long)]
    disconnect_is_fatal: bool,

    /// Skip relay certificate verification (development only)
    #[arg(long)]
    insecure: bool,

    /// Log at debug level
    #[arg(long, short = 'v')]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<ClusterConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::from_json_file(path)?,
            None => ClusterConfig::default(),
        };

        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(ms) = self.idle_timeout {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(retry_count) = self.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(ms) = self.retry_delay {
            config.retry_delay = Duration::from_millis(ms);
        }
        config.disconnect_is_fatal |= self.disconnect_is_fatal;
        config.insecure |= self.insecure;

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(cause = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let (cluster, mut events) = match TunnelCluster::start(config) {
        Ok(started) => started,
        Err(e) => {
            error!(cause = %e, "failed to start tunnel cluster");
            return ExitCode::from(2);
        }
    };
    info!(session = cluster.session(), "tunnel cluster started");

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing tunnels");
                cluster.destroy(None).await;
                return ExitCode::SUCCESS;
            }
        };

        match event {
            Ok(ClusterEvent::Connect(id)) => debug!(tunnel = id, "tunnel ready"),
            Ok(ClusterEvent::State(state)) => info!(state = %state, "cluster state changed"),
            Ok(ClusterEvent::Reconnect(attempt)) => warn!(attempt, "relay lost, reconnecting"),
            Ok(ClusterEvent::Destroyed { error: Some(e) }) => {
                error!(code = %e.code(), cause = %e, "tunnel cluster stopped");
                return ExitCode::FAILURE;
            }
            Ok(ClusterEvent::Destroyed { error: None }) => return ExitCode::SUCCESS,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return ExitCode::SUCCESS,
        }
    }
}
