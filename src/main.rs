//! edgelink CLI - expose a private service through a public relay
//!
//! Keeps one proxy client alive and reconnects its control channel with
//! exponential backoff when it drops.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgelink_client::{
    ClientError, ProxyClient, ProxyClientConfig, ProxyClientOptions, TlsCredentials,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// edgelink - Expose a private service through a public relay
#[derive(Parser, Debug)]
#[command(name = "edgelink")]
#[command(about = "edgelink - Expose a private service through a public relay")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register with a relay and forward its sessions to a local target
    #[command(long_about = r#"
Open a control channel to a relay, register a hostname, and bridge every
relay session to a new TCP connection to the target. Reconnects with
exponential backoff if the channel drops; sessions survive short outages.

EXAMPLES:
  # Expose a local HTTPS server
  edgelink connect --relay wss://relay.example.com \
    --hostname edge-1.example.net \
    --target-port 8443

  # Authenticate the control channel with a client certificate
  edgelink connect --relay wss://relay.example.com \
    --hostname edge-1.example.net \
    --target-host 10.0.0.5 --target-port 443 \
    --cert edge.crt --key edge.key --ca relay-ca.pem

ENVIRONMENT VARIABLES:
  EDGELINK_RELAY        Relay endpoint
  EDGELINK_HOSTNAME     Hostname to register
  EDGELINK_SERVER_TYPE  Server type to register
  EDGELINK_TARGET_HOST  Local target host
  EDGELINK_TARGET_PORT  Local target port
  EDGELINK_CERT         Client certificate (PEM file)
  EDGELINK_KEY          Client private key (PEM file)
  EDGELINK_CA           Relay CA bundle (PEM file)
    "#)]
    Connect {
        /// Relay endpoint (e.g., wss://relay.example.com)
        #[arg(long, env = "EDGELINK_RELAY")]
        relay: String,

        /// Hostname advertised to the relay
        #[arg(long, env = "EDGELINK_HOSTNAME")]
        hostname: String,

        /// Server type advertised to the relay
        #[arg(long, env = "EDGELINK_SERVER_TYPE", default_value = "HTTPS")]
        server_type: String,

        /// Host of the local service
        #[arg(long, env = "EDGELINK_TARGET_HOST", default_value = "127.0.0.1")]
        target_host: String,

        /// Port of the local service
        #[arg(long, env = "EDGELINK_TARGET_PORT")]
        target_port: u16,

        /// Client certificate (PEM)
        #[arg(long, env = "EDGELINK_CERT", requires = "key")]
        cert: Option<PathBuf>,

        /// Client private key (PEM)
        #[arg(long, env = "EDGELINK_KEY", requires = "cert")]
        key: Option<PathBuf>,

        /// CA bundle used to verify the relay (PEM); system roots otherwise
        #[arg(long, env = "EDGELINK_CA", requires = "cert")]
        ca: Option<PathBuf>,

        /// Skip certificate verification (insecure, for development only)
        #[arg(long)]
        insecure: bool,

        /// Grace window after a relay `end` before a session is closed, in milliseconds
        #[arg(long, default_value = "1000")]
        end_grace_ms: u64,

        /// How long sessions survive a dropped control channel, in seconds
        #[arg(long, default_value = "10")]
        teardown_grace: u64,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn read_pem(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} from {}", what, path.display()))
}

fn load_credentials(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    ca: Option<PathBuf>,
) -> Result<Option<TlsCredentials>> {
    let (Some(cert), Some(key)) = (cert, key) else {
        return Ok(None);
    };

    Ok(Some(TlsCredentials {
        cert: read_pem(&cert, "client certificate")?,
        key: read_pem(&key, "client key")?,
        ca: ca
            .map(|path| read_pem(&path, "CA bundle"))
            .transpose()?,
    }))
}

fn attempts_label(max_attempts: usize) -> String {
    if max_attempts == 0 {
        "∞".to_string()
    } else {
        max_attempts.to_string()
    }
}

/// A channel that stayed up this long resets the backoff when it drops
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// Delay before reconnecting after an established channel dropped
fn delay_after_drop(current: Duration, initial: Duration, uptime: Duration) -> Duration {
    if uptime >= STABLE_CONNECTION {
        initial
    } else {
        current
    }
}

/// Keep the control channel up, reconnecting with exponential backoff
async fn connect_with_reconnect(
    client: Arc<ProxyClient>,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;

        if max_attempts > 0 && attempt > max_attempts {
            error!("Maximum reconnection attempts ({}) reached", max_attempts);
            anyhow::bail!("Failed to connect after {} attempts", max_attempts);
        }

        info!(
            "Connection attempt {} (max: {})",
            attempt,
            attempts_label(max_attempts)
        );

        match client.connect().await {
            Ok(()) => {
                attempt = 0;
                let connected_at = Instant::now();

                client.wait_disconnected().await;
                warn!("Control channel lost, open sessions are kept for the teardown grace");

                current_delay = delay_after_drop(
                    current_delay,
                    initial_delay,
                    connected_at.elapsed(),
                );
                info!("Reconnecting in {} seconds...", current_delay.as_secs());
                tokio::time::sleep(current_delay).await;
                current_delay = std::cmp::min(current_delay * 2, max_delay);
            }
            Err(ClientError::ChannelClosed) => {
                info!("Client stopped");
                return Ok(());
            }
            Err(e) if e.is_non_recoverable() => {
                error!("Cannot connect: {}", e);
                return Err(e).context("Non-recoverable client error");
            }
            Err(e) => {
                error!("Connect failed: {}", e);

                if max_attempts > 0 && attempt >= max_attempts {
                    return Err(e).context("Giving up on the relay");
                }

                warn!(
                    "Reconnecting in {} seconds... (attempt {} of {})",
                    current_delay.as_secs(),
                    attempt + 1,
                    attempts_label(max_attempts)
                );

                tokio::time::sleep(current_delay).await;

                // Exponential backoff with max cap
                current_delay = std::cmp::min(current_delay * 2, max_delay);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Connect {
            relay,
            hostname,
            server_type,
            target_host,
            target_port,
            cert,
            key,
            ca,
            insecure,
            end_grace_ms,
            teardown_grace,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            info!("edgelink {} starting...", LONG_VERSION);

            let mut builder = ProxyClientConfig::builder()
                .endpoint(relay.clone())
                .hostname(hostname.clone())
                .server_type(server_type)
                .target(target_host.clone(), target_port)
                .insecure(insecure)
                .end_grace(Duration::from_millis(end_grace_ms))
                .teardown_grace(Duration::from_secs(teardown_grace));

            if let Some(credentials) = load_credentials(cert, key, ca)? {
                info!("Using client certificate for the control channel");
                builder = builder.credentials(credentials);
            }

            let config = builder.build().context("Invalid configuration")?;

            info!("Relay: {}", relay);
            info!("Hostname: {}", hostname);
            info!("Target: {}:{}", target_host, target_port);
            if insecure {
                warn!("⚠️  Certificate verification disabled (insecure mode)");
            }

            let options = ProxyClientOptions::default()
                .on_connect(|| info!("Registered with relay"))
                .on_local_server_created(|payload| info!("Relay ready: {}", payload))
                .on_connection(|session_id| debug!("New session {}", session_id));

            let client = Arc::new(
                ProxyClient::new(config, options).context("Failed to create proxy client")?,
            );

            // Setup Ctrl+C handler
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            let connect_task = tokio::spawn(connect_with_reconnect(
                client.clone(),
                max_reconnect_attempts,
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            ));

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down...");
                }
                result = connect_task => {
                    match result {
                        Ok(Ok(())) => {
                            info!("Connection stopped normally");
                        }
                        Ok(Err(e)) => {
                            error!("Connection error: {:#}", e);
                            client.destroy().await;
                            return Err(e);
                        }
                        Err(e) => {
                            error!("Connection task panicked: {}", e);
                            client.destroy().await;
                            return Err(e.into());
                        }
                    }
                }
            }

            client.destroy().await;
            info!("edgelink stopped");
            Ok(())
        }
    }
}
