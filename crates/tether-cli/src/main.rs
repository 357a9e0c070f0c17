//! TETHER relay daemon
//!
//! Pairs remote-access clients and hosts that cannot connect directly and
//! relays their traffic.

mod config;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_relay::{PeerToRelay, ResourcePool, SessionDelegate, SessionManager};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use config::Config;

/// TETHER - identity-matching relay for remote access sessions
#[derive(Parser)]
#[command(name = "tether-relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Run {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// Resource pool size (overrides the config file)
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,

    /// Write a default configuration file
    InitConfig {
        /// Output path (defaults to the standard config location)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Connect to a relay with an identity and pipe stdin/stdout through it
    Connect {
        /// Relay address
        #[arg(required = true)]
        relay: SocketAddr,

        /// Key identifier
        #[arg(long)]
        key_id: u32,

        /// Secret, hex encoded
        #[arg(long)]
        secret: String,
    },
}

/// Process-level accounting of relay sessions
#[derive(Default)]
struct ProcessMetrics {
    started: AtomicU64,
    finished: AtomicU64,
    exhausted: AtomicU64,
}

impl SessionDelegate for ProcessMetrics {
    fn on_session_finished(&self) {
        let finished = self.finished.fetch_add(1, Ordering::Relaxed) + 1;
        let started = self.started.load(Ordering::Relaxed);
        tracing::debug!(
            finished,
            running = started.saturating_sub(finished),
            "Relay session finished"
        );
    }

    fn on_session_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_pool_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Run { bind, pool_size } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.relay.listen_addr = bind;
            }
            if let Some(pool_size) = pool_size {
                config.relay.pool_size = pool_size;
            }
            config.validate()?;
            run_relay(&config).await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!("Configuration OK");
        }
        Commands::InitConfig { output } => {
            let path = output.unwrap_or_else(Config::default_path);
            if path.exists() {
                anyhow::bail!("Refusing to overwrite existing file: {}", path.display());
            }
            Config::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        Commands::Connect {
            relay,
            key_id,
            secret,
        } => {
            connect(relay, key_id, &secret).await?;
        }
    }

    Ok(())
}

/// Run the relay until Ctrl+C
async fn run_relay(config: &Config) -> anyhow::Result<()> {
    let relay_config = config.relay_config()?;
    let pool = ResourcePool::new(relay_config.pool_size, relay_config.buffer_size);
    let metrics = Arc::new(ProcessMetrics::default());

    let manager = SessionManager::bind(relay_config).await?;
    let addr = manager.local_addr()?;
    let handle = manager.start(pool, Arc::clone(&metrics) as Arc<dyn SessionDelegate>);

    println!("Relay listening on {addr}");
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let stats = handle.stats();
    handle.shutdown().await;

    tracing::info!(
        accepted = stats.accepted,
        pairs = stats.pairs_formed,
        finished = metrics.finished.load(Ordering::Relaxed),
        handshakes_failed = stats.handshakes_failed,
        pool_exhausted = metrics.exhausted.load(Ordering::Relaxed),
        bytes = stats.bytes_relayed,
        "Relay stopped"
    );

    Ok(())
}

/// Present an identity to a relay, then bridge stdin/stdout with the peer
async fn connect(relay: SocketAddr, key_id: u32, secret: &str) -> anyhow::Result<()> {
    let secret = hex::decode(secret).map_err(|e| anyhow::anyhow!("Invalid hex secret: {e}"))?;
    if secret.is_empty() {
        anyhow::bail!("Secret must not be empty");
    }

    let mut stream = TcpStream::connect(relay).await?;
    stream
        .write_all(&PeerToRelay::new(key_id, secret).encode_frame()?)
        .await?;
    tracing::info!(%relay, key_id, "Identity sent, waiting for peer");

    let received = bridge(stream, tokio::io::stdin(), tokio::io::stdout()).await?;

    tracing::info!(received, "Relay connection closed");
    Ok(())
}

/// Copy `input` into `stream` and `stream` into `output` until the relay
/// closes the connection. Returns the number of bytes received.
///
/// The write half stays open after `input` ends: the relay tears the pair
/// down on the first FIN, which would drop the peer's reply.
async fn bridge<S, I, O>(stream: S, mut input: I, mut output: O) -> std::io::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let upload = tokio::io::copy(&mut input, &mut writer);
    let download = async {
        let received = tokio::io::copy(&mut reader, &mut output).await?;
        output.flush().await?;
        Ok::<_, std::io::Error>(received)
    };
    tokio::pin!(upload, download);

    tokio::select! {
        received = &mut download => received,
        sent = &mut upload => {
            let sent = sent?;
            tracing::debug!(sent, "Input finished, waiting for the peer to close");
            download.await
        }
    }
}
