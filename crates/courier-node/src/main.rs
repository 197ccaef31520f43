//! Courier node daemon.
//!
//! Runs either role of the courier overlay network: a relay that accepts
//! encrypted letters onto its block ledger, or the directory authority that
//! tracks relays and publishes the canonical chain manifest.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use courier_directory::{DirectoryApp, Prober, Registry};
use courier_relay::RelayNode;

/// Courier overlay network node.
#[derive(Parser, Debug)]
#[command(name = "courier-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COURIER_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Log format (plain, json)
    #[arg(long, env = "COURIER_LOG_FORMAT", default_value = "plain", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a relay node.
    Relay {
        /// Path to the data directory
        #[arg(short, long, env = "COURIER_DATA_DIR", default_value = "./courier-data")]
        data_dir: PathBuf,

        /// Listen address for the relay API
        #[arg(short, long, env = "COURIER_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        /// Base URL of the directory authority
        #[arg(long, env = "COURIER_DIRECTORY_URL")]
        directory_url: Option<String>,

        /// URL this relay runs on
        #[arg(long, env = "COURIER_PUBLIC_URL")]
        public_url: Option<String>,

        /// URL external callers should use (forces the public URL)
        #[arg(long, env = "COURIER_PUBLIC_ACCESS_URL")]
        public_access_url: Option<String>,

        /// Onion address (falls back to the relay fingerprint)
        #[arg(long, env = "COURIER_ONION")]
        onion: Option<String>,

        /// Operator-chosen display name
        #[arg(long, env = "COURIER_NICKNAME")]
        nickname: Option<String>,
    },

    /// Run the directory authority.
    Directory {
        /// Path to the data directory
        #[arg(short, long, env = "COURIER_DATA_DIR", default_value = "./courier-data")]
        data_dir: PathBuf,

        /// Listen address for the directory API
        #[arg(short, long, env = "COURIER_LISTEN_ADDR", default_value = "127.0.0.1:7000")]
        listen: SocketAddr,
    },
}

fn setup_logging(log_level: &str, log_format: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    match log_format.to_lowercase().as_str() {
        "json" => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
        _ => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Command::Relay {
            data_dir,
            listen,
            directory_url,
            public_url,
            public_access_url,
            onion,
            nickname,
        } => {
            run_relay(
                data_dir,
                listen,
                directory_url,
                public_url,
                public_access_url,
                onion,
                nickname,
            )
            .await
        }
        Command::Directory { data_dir, listen } => run_directory(data_dir, listen).await,
    }
}

async fn run_relay(
    data_dir: PathBuf,
    listen: SocketAddr,
    directory_url: Option<String>,
    public_url: Option<String>,
    public_access_url: Option<String>,
    onion: Option<String>,
    nickname: Option<String>,
) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        listen = %listen,
        "Starting courier relay"
    );

    let node = RelayNode::init(&data_dir).context("Failed to initialize relay")?;

    // CLI flags override the persisted config.
    {
        let mut config = node.state.config.write().await;
        if let Some(url) = directory_url {
            config.directory_url = Some(url);
        }
        if let Some(url) = public_url {
            config.public_url = Some(url);
        }
        if let Some(url) = public_access_url {
            config.public_access_url = Some(url);
        }
        if let Some(onion) = onion {
            config.onion = onion;
        }
        if let Some(nickname) = nickname {
            config.nickname = Some(nickname);
        }
        if config.public_url.is_none() {
            config.public_url = Some(format!("http://{}", listen));
        }
        config.align_access_url();
        config
            .save(&node.state.config_path)
            .context("Failed to persist relay config")?;
    }

    node.start().await;

    let router = courier_relay::http::router(Arc::clone(&node));
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(listen = %listen, "Relay API listening");

    let shutdown_node = Arc::clone(&node);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
            shutdown_node.shutdown();
        })
        .await
        .context("Relay server failed")?;

    info!("Courier relay stopped");
    Ok(())
}

async fn run_directory(data_dir: PathBuf, listen: SocketAddr) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        listen = %listen,
        "Starting courier directory"
    );

    let registry = Arc::new(
        Registry::open(&data_dir.join("directory")).context("Failed to open registry")?,
    );
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let prober = Prober::from_env(Arc::clone(&registry), http.clone());
    tokio::spawn(prober.run(shutdown_rx));

    let app = DirectoryApp {
        registry,
        http,
    };
    let router = courier_directory::router(app)
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(listen = %listen, "Directory API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
            if shutdown_tx.send(true).is_err() {
                warn!("Probe poller already stopped");
            }
        })
        .await
        .context("Directory server failed")?;

    info!("Courier directory stopped");
    Ok(())
}
