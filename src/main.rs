//! Burrow CLI - reverse tunnels from a public gateway to NAT-ed agents
//!
//! `burrow serve` runs the gateway side, `burrow connect` runs an agent.

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig};
use burrow_gateway::{AdminServer, GatewayConfig, Relay};
use burrow_transport::TunnelKey;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BURROW_COMMIT"),
    ", built ",
    env!("BURROW_BUILD_TIME"),
    ")"
);

/// Burrow - expose services behind NAT through a public gateway
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose services behind NAT through a public gateway")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway with its public listeners and admin API
    #[command(long_about = r#"
Run the gateway. Agents connect to the gateway address; every configured
tunnel rule gets its own public TCP or UDP listener. Runtime changes made
through the admin API are written back to the config file on shutdown.

EXAMPLES:
  burrow serve --config burrow.yaml
  burrow serve -c burrow.yaml --log-level debug
"#)]
    Serve {
        /// Gateway configuration file (YAML)
        #[arg(long, short = 'c', env = "BURROW_CONFIG", default_value = "burrow.yaml")]
        config: PathBuf,

        /// Log level, overrides the config file (trace, debug, info, warn, error)
        #[arg(long, env = "BURROW_LOG_LEVEL")]
        log_level: Option<String>,
    },

    /// Connect to a gateway and forward its tunnels to local services
    #[command(long_about = r#"
Connect to a gateway and serve the tunnels configured for this identity.
Reconnects with a fixed delay whenever the connection drops.

EXAMPLES:
  burrow connect --server gateway.example.com:9527 --identity agent1

  # Encrypted tunnels need the key issued by the gateway
  burrow connect --server gateway.example.com:9527 --identity agent1 \
    --key $BURROW_KEY

ENVIRONMENT VARIABLES:
  BURROW_SERVER     Gateway address
  BURROW_IDENTITY   Agent identity
  BURROW_KEY        Base64 tunnel key
"#)]
    Connect {
        /// Gateway address (host:port)
        #[arg(long, env = "BURROW_SERVER")]
        server: String,

        /// Identity registered on the gateway
        #[arg(long, env = "BURROW_IDENTITY")]
        identity: String,

        /// Base64 tunnel key for encrypted tunnels
        #[arg(long, env = "BURROW_KEY", hide_env_values = true)]
        key: Option<String>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long, env = "BURROW_LOG_LEVEL", default_value = "info")]
        log_level: String,

        /// Delay between reconnection attempts in seconds
        #[arg(long, default_value = "2")]
        reconnect_delay: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn serve(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    setup_logging(log_level.as_deref().unwrap_or(&config.log_level))?;
    info!("Burrow {} starting", VERSION);

    let admin = config.admin.clone();
    let relay = Arc::new(Relay::new(config, Some(config_path)));
    let gateway_addr = relay.start().await.context("Failed to start relay")?;
    info!("Gateway: {}", gateway_addr);

    let shutdown = CancellationToken::new();
    let admin_task = match admin {
        Some(admin) => {
            let addr = format!("{}:{}", admin.ip, admin.port);
            let server = AdminServer::bind(&addr, relay.clone(), admin.access_key)
                .await
                .with_context(|| format!("Failed to bind admin API on {}", addr))?;
            Some(tokio::spawn(server.run(shutdown.clone())))
        }
        None => {
            info!("Admin API disabled");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    if let Err(e) = relay.save_config().await {
        error!("Failed to save config: {:#}", e);
    }
    shutdown.cancel();
    if let Some(task) = admin_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Admin API error: {}", e),
            Err(e) => warn!("Admin API task panicked: {}", e),
        }
    }
    relay.shutdown().await;

    info!("Burrow stopped");
    Ok(())
}

async fn connect(
    server: String,
    identity: String,
    key: Option<String>,
    reconnect_delay: u64,
) -> Result<()> {
    let mut config = AgentConfig::new(identity.clone(), server.clone())
        .with_reconnect_delay(Duration::from_secs(reconnect_delay));
    if let Some(key) = key {
        let key = TunnelKey::from_base64(&key).context("Invalid --key")?;
        config = config.with_key(key);
    } else {
        info!("No key given, encrypted tunnels will fail");
    }

    info!("Identity: {}", identity);
    info!("Gateway: {}", server);

    let agent = Arc::new(Agent::new(config));
    let running = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    agent.stop();
    running.await.context("Agent task panicked")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, log_level } => serve(config, log_level).await,
        Commands::Connect {
            server,
            identity,
            key,
            log_level,
            reconnect_delay,
        } => {
            setup_logging(&log_level)?;
            info!("Burrow {} starting", VERSION);
            connect(server, identity, key, reconnect_delay).await
        }
    }
}
