//! Warren reverse tunnel
//!
//! Exposes a service on a private network through a publicly reachable relay.
//!
//! - `warren relay` runs on the public host. Agents connect to its control
//!   endpoint, callers to its public endpoint.
//! - `warren agent` runs next to the private service and keeps a pool of
//!   outbound tunnels open to the relay.
//! - `warren forward` is a plain TCP port forwarder.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod forward;
mod protocol;
mod server;
mod traffic;

use client::ClientPool;
use config::{
    AgentConfig, AgentSettings, Config, ForwardConfig, ForwardSettings, PairingMode, RelayConfig,
    RelaySettings,
};
use forward::Forwarder;
use server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "warren")]
#[command(author, version, about = "Reach a private service through a public relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true, env = "WARREN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    Relay(RelayArgs),

    /// Run the agent next to the private service
    Agent(AgentArgs),

    /// Forward a local port to another address
    Forward(ForwardArgs),

    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Parser, Debug)]
struct RelayArgs {
    /// Address agents connect to
    #[arg(long, env = "WARREN_CONTROL_ADDR")]
    control: Option<String>,

    /// Address public callers connect to
    #[arg(long, env = "WARREN_PUBLIC_ADDR")]
    public: Option<String>,

    /// Most idle tunnels held at once
    #[arg(long, env = "WARREN_POOL_CAPACITY")]
    pool_capacity: Option<usize>,

    /// What to do when a caller arrives and no tunnel is idle
    #[arg(long, value_enum, env = "WARREN_PAIRING")]
    pairing: Option<PairingMode>,

    /// How long `--pairing wait` holds a caller, in milliseconds
    #[arg(long, env = "WARREN_PAIRING_WAIT_MS")]
    pairing_wait_ms: Option<u64>,

    /// Body of the 503 response sent when no tunnel is available
    #[arg(long, env = "WARREN_UNAVAILABLE_MESSAGE")]
    unavailable_message: Option<String>,
}

impl RelayArgs {
    fn into_overrides(self) -> RelayConfig {
        RelayConfig {
            control_addr: self.control,
            public_addr: self.public,
            pool_capacity: self.pool_capacity,
            pairing: self.pairing,
            pairing_wait_ms: self.pairing_wait_ms,
            unavailable_message: self.unavailable_message,
        }
    }
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Relay control endpoint (host:port)
    #[arg(short, long, env = "WARREN_RELAY_ADDR")]
    server: Option<String>,

    /// Local service address (host:port)
    #[arg(short, long, env = "WARREN_LOCAL_ADDR", conflicts_with = "port")]
    local: Option<String>,

    /// Local service port on localhost
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of tunnels kept open
    #[arg(short = 'n', long, env = "WARREN_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Wait between relay connection attempts, in milliseconds
    #[arg(long, env = "WARREN_RETRY_INTERVAL_MS")]
    retry_interval_ms: Option<u64>,

    /// Random extra wait added to each retry, in milliseconds
    #[arg(long, env = "WARREN_RETRY_JITTER_MS")]
    retry_jitter_ms: Option<u64>,

    /// Give up after this many consecutive failed relay connections
    #[arg(long, env = "WARREN_RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<u32>,

    /// Size of the first read from a paired tunnel, in bytes
    #[arg(long, env = "WARREN_CHUNK_SIZE")]
    chunk_size: Option<usize>,
}

impl AgentArgs {
    fn into_overrides(self) -> AgentConfig {
        let local_addr = self
            .local
            .or_else(|| self.port.map(|port| format!("localhost:{}", port)));
        AgentConfig {
            relay_addr: self.server,
            local_addr,
            pool_size: self.pool_size,
            retry_interval_ms: self.retry_interval_ms,
            retry_jitter_ms: self.retry_jitter_ms,
            retry_max_attempts: self.retry_max_attempts,
            chunk_size: self.chunk_size,
        }
    }
}

#[derive(Parser, Debug)]
struct ForwardArgs {
    /// Address to accept connections on
    #[arg(short, long, env = "WARREN_FORWARD_LISTEN")]
    listen: Option<String>,

    /// Address each connection is forwarded to
    #[arg(short, long, env = "WARREN_FORWARD_TARGET")]
    target: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the config file location and contents
    Show,

    /// Print the config file location
    Path,

    /// Write a config file with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    match cli.command {
        Some(Commands::Relay(args)) => {
            let config = Config::load_from(&config_path)?;
            run_relay(args, &config).await
        }
        Some(Commands::Agent(args)) => {
            let config = Config::load_from(&config_path)?;
            run_agent(args, &config).await
        }
        Some(Commands::Forward(args)) => {
            let config = Config::load_from(&config_path)?;
            run_forward(args, &config).await
        }
        Some(Commands::Config { action }) => run_config(action, &config_path),
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  warren relay                          Accept agents on :9000, callers on :8000");
            eprintln!("  warren agent -s <relay>:9000 -p 3000  Expose localhost:3000 through the relay");
            eprintln!("  warren config init                    Write a config file with the defaults");
            std::process::exit(1);
        }
    }
}

async fn run_relay(args: RelayArgs, config: &Config) -> Result<()> {
    let settings = RelaySettings::resolve(args.into_overrides(), &config.relay)?;
    let server = RelayServer::bind(settings)
        .await
        .context("Failed to start relay")?;
    server.run_until(shutdown_signal()).await?;
    Ok(())
}

async fn run_agent(args: AgentArgs, config: &Config) -> Result<()> {
    let settings = AgentSettings::resolve(args.into_overrides(), &config.agent)?;
    let pool = ClientPool::new(settings);

    tokio::select! {
        _ = pool.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, closing tunnels"),
    }
    Ok(())
}

async fn run_forward(args: ForwardArgs, config: &Config) -> Result<()> {
    let overrides = ForwardConfig {
        listen_addr: args.listen,
        target_addr: args.target,
    };
    let settings = ForwardSettings::resolve(overrides, &config.forward);
    let forwarder = Forwarder::bind(settings)
        .await
        .context("Failed to start forwarder")?;

    tokio::select! {
        result = forwarder.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping forwarder"),
    }
    Ok(())
}

fn run_config(action: ConfigCommands, path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Show => {
            let config = Config::load_from(path)?;
            println!("# {}", path.display());
            if !path.exists() {
                println!("# (file not found, showing built-in defaults)");
            }
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Init { force } => {
            Config::init_file(path, force)?;
            println!("Config written to {}", path.display());
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`
fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
