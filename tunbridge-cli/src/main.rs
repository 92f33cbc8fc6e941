//! Tunnel bridge CLI
//!
//! Runs the bridge against a proxy core's REST controller, and talks to a
//! running bridge over its control socket.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunbridge_engine::{
    AdminClient, BridgeConfig, ControlClient, ControlServer, CoreProcess, CreatedInterface,
    Dispatcher, HttpCore, InheritedDescriptor, ProxyMode, ScannedInterface, TunProvider,
    TunnelController, TunnelStrategy, DEFAULT_SOCKET_PATH,
};
use tunbridge_tun::OwnedTunFd;

/// Tunnel bridge - hands a TUN interface to a proxy core and serves its control channel
#[derive(Parser)]
#[command(name = "tunbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tunbridge.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Run {
        /// Use an inherited interface descriptor instead of creating one
        #[arg(long)]
        fd: Option<RawFd>,

        /// Proxy core configuration; defaults to the configured path
        #[arg(short, long)]
        profile: Option<PathBuf>,
    },

    /// Send a command to a running bridge
    Ctl {
        /// Control socket; defaults to the one in the configuration file
        #[arg(short, long)]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        action: CtlCommand,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tunbridge.toml")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum CtlCommand {
    /// Check the bridge is alive
    Ping,

    /// Show the proxy mode
    GetMode,

    /// Switch the proxy mode (rule, global, direct)
    SetMode { mode: ProxyMode },

    /// Show forwarding statistics
    Stats,

    /// Restart the session from its last configuration
    Restart,

    /// Forward a request to the proxy core's controller
    Api {
        method: String,
        path: String,
        #[arg(default_value = "")]
        body: String,
    },

    /// Send a raw control message
    Raw { message: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run { fd, profile } => run(&cli.config, fd, profile).await,
        Commands::Ctl { socket, action } => {
            let socket = socket.unwrap_or_else(|| control_socket(&cli.config));
            control(socket, action).await
        }
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config_path: &Path, fd: Option<RawFd>, profile: Option<PathBuf>) -> Result<()> {
    info!("Starting tunnel bridge...");

    let config = load_config(config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    if config.tun.strategy == TunnelStrategy::Relay {
        bail!("the relay strategy needs an embedded relay and cannot be run from the CLI");
    }
    if !config.core.spawns_core() {
        bail!("the direct strategy needs core.command: the proxy core must inherit the interface");
    }

    let admin = AdminClient::from_config(&config.core).context("Failed to create controller client")?;
    let process = CoreProcess::new(&config.core.command, &config.core.home_dir)
        .context("Invalid core.command")?;
    info!("Proxy core command: {}", process.program());
    let core = Arc::new(
        HttpCore::new(admin.clone()).with_process(process, config.core.ready_timeout()),
    );
    let provider = select_provider(fd);
    let socket = config.control.socket.clone();
    let profile = profile.unwrap_or_else(|| config.core.config_path());

    let controller = Arc::new(
        TunnelController::new(config, core, provider).context("Failed to create controller")?,
    );

    controller
        .start(&profile)
        .await
        .with_context(|| format!("Failed to start tunnel with {:?}", profile))?;

    let dispatcher = Arc::new(Dispatcher::new(controller.clone(), admin));
    let server = ControlServer::new(&socket, dispatcher);
    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            controller.stop().await.ok();
            return Err(e).context("Failed to open control socket");
        }
    };
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!("Control server error: {}", e);
        }
    });

    let result = serve_signals(&controller).await;

    info!("Shutting down bridge...");
    server_handle.abort();
    let _ = server_handle.await;

    if let Err(e) = controller.stop().await {
        warn!("Stop failed: {}", e);
    }

    result
}

fn select_provider(fd: Option<RawFd>) -> Arc<dyn TunProvider> {
    if let Some(fd) = fd {
        info!("Using inherited interface descriptor {}", fd);
        // SAFETY: the parent passed this descriptor for us to own; nothing
        // else in this process refers to it.
        let owned = unsafe { OwnedTunFd::adopt(fd) };
        return Arc::new(InheritedDescriptor::new(owned));
    }

    if cfg!(target_os = "linux") {
        Arc::new(CreatedInterface::new())
    } else {
        Arc::new(ScannedInterface)
    }
}

async fn control(socket: PathBuf, action: CtlCommand) -> Result<()> {
    let client = ControlClient::new(&socket);

    match action {
        CtlCommand::Ping => {
            client.ping().await.context("Bridge did not answer")?;
            println!("pong");
        }
        CtlCommand::GetMode => {
            println!("{}", client.get_mode().await.context("Failed to get mode")?);
        }
        CtlCommand::SetMode { mode } => {
            client.set_mode(mode).await.context("Failed to set mode")?;
            println!("Mode set to {}", mode);
        }
        CtlCommand::Stats => {
            let stats = client.stats().await.context("Failed to get statistics")?;
            println!("Packets in:  {} ({} bytes)", stats.packets_in, stats.bytes_in);
            println!("Packets out: {} ({} bytes)", stats.packets_out, stats.bytes_out);
            println!("Dropped:     {}", stats.dropped);
        }
        CtlCommand::Restart => {
            client.restart().await.context("Restart failed")?;
            println!("Restarted");
        }
        CtlCommand::Api { method, path, body } => {
            let reply = client
                .api_request(&method, &path, &body)
                .await
                .with_context(|| format!("{} {} failed", method, path))?;
            println!("{}", reply);
        }
        CtlCommand::Raw { message } => {
            match client.send_raw(message.as_bytes()).await? {
                Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
                None => println!("(no response)"),
            }
        }
    }

    Ok(())
}

fn control_socket(config_path: &Path) -> PathBuf {
    match BridgeConfig::load(config_path) {
        Ok(config) => config.control.socket,
        Err(_) => PathBuf::from(DEFAULT_SOCKET_PATH),
    }
}

fn load_config(path: &Path) -> Result<BridgeConfig> {
    BridgeConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = BridgeConfig::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nSet core.home_dir, core.controller and core.command before running.");

    Ok(())
}

/// Restart on SIGHUP; return on SIGINT or SIGTERM
async fn serve_signals(controller: &TunnelController) -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to register SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to register SIGINT handler")?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to register SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, restarting tunnel");
                if let Err(e) = controller.restart().await {
                    error!("Restart failed: {}", e);
                }
            }
        }
    }
}
