//! proxycore daemon
//!
//! Runs the VPN session controller on Linux. `run` brings the tunnel up and
//! keeps it supervised until SIGINT or SIGTERM; the other subcommands inspect
//! or stop a tunnel hosted by a running daemon.

use anyhow::Context;
use clap::{Parser, Subcommand};
use proxycore_daemon::platform::LinuxPlatform;
use proxycore_daemon::wake_monitor::platform_events;
use proxycore_ipc::ControlRequest;
use proxycore_session::{
    AppIdentity, PermissionStatus, SessionConfig, SessionController, SessionSettings, TunnelProvider,
};
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration
    #[clap(short, long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the tunnel and supervise it until terminated
    Run,
    /// Create the provider profile and negotiate VPN permission
    Prepare,
    /// Print the session snapshot and tunnel status as JSON
    Status,
    /// Stop the tunnel hosted by a running daemon
    Stop,
    /// Send a raw control command to the running core
    Probe {
        /// Command name, e.g. IS_CORE_RUNNING or measurePing
        command: String,
        /// Request fields as key=value
        fields: Vec<String>,
    },
}

fn load_config(path: Option<PathBuf>) -> Config {
    let path = path.unwrap_or_else(Config::default_path);
    match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from {}: {}; using defaults",
                path.display(),
                e
            );
            Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config);
    config.validate().context("invalid configuration")?;

    let mut options = LogOptions::from_config(&config);
    if let Some(level) = args.log_level.as_deref().and_then(parse_level) {
        options.level = level;
    }
    let _guard = init_logging(options);

    let linux = LinuxPlatform::from_config(&config);
    let controller = SessionController::new(
        linux.platform.clone(),
        SessionSettings::from_config(&config),
        AppIdentity::from_config(&config),
    )
    .await;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, &linux, &controller).await,
        Commands::Prepare => {
            let permission = controller.prepare().await?;
            println!("{}", serde_json::to_string(&permission)?);
            if permission != PermissionStatus::Granted {
                anyhow::bail!("VPN permission not granted");
            }
            Ok(())
        }
        Commands::Status => {
            let status = controller.query_status().await;
            let snapshot = controller.snapshot().await;
            let report = serde_json::json!({
                "status": status,
                "session": snapshot,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Stop => {
            linux.provider.stop_tunnel().await?;
            Ok(())
        }
        Commands::Probe { command, fields } => {
            let mut request = ControlRequest::raw(command);
            for field in fields {
                let (key, value) = field
                    .split_once('=')
                    .with_context(|| format!("field '{}' is not key=value", field))?;
                request = request.with_field(key, value);
            }
            match controller.control().try_send(&request).await? {
                Some(response) => println!("{}", response),
                None => warn!("No response"),
            }
            Ok(())
        }
    }
}

async fn run(config: &Config, linux: &LinuxPlatform, controller: &SessionController) -> anyhow::Result<()> {
    info!("proxycore daemon starting up");

    let sink = controller.event_sink();
    linux.provider.set_event_sink(sink.clone()).await;
    let _event_loop = controller.spawn_event_loop();

    let permission = controller.prepare().await?;
    if permission != PermissionStatus::Granted {
        anyhow::bail!("VPN permission not granted; run as root");
    }

    let session_config = SessionConfig::from_config(config)?;
    controller.start(&session_config).await?;

    let mut statuses = controller.subscribe();
    let mut events = platform_events();
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down.");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down.");
                break;
            }
            Some(event) = events.next() => sink.submit(event),
            status = statuses.recv() => match status {
                Ok(status) => info!(%status, state = %controller.state(), "Connection status changed"),
                Err(e) => warn!("Missed status updates: {}", e),
            },
        }
    }

    if let Err(e) = controller.stop().await {
        error!("Failed to stop the session: {}", e);
        return Err(e.into());
    }
    info!("proxycore daemon stopped");
    Ok(())
}
