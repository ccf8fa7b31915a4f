//! Mud.band CLI - Main Entry Point
//!
//! Headless front-end over the Mud.band client core: band membership,
//! device and link listings, the tunnel session, and a live view of
//! published snapshots.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod output;

use commands::{band, devices, settings, status, tunnel};
use mudband_core::{
    Core, CoreConfig, HeadlessPlatform, HttpControlPlane, KernelEngine, LocalCorePort,
};

/// Mud.band - mesh VPN client
#[derive(Parser)]
#[command(name = "mudband")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "MUDBAND_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// State root directory, overrides the configuration file
    #[arg(long, env = "MUDBAND_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage band membership
    #[command(subcommand)]
    Band(band::BandCommands),

    /// List devices in the active band
    Devices,

    /// List links published by the active band
    Links,

    /// Show enrollment and session status
    Status,

    /// Fetch band configuration and status now
    Refresh,

    /// Bring the tunnel up and keep it connected until interrupted
    Up(tunnel::UpArgs),

    /// Take the tunnel down
    Down,

    /// Review or accept the terms of service
    Tos(settings::TosArgs),

    /// Multi-factor authentication
    #[command(subcommand)]
    Mfa(settings::MfaCommands),

    /// Keep state reconciled and print every change
    Watch(status::WatchArgs),

    /// Show version information
    Version,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "mudband=debug" } else { "mudband=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CoreConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(mudband_common::default_config_path);
    let mut config = CoreConfig::load(&path)?;
    if let Some(root) = &cli.root {
        config.root_dir = root.clone();
    }
    Ok(config)
}

async fn open_core(config: CoreConfig) -> anyhow::Result<Core> {
    let engine = Arc::new(KernelEngine::new(config.tunnel.interface.clone()));
    let port = Arc::new(LocalCorePort::new(&config).with_engine(engine));
    let control = Arc::new(HttpControlPlane::new(&config)?);
    let core = Core::open(config, port, control, Arc::new(HeadlessPlatform)).await?;
    Ok(core)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        println!("Mud.band CLI v{}", mudband_common::VERSION);
        return Ok(());
    }

    let config = load_config(&cli)?;
    let core = open_core(config).await?;
    let format = cli.format;

    match cli.command {
        Commands::Band(cmd) => band::execute(cmd, &core, format).await?,
        Commands::Devices => devices::devices(&core, format)?,
        Commands::Links => devices::links(&core, format)?,
        Commands::Status => status::status(&core, format)?,
        Commands::Refresh => status::refresh(&core).await?,
        Commands::Up(args) => tunnel::up(args, &core).await?,
        Commands::Down => tunnel::down(&core).await?,
        Commands::Tos(args) => settings::tos(args, &core, format)?,
        Commands::Mfa(cmd) => settings::mfa(cmd, &core).await?,
        Commands::Watch(args) => status::watch(args, &core).await?,
        Commands::Version => {}
    }

    Ok(())
}
