/// Rackmon daemon
///
/// Loads the interface configuration and register maps, starts the
/// scan/monitor loops and serves the sockets until Ctrl-C.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};
use tokio::signal;

use rackmon::{CallbackLogger, LogLevel, Rackmon, RackmonConfig, RackmonService, ServiceConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Interface configuration file
    #[clap(long, default_value = "/etc/rackmon.conf")]
    config: PathBuf,

    /// Directory of register map files
    #[clap(long, default_value = "/etc/rackmon.d")]
    regmaps: PathBuf,

    /// JSON protocol socket
    #[clap(long, default_value = "/var/run/rackmond.sock")]
    socket: PathBuf,

    /// Legacy binary protocol socket
    #[clap(long)]
    legacy_socket: Option<PathBuf>,

    /// error, warn, info, debug or trace
    #[clap(long, default_value = "info")]
    log_level: LevelFilter,
}

fn callback_level(filter: LevelFilter) -> LogLevel {
    match filter {
        LevelFilter::Off | LevelFilter::Error => LogLevel::Error,
        LevelFilter::Warn => LogLevel::Warn,
        LevelFilter::Info => LogLevel::Info,
        LevelFilter::Debug | LevelFilter::Trace => LogLevel::Debug,
    }
}

fn tracing_level(filter: LevelFilter) -> tracing::Level {
    match filter {
        LevelFilter::Off | LevelFilter::Error => tracing::Level::ERROR,
        LevelFilter::Warn => tracing::Level::WARN,
        LevelFilter::Info => tracing::Level::INFO,
        LevelFilter::Debug => tracing::Level::DEBUG,
        LevelFilter::Trace => tracing::Level::TRACE,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::builder().filter_level(args.log_level).init();
    // the log facade is already taken by env_logger, so no LogTracer bridge
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing_level(args.log_level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;

    let logger = CallbackLogger::forward(callback_level(args.log_level));
    info!("🚀 {}", rackmon::info());

    let config = RackmonConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let rackmon = Arc::new(
        Rackmon::load(config, &args.regmaps, logger.clone())
            .await
            .context("initializing rackmon")?,
    );
    rackmon.start().await?;

    let mut service = RackmonService::new(rackmon.clone(), logger);
    service
        .start(&ServiceConfig {
            socket_path: args.socket,
            legacy_socket_path: args.legacy_socket,
        })
        .await
        .context("starting socket service")?;

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("🛑 Shutting down");

    service.stop().await?;
    if rackmon.is_running() {
        rackmon.stop().await?;
    }
    rackmon.close().await?;
    Ok(())
}
