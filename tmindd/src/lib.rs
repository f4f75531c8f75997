//! Gateway daemon: reads the config, sets up logging, wires the gatttool
//! radio and the MQTT publisher into the gateway and runs until signalled

use clap::Parser;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tmind_broker::{GatewayError, SettingsError};
use tokio::signal::unix::{signal, SignalKind};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

#[derive(Error, Debug)]
pub enum TagMinderError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Settings Error")]
    Settings(#[from] SettingsError),
    #[error("Gateway Error")]
    Gateway(#[from] GatewayError),
    #[error("Logging setup Error: {0}")]
    Logging(String),
}

pub type TagMinderResult<T> = Result<T, TagMinderError>;

/// BLE SensorTag to MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "tag-minder", version)]
pub struct Cli {
    /// JSON config file
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Write logs to a daily rolling file in this directory instead of stdout
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

/// Route `log` records into `tracing` and install the fmt subscriber. Keep
/// the returned guard alive for as long as file logging should flush
pub fn init_logging(
    log_dir: Option<&Path>,
    level: tracing::Level,
) -> TagMinderResult<Option<WorkerGuard>> {
    LogTracer::init().map_err(|e| TagMinderError::Logging(e.to_string()))?;

    let guard = match log_dir {
        Some(dir) => {
            let log = rolling::daily(dir, "tag-minder.log");
            let (nb, guard) = tracing_appender::non_blocking(log);
            let sub = FmtSubscriber::builder()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(nb)
                .finish();
            tracing::subscriber::set_global_default(sub)
                .map_err(|e| TagMinderError::Logging(e.to_string()))?;
            Some(guard)
        }
        None => {
            let sub = FmtSubscriber::builder().with_max_level(level).finish();
            tracing::subscriber::set_global_default(sub)
                .map_err(|e| TagMinderError::Logging(e.to_string()))?;
            None
        }
    };
    Ok(guard)
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() -> TagMinderResult<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            log::info!("Interrupted");
        }
        _ = term.recv() => {
            log::info!("Terminated");
        }
    }
    Ok(())
}
