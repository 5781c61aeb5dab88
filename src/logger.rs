use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: a stdout layer filtered by
/// `log_level` (or `RUST_LOG`), plus a daily-rolling JSON file layer
/// when `log_dir` is given. Safe to call more than once.
pub fn init_tracing(log_level: &str, log_dir: Option<PathBuf>) -> Result<()> {
    if INIT.set(()).is_err() {
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let stdout_layer = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "blockbot.log");
            let file_layer = fmt::layer().json().with_writer(appender).with_ansi(false);
            Registry::default()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
        }
        None => {
            Registry::default().with(env_filter).with(stdout_layer).init();
        }
    }

    Ok(())
}
