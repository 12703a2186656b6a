//! provides logging helpers

use std::env;
use std::path::Path;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

const DEFAULT_LOG_PREFIX: &str = "gpu-admission.log";
const ENABLE_LOG_ENV_VAR: &str = "GPU_ADMISSION_ENABLE_LOG";
const LOG_PATH_ENV_VAR: &str = "GPU_ADMISSION_LOG_PATH";
const LOG_LEVEL_ENV_VAR: &str = "GPU_ADMISSION_LOG_LEVEL";
const LOG_OFF: &str = "off";

static LOG_WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Build the fmt layer, writing to stdout or to a rolling file when
/// `GPU_ADMISSION_LOG_PATH` is set.
pub fn get_fmt_layer() -> Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync> {
    let filter = match env::var(ENABLE_LOG_ENV_VAR).as_deref() {
        Ok(LOG_OFF) | Ok("0") | Ok("false") => EnvFilter::new(LOG_OFF),
        _ => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .with_env_var(LOG_LEVEL_ENV_VAR)
            .from_env_lossy(),
    };

    let fmt_layer = match env::var(LOG_PATH_ENV_VAR) {
        Ok(path) => {
            // path could be a specific a/b/c.log file name, split it to get base dir and prefix
            let path = Path::new(&path);
            let is_dir = path.is_dir();
            let base_dir = if is_dir {
                path
            } else {
                path.parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."))
            };
            let prefix = path
                .file_name()
                .and_then(|name| name.to_str())
                .filter(|_| !is_dir)
                .unwrap_or(DEFAULT_LOG_PREFIX);

            match RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(7)
                .build(base_dir)
            {
                Ok(appender) => {
                    let (file_writer, guard) = tracing_appender::non_blocking(appender);

                    // keep non blocking write thread alive in global scope
                    let _ = LOG_WORKER_GUARD.set(guard);

                    layer()
                        .with_writer(file_writer)
                        .with_target(true)
                        .with_ansi(false)
                        .boxed()
                }
                Err(err) => {
                    eprintln!("failed to create rolling file appender: {err}; using stdout");
                    layer().with_writer(std::io::stdout).with_target(true).boxed()
                }
            }
        }
        _ => layer()
            .with_writer(std::io::stdout)
            .with_target(true)
            .boxed(),
    };

    fmt_layer.with_filter(filter).boxed()
}

pub fn init() {
    let fmt_layer = get_fmt_layer();
    registry().with(fmt_layer).init();
}
