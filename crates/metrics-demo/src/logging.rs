//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::Layer;

use crate::cli::LogFormat;

/// target the log transport writes exported payloads to
const METRICS_TARGET: &str = "metrics";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// With `metrics_file` set, exported payloads also go to a daily rolling file;
/// the returned guard flushes it and must be held until exit.
pub(crate) fn init(format: LogFormat, metrics_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let fmt_layer = match format {
        LogFormat::Text => layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };
    let fmt_layer = fmt_layer.with_filter(env_filter());

    let Some(metrics_file) = metrics_file else {
        registry().with(fmt_layer).init();
        return Ok(None);
    };

    let dir = match metrics_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let prefix = metrics_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("log file name must be valid UTF-8")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .context("failed to create rolling file appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == METRICS_TARGET
        }));

    registry().with(fmt_layer).with(metrics_layer).init();
    Ok(Some(file_guard))
}
