use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;
use metrics_pipeline::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CodecFormat {
    /// OTLP/JSON document
    Json,
    /// InfluxDB line protocol
    Influx,
}

impl CodecFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecFormat::Json => "json",
            CodecFormat::Influx => "influx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExporterKind {
    /// POST snapshots to the collector endpoint
    Http,
    /// write snapshots to the `metrics` log target
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Record a counter and flush it to a metrics collector
#[derive(Parser, Debug)]
#[command(about, long_about, version)]
pub struct Cli {
    #[arg(
        long,
        env = "OTEL_EXPORTER_OTLP_METRICS_ENDPOINT",
        default_value = "http://localhost:4318/v1/metrics",
        help = "Collector endpoint receiving the exported snapshots"
    )]
    pub endpoint: String,

    #[arg(
        long,
        env = "OTEL_METRIC_EXPORT_INTERVAL",
        default_value_t = 60000,
        help = "Interval between periodic exports (milliseconds)"
    )]
    pub export_interval_ms: u64,

    #[arg(
        long,
        env = "OTEL_METRIC_EXPORT_TIMEOUT",
        default_value_t = 30000,
        help = "Timeout of a single export attempt (milliseconds)"
    )]
    pub export_timeout_ms: u64,

    #[arg(long, default_value_t = 5, help = "Attempts per snapshot, including the first")]
    pub max_retry_attempts: u32,

    #[arg(long, default_value_t = 2000, help = "Distinct series kept per export window")]
    pub max_series: usize,

    #[arg(long, default_value_t = 1, help = "Snapshots allowed to wait behind the export in flight")]
    pub max_queue_depth: usize,

    #[arg(long, value_enum, default_value_t = CodecFormat::Json)]
    pub codec: CodecFormat,

    #[arg(long, value_enum, default_value_t = ExporterKind::Http)]
    pub exporter: ExporterKind,

    #[arg(long, default_value = "dummy_counter")]
    pub counter_name: String,

    #[arg(
        long = "attribute",
        value_parser = parse_attribute,
        default_value = "test=curl",
        help = "Attribute attached to the measurement, as key=value (repeatable)"
    )]
    pub attributes: Vec<(String, String)>,

    #[arg(long, default_value_t = 1.0)]
    pub increment: f64,

    #[arg(
        long,
        default_value_t = 0,
        help = "Seconds to keep running before shutdown, ctrl-c ends the wait early"
    )]
    pub wait_secs: u64,

    #[arg(long, default_value_t = 5000, help = "Upper bound of the final flush (milliseconds)")]
    pub shutdown_timeout_ms: u64,

    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "metrics-demo")]
    pub service_name: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(long, help = "Also write `metrics` events to a daily rolling file")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::new(
            self.endpoint.clone(),
            Duration::from_millis(self.export_interval_ms),
        );
        let initial_backoff = defaults.initial_backoff;
        let max_backoff = defaults.max_backoff;

        defaults
            .with_export_timeout(Duration::from_millis(self.export_timeout_ms))
            .with_retry_config(self.max_retry_attempts, initial_backoff, max_backoff)
            .with_max_series_cardinality(self.max_series)
            .with_max_queue_depth(self.max_queue_depth)
            .with_service_name(self.service_name.clone())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse_attribute(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("attribute key is empty in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
