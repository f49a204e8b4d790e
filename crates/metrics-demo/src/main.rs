mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use metrics_pipeline::export::create_codec;
use metrics_pipeline::export::LogTransport;
use metrics_pipeline::global;
use metrics_pipeline::MeterProvider;
use metrics_pipeline::MetricsError;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cli::Cli;
use crate::cli::ExporterKind;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.log_format, cli.log_file.as_deref())?;

    info!(
        endpoint = %cli.endpoint,
        exporter = ?cli.exporter,
        codec = cli.codec.as_str(),
        "Starting metrics demo {}",
        env!("CARGO_PKG_VERSION")
    );

    let config = cli.pipeline_config();
    let mut builder = MeterProvider::builder(config)
        .with_codec(create_codec(cli.codec.as_str(), &cli.service_name));
    if cli.exporter == ExporterKind::Log {
        builder = builder.with_transport(Arc::new(LogTransport::new()));
    }
    let provider = builder.build().map_err(|e| anyhow::anyhow!("{e:?}"))?;
    global::set_provider(provider).map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let counter = global::meter("metrics-demo").create_counter(cli.counter_name.clone());
    counter.add(cli.increment, cli.attributes.clone());
    info!(
        counter = %cli.counter_name,
        increment = cli.increment,
        "Measurement recorded"
    );

    if cli.wait_secs > 0 {
        info!(wait_secs = cli.wait_secs, "Waiting before shutdown, press ctrl-c to stop early");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cli.wait_secs)) => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                }
            }
        }
    }

    match global::shutdown(cli.shutdown_timeout()).await {
        Ok(()) => {
            let diagnostics = global::provider().diagnostics();
            info!(
                exports_succeeded = diagnostics.exports_succeeded,
                exports_failed = diagnostics.exports_failed,
                exports_rejected = diagnostics.exports_rejected,
                "Metrics demo finished"
            );
            Ok(())
        }
        Err(report) => {
            if matches!(report.current_context(), MetricsError::ShutdownIncomplete { .. }) {
                error!(
                    timeout_ms = cli.shutdown_timeout_ms,
                    "Final flush did not complete in time"
                );
            }
            Err(anyhow::anyhow!("{report:?}"))
        }
    }
}
