//! Metrics collection and periodic export.
//!
//! Application code records measurements through instrument handles obtained
//! from a [`Meter`]. Measurements are aggregated per series in memory, drained
//! once per export interval and sent to a collector by a background worker.
//! [`MeterProvider::shutdown`] performs a bounded final flush.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use metrics_pipeline::global;
//! use metrics_pipeline::MeterProvider;
//! use metrics_pipeline::PipelineConfig;
//!
//! # async fn run() -> metrics_pipeline::MetricsResult<()> {
//! let config = PipelineConfig::new("http://localhost:4318/v1/metrics", Duration::from_secs(60));
//! global::set_provider(MeterProvider::builder(config).build()?)?;
//!
//! let counter = global::meter("otel-test").create_counter("dummy_counter");
//! counter.add(1, [("test", "curl")]);
//!
//! global::shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod attributes;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod global;
pub mod instrument;
pub mod provider;
pub mod scheduler;
pub mod shutdown;

pub use aggregation::Aggregate;
pub use aggregation::Snapshot;
pub use attributes::AttributeSet;
pub use attributes::AttributeValue;
pub use config::PipelineConfig;
pub use diagnostics::DiagnosticsSnapshot;
pub use error::MetricsError;
pub use error::MetricsResult;
pub use instrument::Counter;
pub use instrument::Gauge;
pub use instrument::Histogram;
pub use instrument::InstrumentDescriptor;
pub use instrument::InstrumentKind;
pub use provider::Meter;
pub use provider::MeterProvider;
pub use provider::MeterProviderBuilder;
pub use scheduler::SchedulerState;
