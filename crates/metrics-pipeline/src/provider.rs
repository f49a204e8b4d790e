//! Provider and meter facade.
//!
//! [`MeterProviderBuilder::build`] wires the registry, the aggregation store,
//! the exporter, the scheduler and the shutdown coordinator together. A
//! [`Meter`] hands out instrument handles that record into the provider's
//! store.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tracing::info;
use tracing::warn;

use crate::aggregation::AggregationStore;
use crate::config::PipelineConfig;
use crate::diagnostics::Diagnostics;
use crate::diagnostics::DiagnosticsSnapshot;
use crate::diagnostics::DIAGNOSTICS_TARGET;
use crate::error::MetricsError;
use crate::error::MetricsResult;
use crate::export::codec::json::JsonCodec;
use crate::export::Exporter;
use crate::export::HttpTransport;
use crate::export::RetryPolicy;
use crate::export::SnapshotCodec;
use crate::export::Transport;
use crate::instrument::Counter;
use crate::instrument::Gauge;
use crate::instrument::Histogram;
use crate::instrument::InstrumentDescriptor;
use crate::instrument::InstrumentKind;
use crate::instrument::InstrumentRegistry;
use crate::scheduler::ExportScheduler;
use crate::scheduler::SchedulerState;
use crate::shutdown::ShutdownCoordinator;

/// Builder of a [`MeterProvider`].
pub struct MeterProviderBuilder {
    config: PipelineConfig,
    codec: Option<Box<dyn SnapshotCodec>>,
    transport: Option<Arc<dyn Transport>>,
}

impl MeterProviderBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            codec: None,
            transport: None,
        }
    }

    /// set payload codec, OTLP/JSON by default.
    pub fn with_codec(mut self, codec: Box<dyn SnapshotCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// set transport, HTTP POST to the configured endpoint by default.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the config and start the export pipeline.
    ///
    /// Must be called inside a Tokio runtime; the scheduler's background tasks
    /// are spawned on it.
    pub fn build(self) -> MetricsResult<MeterProvider> {
        let config = self.config;
        config.validate()?;

        let diagnostics = Arc::new(Diagnostics::new());
        let store = Arc::new(AggregationStore::new(
            config.max_series_cardinality,
            config.histogram_boundaries.clone(),
            Arc::clone(&diagnostics),
        ));

        let codec = match self.codec {
            Some(codec) => codec,
            None => Box::new(JsonCodec::new(config.service_name.clone())),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let exporter = Exporter::new(
            codec,
            transport,
            RetryPolicy::from_config(&config),
            config.export_timeout,
            Arc::clone(&diagnostics),
        );

        let scheduler = Arc::new(ExportScheduler::new(
            Arc::clone(&store),
            exporter,
            &config,
            Arc::clone(&diagnostics),
        ));
        scheduler.start()?;

        let coordinator = ShutdownCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&diagnostics),
        );

        info!(
            endpoint = %config.endpoint,
            service_name = %config.service_name,
            "Meter provider started"
        );

        Ok(MeterProvider {
            inner: Some(Arc::new(ProviderInner {
                registry: InstrumentRegistry::new(),
                store,
                scheduler,
                coordinator,
                diagnostics,
            })),
        })
    }
}

struct ProviderInner {
    registry: InstrumentRegistry,
    store: Arc<AggregationStore>,
    scheduler: Arc<ExportScheduler>,
    coordinator: ShutdownCoordinator,
    diagnostics: Arc<Diagnostics>,
}

/// Entry point of the pipeline; cheap to clone.
///
/// The no-op provider accepts every call and records nothing.
#[derive(Clone)]
pub struct MeterProvider {
    inner: Option<Arc<ProviderInner>>,
}

impl std::fmt::Debug for MeterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterProvider")
            .field("noop", &self.is_noop())
            .field("state", &self.scheduler_state())
            .finish()
    }
}

impl MeterProvider {
    pub fn builder(config: PipelineConfig) -> MeterProviderBuilder {
        MeterProviderBuilder::new(config)
    }

    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Get a meter; `name` identifies the instrumented component.
    pub fn meter(&self, name: impl Into<String>) -> Meter {
        Meter {
            name: name.into(),
            provider: self.inner.clone(),
        }
    }

    /// Export the current window now and wait for the result.
    pub async fn force_flush(&self, timeout: Duration) -> MetricsResult<()> {
        match &self.inner {
            Some(inner) => inner.scheduler.force_flush(timeout).await,
            None => Ok(()),
        }
    }

    /// Stop the pipeline after a final flush bounded by `timeout`.
    ///
    /// See [`ShutdownCoordinator::shutdown`].
    pub async fn shutdown(&self, timeout: Duration) -> MetricsResult<()> {
        match &self.inner {
            Some(inner) => inner.coordinator.shutdown(timeout).await,
            None => Ok(()),
        }
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.inner
            .as_ref()
            .map(|inner| inner.diagnostics.snapshot())
            .unwrap_or_default()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner
            .as_ref()
            .map_or(SchedulerState::Idle, |inner| inner.scheduler.state())
    }

    /// Series recorded in the current window.
    pub fn pending_series(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.store.len())
    }
}

enum Registered {
    Live(Arc<InstrumentDescriptor>, Arc<AggregationStore>),
    Noop(InstrumentDescriptor),
}

/// Creates instruments registered with one provider.
#[derive(Clone)]
pub struct Meter {
    name: String,
    provider: Option<Arc<ProviderInner>>,
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("name", &self.name)
            .field("noop", &self.provider.is_none())
            .finish()
    }
}

impl Meter {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn register(
        &self,
        kind: InstrumentKind,
        name: String,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> MetricsResult<Registered> {
        let mut descriptor = InstrumentDescriptor::new(name, kind);
        if let Some(unit) = unit {
            descriptor = descriptor.with_unit(unit);
        }
        if let Some(description) = description {
            descriptor = descriptor.with_description(description);
        }

        match &self.provider {
            Some(inner) => {
                let descriptor = inner.registry.get_or_create(descriptor)?;
                Ok(Registered::Live(descriptor, Arc::clone(&inner.store)))
            }
            None => {
                descriptor.validate_name().map_err(Report::new)?;
                Ok(Registered::Noop(descriptor))
            }
        }
    }

    fn report_failure(&self, name: &str, report: &Report<MetricsError>) {
        warn!(
            target: DIAGNOSTICS_TARGET,
            meter = %self.name,
            instrument = name,
            error = %report.current_context(),
            "Instrument creation failed, measurements will be dropped"
        );
    }

    /// Create a counter with unit and description.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::InvalidInstrumentName`]
    /// - [`MetricsError::DuplicateInstrument`] if the name is taken by another
    ///   kind or unit
    pub fn try_create_counter(
        &self,
        name: impl Into<String>,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> MetricsResult<Counter> {
        Ok(match self.register(InstrumentKind::Counter, name.into(), unit, description)? {
            Registered::Live(descriptor, store) => Counter::new(descriptor, store),
            Registered::Noop(descriptor) => Counter::noop(descriptor),
        })
    }

    pub fn try_create_gauge(
        &self,
        name: impl Into<String>,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> MetricsResult<Gauge> {
        Ok(match self.register(InstrumentKind::Gauge, name.into(), unit, description)? {
            Registered::Live(descriptor, store) => Gauge::new(descriptor, store),
            Registered::Noop(descriptor) => Gauge::noop(descriptor),
        })
    }

    pub fn try_create_histogram(
        &self,
        name: impl Into<String>,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> MetricsResult<Histogram> {
        Ok(match self.register(InstrumentKind::Histogram, name.into(), unit, description)? {
            Registered::Live(descriptor, store) => Histogram::new(descriptor, store),
            Registered::Noop(descriptor) => Histogram::noop(descriptor),
        })
    }

    /// Create a counter; on error a no-op counter is returned and the error
    /// is reported to diagnostics.
    pub fn create_counter(&self, name: impl Into<String>) -> Counter {
        let name = name.into();
        self.try_create_counter(name.clone(), None, None)
            .unwrap_or_else(|report| {
                self.report_failure(&name, &report);
                Counter::noop(InstrumentDescriptor::counter(name))
            })
    }

    pub fn create_gauge(&self, name: impl Into<String>) -> Gauge {
        let name = name.into();
        self.try_create_gauge(name.clone(), None, None)
            .unwrap_or_else(|report| {
                self.report_failure(&name, &report);
                Gauge::noop(InstrumentDescriptor::gauge(name))
            })
    }

    pub fn create_histogram(&self, name: impl Into<String>) -> Histogram {
        let name = name.into();
        self.try_create_histogram(name.clone(), None, None)
            .unwrap_or_else(|report| {
                self.report_failure(&name, &report);
                Histogram::noop(InstrumentDescriptor::histogram(name))
            })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::aggregation::Aggregate;
    use crate::attributes::AttributeSet;
    use crate::export::testing::FlakyTransport;

    fn provider(transport: Arc<FlakyTransport>) -> MeterProvider {
        let config = PipelineConfig::new("http://localhost:4318/v1/metrics", Duration::from_secs(60))
            .with_service_name("otel-test");
        MeterProvider::builder(config)
            .with_transport(transport)
            .build()
            .expect("should build provider")
    }

    #[test(tokio::test(start_paused = true))]
    async fn dummy_counter_is_exported_on_shutdown() {
        let transport = Arc::new(FlakyTransport::succeeding());
        let provider = provider(transport.clone());

        let counter = provider.meter("otel-test").create_counter("dummy_counter");
        counter.add(1, [("test", "curl")]);
        assert_eq!(provider.pending_series(), 1);

        provider
            .shutdown(Duration::from_secs(5))
            .await
            .expect("shutdown should flush");

        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        let doc: serde_json::Value = serde_json::from_slice(&delivered[0].body).expect("json");
        let resource = &doc["resourceMetrics"][0];
        assert_eq!(resource["resource"]["attributes"][0]["value"]["stringValue"], "otel-test");
        let metric = &resource["scopeMetrics"][0]["metrics"][0];
        assert_eq!(metric["name"], "dummy_counter");
        assert_eq!(metric["sum"]["dataPoints"][0]["asDouble"], 1.0);
        assert_eq!(provider.scheduler_state(), SchedulerState::Terminated);
    }

    #[test(tokio::test(start_paused = true))]
    async fn duplicate_instrument_falls_back_to_noop() {
        let transport = Arc::new(FlakyTransport::succeeding());
        let provider = provider(transport);
        let meter = provider.meter("svc");

        let counter = meter.create_counter("requests");
        let report = meter
            .try_create_gauge("requests", None, None)
            .expect_err("kind conflict");
        assert!(matches!(report.current_context(), MetricsError::DuplicateInstrument { .. }));

        let gauge = meter.create_gauge("requests");
        assert!(!counter.is_noop());
        assert!(gauge.is_noop());
    }

    #[test(tokio::test(start_paused = true))]
    async fn same_name_from_two_meters_shares_series() {
        let transport = Arc::new(FlakyTransport::succeeding());
        let provider = provider(transport);

        provider.meter("a").create_counter("hits").add(1, AttributeSet::empty());
        provider.meter("b").create_counter("hits").add(2, AttributeSet::empty());

        assert_eq!(provider.pending_series(), 1);
        let inner = provider.inner.as_ref().expect("real provider");
        let snapshot = inner.store.drain();
        assert_eq!(snapshot.find("hits", &AttributeSet::empty()).and_then(Aggregate::sum), Some(3.0));
    }

    #[test(tokio::test)]
    async fn noop_provider_accepts_everything() {
        let provider = MeterProvider::noop();
        let meter = provider.meter("svc");

        let counter = meter.create_counter("dummy_counter");
        counter.add(1, [("test", "curl")]);
        assert!(counter.is_noop());
        assert!(meter.try_create_counter("", None, None).is_err(), "names are still validated");

        provider.force_flush(Duration::from_secs(1)).await.expect("noop flush");
        provider.shutdown(Duration::from_secs(1)).await.expect("noop shutdown");
        assert_eq!(provider.diagnostics(), DiagnosticsSnapshot::default());
        assert_eq!(provider.scheduler_state(), SchedulerState::Idle);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PipelineConfig::new("localhost:4318", Duration::from_secs(60));
        let report = MeterProvider::builder(config)
            .with_transport(Arc::new(FlakyTransport::succeeding()))
            .build()
            .expect_err("endpoint without scheme");
        assert!(matches!(report.current_context(), MetricsError::Configuration { .. }));
    }
}
