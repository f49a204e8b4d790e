//! pipeline config
//!
//! Shared by the scheduler, the exporter and the default HTTP transport.

use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use url::Url;

use crate::aggregation::DEFAULT_HISTOGRAM_BOUNDARIES;
use crate::error::MetricsError;
use crate::error::MetricsResult;

/// Collection and export pipeline config.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// collector endpoint, e.g. `http://localhost:4318/v1/metrics`
    pub endpoint: String,
    /// period between two drains
    pub export_interval: Duration,
    /// timeout of a single transmission attempt
    pub export_timeout: Duration,
    /// total transmission attempts per snapshot, first attempt included
    pub max_retry_attempts: u32,
    /// delay before the second attempt
    pub initial_backoff: Duration,
    /// upper bound of the retry delay
    pub max_backoff: Duration,
    /// distinct series kept per window
    pub max_series_cardinality: usize,
    /// snapshots waiting behind the in-flight export
    pub max_queue_depth: usize,
    /// export windows that recorded nothing
    pub export_empty_snapshots: bool,
    /// extra HTTP headers sent with every export
    pub headers: Vec<(String, String)>,
    /// explicit histogram bucket boundaries
    pub histogram_boundaries: Vec<f64>,
    /// `service.name` resource attribute
    pub service_name: String,
}

impl PipelineConfig {
    /// create new pipeline config with default parameters.
    ///
    /// The export interval has no default and must be chosen by the caller.
    pub fn new(endpoint: impl Into<String>, export_interval: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            export_interval,
            export_timeout: Duration::from_secs(30),
            max_retry_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_series_cardinality: 2000,
            max_queue_depth: 1,
            export_empty_snapshots: false,
            headers: Vec::new(),
            histogram_boundaries: DEFAULT_HISTOGRAM_BOUNDARIES.to_vec(),
            service_name: "unknown_service".to_string(),
        }
    }

    /// set per-attempt export timeout.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// set retry config
    pub fn with_retry_config(
        mut self,
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        self.max_retry_attempts = max_attempts;
        self.initial_backoff = initial_backoff;
        self.max_backoff = max_backoff;
        self
    }

    /// set max distinct series per window.
    pub fn with_max_series_cardinality(mut self, max: usize) -> Self {
        self.max_series_cardinality = max;
        self
    }

    /// set export queue depth.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_export_empty_snapshots(mut self, enabled: bool) -> Self {
        self.export_empty_snapshots = enabled;
        self
    }

    /// add an HTTP header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_histogram_boundaries(mut self, boundaries: Vec<f64>) -> Self {
        self.histogram_boundaries = boundaries;
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Check the config before any background task is started.
    pub fn validate(&self) -> MetricsResult<()> {
        let invalid = |message: &str| {
            Report::new(MetricsError::Configuration {
                message: message.to_string(),
            })
        };

        let url = Url::parse(&self.endpoint)
            .change_context(MetricsError::Configuration {
                message: format!("Invalid endpoint `{}`", self.endpoint),
            })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("endpoint scheme must be http or https"));
        }
        if self.export_interval.is_zero() {
            return Err(invalid("export_interval must be greater than zero"));
        }
        if self.export_timeout.is_zero() {
            return Err(invalid("export_timeout must be greater than zero"));
        }
        if self.max_retry_attempts == 0 {
            return Err(invalid("max_retry_attempts must be at least 1"));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(invalid("initial_backoff must not exceed max_backoff"));
        }
        if self.max_series_cardinality == 0 {
            return Err(invalid("max_series_cardinality must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(invalid("max_queue_depth must be at least 1"));
        }
        if self.histogram_boundaries.iter().any(|b| !b.is_finite()) {
            return Err(invalid("histogram boundaries must be finite"));
        }
        if self.histogram_boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("histogram boundaries must be strictly increasing"));
        }
        Ok(())
    }
}
