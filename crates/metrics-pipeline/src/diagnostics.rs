//! Self-diagnostics: counters about the pipeline itself and the logging
//! channel through which pipeline failures are reported.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::MetricsError;

/// Target of every diagnostic event emitted by the pipeline.
pub const DIAGNOSTICS_TARGET: &str = "metrics_pipeline::diagnostics";

/// Atomic counters shared by all pipeline components.
#[derive(Debug, Default)]
pub struct Diagnostics {
    invalid_measurements: AtomicU64,
    cardinality_dropped: AtomicU64,
    backlog_dropped: AtomicU64,
    export_attempts: AtomicU64,
    exports_succeeded: AtomicU64,
    exports_failed: AtomicU64,
    exports_rejected: AtomicU64,
    shutdown_incomplete: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub invalid_measurements: u64,
    pub cardinality_dropped: u64,
    pub backlog_dropped: u64,
    pub export_attempts: u64,
    pub exports_succeeded: u64,
    pub exports_failed: u64,
    pub exports_rejected: u64,
    pub shutdown_incomplete: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count and log a pipeline condition.
    ///
    /// Cardinality overflow is only counted here; the store logs it once per
    /// window to keep the hot path quiet.
    pub(crate) fn report(&self, err: &MetricsError) {
        match err {
            MetricsError::InvalidMeasurement { .. } => {
                self.invalid_measurements.fetch_add(1, Ordering::Relaxed);
                debug!(target: DIAGNOSTICS_TARGET, error = %err, "Measurement dropped");
            }
            MetricsError::CardinalityLimitExceeded { .. } => {
                self.cardinality_dropped.fetch_add(1, Ordering::Relaxed);
            }
            MetricsError::ExportBacklogDropped { .. } => {
                self.backlog_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: DIAGNOSTICS_TARGET, error = %err, "Snapshot dropped");
            }
            MetricsError::ExportFailed { .. } => {
                self.exports_failed.fetch_add(1, Ordering::Relaxed);
                error!(target: DIAGNOSTICS_TARGET, error = %err, "Snapshot lost");
            }
            MetricsError::ExportRejected { .. } => {
                self.exports_rejected.fetch_add(1, Ordering::Relaxed);
                error!(target: DIAGNOSTICS_TARGET, error = %err, "Snapshot lost");
            }
            MetricsError::ShutdownIncomplete { .. } => {
                self.shutdown_incomplete.fetch_add(1, Ordering::Relaxed);
                warn!(target: DIAGNOSTICS_TARGET, error = %err, "Final flush incomplete");
            }
            other => {
                warn!(target: DIAGNOSTICS_TARGET, error = %other, "Pipeline error");
            }
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.export_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.exports_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            invalid_measurements: self.invalid_measurements.load(Ordering::Relaxed),
            cardinality_dropped: self.cardinality_dropped.load(Ordering::Relaxed),
            backlog_dropped: self.backlog_dropped.load(Ordering::Relaxed),
            export_attempts: self.export_attempts.load(Ordering::Relaxed),
            exports_succeeded: self.exports_succeeded.load(Ordering::Relaxed),
            exports_failed: self.exports_failed.load(Ordering::Relaxed),
            exports_rejected: self.exports_rejected.load(Ordering::Relaxed),
            shutdown_incomplete: self.shutdown_incomplete.load(Ordering::Relaxed),
        }
    }
}
