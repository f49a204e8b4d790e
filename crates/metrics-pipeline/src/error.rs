//! Error types for the metrics pipeline.
//!
//! Recording APIs never surface these to application code. They are returned
//! from explicit lifecycle calls (`force_flush`, `shutdown`, `set_provider`),
//! from the fallible `try_create_*` constructors, and are otherwise reported
//! through [`crate::diagnostics`].

use core::error::Error;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;

use crate::instrument::InstrumentKind;

/// Result type for pipeline operations.
pub type MetricsResult<T> = Result<T, Report<MetricsError>>;

/// Errors produced by the collection and export pipeline.
#[derive(Debug, Clone, PartialEq, Display)]
pub enum MetricsError {
    /// An instrument with the same name already exists with another kind or unit
    #[display(
        "Instrument `{name}` already registered as {existing} (unit {existing_unit:?}), requested {requested} (unit {requested_unit:?})"
    )]
    DuplicateInstrument {
        name: String,
        existing: InstrumentKind,
        existing_unit: Option<String>,
        requested: InstrumentKind,
        requested_unit: Option<String>,
    },

    /// Instrument name does not follow the naming rules
    #[display("Invalid instrument name `{name}`: {reason}")]
    InvalidInstrumentName { name: String, reason: &'static str },

    /// Caller supplied a value the instrument cannot accept
    #[display("Invalid measurement for `{name}`: {reason}")]
    InvalidMeasurement { name: String, reason: &'static str },

    /// The current window already tracks the maximum number of series
    #[display("Cardinality limit of {limit} series reached, dropping new series for `{name}`")]
    CardinalityLimitExceeded { name: String, limit: usize },

    /// A queued snapshot was evicted because the export queue was full
    #[display("Export backlog full (depth {depth}), dropped snapshot of {series} series")]
    ExportBacklogDropped { depth: usize, series: usize },

    /// Transient failures exhausted the retry budget
    #[display("Export failed after {attempts} attempt(s)")]
    ExportFailed { attempts: u32 },

    /// The payload was refused permanently, no retry was made
    #[display("Export rejected: {reason}")]
    ExportRejected { reason: String },

    /// The final flush did not finish before the shutdown deadline
    #[display("Shutdown did not complete within {timeout:?}")]
    ShutdownIncomplete { timeout: Duration },

    /// A forced flush did not finish in time
    #[display("Flush did not complete within {timeout:?}")]
    FlushTimeout { timeout: Duration },

    /// The provider has already been shut down
    #[display("Meter provider is already shut down")]
    AlreadyShutdown,

    /// `set_provider` was called more than once
    #[display("Global meter provider is already set")]
    ProviderAlreadySet,

    /// Configuration errors
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// Snapshot could not be serialized by the codec
    #[display("Encoding error: {message}")]
    Encoding { message: String },
}

impl Error for MetricsError {}
