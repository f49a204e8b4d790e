//! Instrument identities, the registry and the handles given to application code.

use std::hash::Hash;
use std::hash::Hasher;

use derive_more::Display;
use serde::Serialize;

use crate::error::MetricsError;

pub mod handle;
pub mod registry;

pub use handle::Counter;
pub use handle::Gauge;
pub use handle::Histogram;
pub use registry::InstrumentRegistry;

const MAX_NAME_LEN: usize = 255;

/// Kind of instrument, which selects the aggregation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Monotonic sum
    #[display("counter")]
    Counter,
    /// Last value wins
    #[display("gauge")]
    Gauge,
    /// Distribution into explicit buckets
    #[display("histogram")]
    Histogram,
}

/// Immutable identity of an instrument.
///
/// Two descriptors are equal when name and kind match; unit and description
/// are metadata and do not take part in equality or hashing.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentDescriptor {
    name: String,
    kind: InstrumentKind,
    unit: Option<String>,
    description: Option<String>,
}

impl InstrumentDescriptor {
    pub fn new(name: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            unit: None,
            description: None,
        }
    }

    pub fn counter(name: impl Into<String>) -> Self {
        Self::new(name, InstrumentKind::Counter)
    }

    pub fn gauge(name: impl Into<String>) -> Self {
        Self::new(name, InstrumentKind::Gauge)
    }

    pub fn histogram(name: impl Into<String>) -> Self {
        Self::new(name, InstrumentKind::Histogram)
    }

    /// set unit, e.g. `ms` or `By`.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// set human readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether registering `other` next to `self` must be refused.
    pub(crate) fn conflicts_with(&self, other: &InstrumentDescriptor) -> bool {
        self.name == other.name && (self.kind != other.kind || self.unit != other.unit)
    }

    /// Check the instrument naming rules.
    pub(crate) fn validate_name(&self) -> Result<(), MetricsError> {
        let invalid = |reason| MetricsError::InvalidInstrumentName {
            name: self.name.clone(),
            reason,
        };

        let mut chars = self.name.chars();
        match chars.next() {
            None => return Err(invalid("name is empty")),
            Some(first) if !first.is_ascii_alphabetic() => {
                return Err(invalid("name must start with an ASCII letter"));
            }
            Some(_) => {}
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(invalid("name is longer than 255 characters"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/')) {
            return Err(invalid("name may only contain ASCII letters, digits, '_', '.', '-' or '/'"));
        }
        Ok(())
    }
}

impl PartialEq for InstrumentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}

impl Eq for InstrumentDescriptor {}

impl Hash for InstrumentDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.kind.hash(state);
    }
}
