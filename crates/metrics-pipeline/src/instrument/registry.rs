//! Registry of named instruments.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_stack::Report;
use tracing::debug;

use crate::error::MetricsError;
use crate::error::MetricsResult;
use crate::instrument::InstrumentDescriptor;

/// Holds one descriptor per instrument name.
///
/// Safe to share between any number of producers; creation of distinct names
/// only contends on the shard that holds the name.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    instruments: DashMap<String, Arc<InstrumentDescriptor>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registered descriptor for `descriptor.name()`, registering
    /// it on first use.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::InvalidInstrumentName`] if the name breaks the naming rules
    /// - [`MetricsError::DuplicateInstrument`] if the name is taken by an
    ///   instrument of another kind or unit
    pub fn get_or_create(
        &self,
        descriptor: InstrumentDescriptor,
    ) -> MetricsResult<Arc<InstrumentDescriptor>> {
        descriptor.validate_name().map_err(Report::new)?;

        match self.instruments.entry(descriptor.name().to_string()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.conflicts_with(&descriptor) {
                    return Err(Report::new(MetricsError::DuplicateInstrument {
                        name: descriptor.name().to_string(),
                        existing: existing.kind(),
                        existing_unit: existing.unit().map(str::to_string),
                        requested: descriptor.kind(),
                        requested_unit: descriptor.unit().map(str::to_string),
                    }));
                }
                Ok(Arc::clone(existing))
            }
            Entry::Vacant(slot) => {
                debug!(name = descriptor.name(), kind = %descriptor.kind(), "Registered instrument");
                let descriptor = Arc::new(descriptor);
                slot.insert(Arc::clone(&descriptor));
                Ok(descriptor)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<InstrumentDescriptor>> {
        self.instruments.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}
