//! Handles given to application code.
//!
//! A handle is a capability to record against one instrument. Recording never
//! returns an error: rejected measurements are counted in the provider's
//! diagnostics and dropped. Handles created from a no-op meter drop every
//! measurement.

use std::sync::Arc;

use chrono::Utc;

use crate::aggregation::AggregationStore;
use crate::aggregation::SeriesKey;
use crate::attributes::AttributeSet;
use crate::instrument::InstrumentDescriptor;

#[derive(Debug, Clone)]
struct InstrumentHandle {
    descriptor: Arc<InstrumentDescriptor>,
    store: Option<Arc<AggregationStore>>,
}

impl InstrumentHandle {
    fn record(&self, value: f64, attributes: AttributeSet) {
        if let Some(store) = &self.store {
            let key = SeriesKey::new(Arc::clone(&self.descriptor), attributes);
            // already counted and logged by the store
            let _ = store.record(key, value, Utc::now());
        }
    }
}

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            inner: InstrumentHandle,
        }

        impl $name {
            pub(crate) fn new(descriptor: Arc<InstrumentDescriptor>, store: Arc<AggregationStore>) -> Self {
                Self {
                    inner: InstrumentHandle {
                        descriptor,
                        store: Some(store),
                    },
                }
            }

            pub(crate) fn noop(descriptor: InstrumentDescriptor) -> Self {
                Self {
                    inner: InstrumentHandle {
                        descriptor: Arc::new(descriptor),
                        store: None,
                    },
                }
            }

            /// Record one measurement.
            pub fn record(&self, value: impl Into<f64>, attributes: impl Into<AttributeSet>) {
                self.inner.record(value.into(), attributes.into());
            }

            pub fn descriptor(&self) -> &InstrumentDescriptor {
                &self.inner.descriptor
            }

            /// Whether measurements are dropped unconditionally.
            pub fn is_noop(&self) -> bool {
                self.inner.store.is_none()
            }
        }
    };
}

handle!(
    /// Monotonic counter; negative increments are dropped.
    Counter
);
handle!(
    /// Gauge keeping the most recent value per series.
    Gauge
);
handle!(
    /// Histogram with explicit bucket boundaries.
    Histogram
);

impl Counter {
    /// Increment the counter.
    pub fn add(&self, value: impl Into<f64>, attributes: impl Into<AttributeSet>) {
        self.record(value, attributes);
    }
}
