//! Process-wide meter provider.
//!
//! Until [`set_provider`] is called every lookup resolves to the no-op
//! provider, so instrumentation never fails because telemetry is not wired up
//! yet. The provider can be set exactly once. Instruments created before that
//! stay no-op; create them after [`set_provider`] to have them recorded.

use std::time::Duration;

use error_stack::Report;
use once_cell::sync::OnceCell;
use tracing::info;

use crate::error::MetricsError;
use crate::error::MetricsResult;
use crate::provider::Meter;
use crate::provider::MeterProvider;

static GLOBAL_PROVIDER: OnceCell<MeterProvider> = OnceCell::new();

/// Install the process-wide provider.
///
/// # Errors
///
/// - [`MetricsError::ProviderAlreadySet`] on every call after the first
pub fn set_provider(provider: MeterProvider) -> MetricsResult<()> {
    GLOBAL_PROVIDER
        .set(provider)
        .map_err(|_| Report::new(MetricsError::ProviderAlreadySet))?;
    info!("Global meter provider set");
    Ok(())
}

/// The installed provider, or the no-op provider.
pub fn provider() -> MeterProvider {
    GLOBAL_PROVIDER
        .get()
        .cloned()
        .unwrap_or_else(MeterProvider::noop)
}

/// Get a meter from the current provider.
pub fn meter(name: impl Into<String>) -> Meter {
    provider().meter(name)
}

/// Flush the current provider now.
pub async fn force_flush(timeout: Duration) -> MetricsResult<()> {
    provider().force_flush(timeout).await
}

/// Shut down the current provider; meant for process-exit handling.
pub async fn shutdown(timeout: Duration) -> MetricsResult<()> {
    provider().shutdown(timeout).await
}
