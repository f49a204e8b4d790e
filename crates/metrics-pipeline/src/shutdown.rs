//! Final flush on termination.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tracing::debug;
use tracing::info;

use crate::aggregation::AggregationStore;
use crate::diagnostics::Diagnostics;
use crate::error::MetricsError;
use crate::error::MetricsResult;
use crate::scheduler::deadline_after;
use crate::scheduler::ExportScheduler;

/// Stops the pipeline and bounds how long the final flush may block.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    store: Arc<AggregationStore>,
    scheduler: Arc<ExportScheduler>,
    diagnostics: Arc<Diagnostics>,
}

impl ShutdownCoordinator {
    pub fn new(
        store: Arc<AggregationStore>,
        scheduler: Arc<ExportScheduler>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            store,
            scheduler,
            diagnostics,
        }
    }

    /// Stop ticking, export the last window and wait at most `timeout`.
    ///
    /// The steps are: stop the ticker, close the store to new measurements,
    /// queue the final window, and wait for the export worker to empty the
    /// queue. A failed final export is reported to diagnostics like any other
    /// export failure and does not fail the shutdown. Only the first call does
    /// any work; later calls return `Ok(())` at once.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::ShutdownIncomplete`] when the queue was not exported
    ///   before `timeout`. Pending retries are cancelled and the attempt in
    ///   flight is left to finish in the background. Also returned when the
    ///   export worker is gone; the queued windows are then dropped.
    pub async fn shutdown(&self, timeout: Duration) -> MetricsResult<()> {
        let deadline = deadline_after(timeout);

        if !self.scheduler.begin_shutdown().await {
            debug!("Metrics pipeline already shut down");
            return Ok(());
        }

        self.store.close();
        self.scheduler.enqueue_final(deadline);

        if self.scheduler.finish(deadline).await {
            info!("Metrics pipeline shut down");
            Ok(())
        } else {
            let err = MetricsError::ShutdownIncomplete { timeout };
            self.diagnostics.report(&err);
            Err(Report::new(err))
        }
    }
}
