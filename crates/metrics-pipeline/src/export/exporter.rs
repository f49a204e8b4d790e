//! Encodes snapshots and transmits them with retry.
//!
//! Delivery is not exactly-once. When an attempt times out or its response is
//! lost after the collector stored the payload, the retry delivers the same
//! window a second time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::codec::SnapshotCodec;
use super::retry::RetryPolicy;
use super::transport::Payload;
use super::transport::Transport;
use super::transport::TransportError;
use crate::aggregation::Snapshot;
use crate::diagnostics::Diagnostics;
use crate::diagnostics::DIAGNOSTICS_TARGET;
use crate::error::MetricsError;
use crate::error::MetricsResult;

/// A snapshot on its way to the collector.
#[derive(Debug)]
pub struct ExportTask {
    pub snapshot: Snapshot,
    /// attempts made so far
    pub attempts: u32,
    /// no retry is started that would wait past this instant
    pub deadline: Option<Instant>,
}

impl ExportTask {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            attempts: 0,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Serializes snapshots with a codec and sends them over a transport.
pub struct Exporter {
    codec: Box<dyn SnapshotCodec>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("content_type", &self.codec.content_type())
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl Exporter {
    pub fn new(
        codec: Box<dyn SnapshotCodec>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            codec,
            transport,
            policy,
            attempt_timeout,
            diagnostics,
        }
    }

    /// Export one snapshot without deadline or cancellation.
    pub async fn export(&self, snapshot: Snapshot) -> MetricsResult<()> {
        let mut task = ExportTask::new(snapshot);
        self.run(&mut task, &CancellationToken::new()).await
    }

    /// Drive `task` to success or final failure.
    ///
    /// Transient failures are retried with exponential backoff until the
    /// attempt budget, the task deadline or `cancel` stops them. `cancel`
    /// never interrupts an attempt that has already started. Failures are
    /// reported to diagnostics before they are returned.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::ExportRejected`] when the codec or the collector
    ///   refuses the payload
    /// - [`MetricsError::ExportFailed`] when no attempt succeeded
    pub async fn run(&self, task: &mut ExportTask, cancel: &CancellationToken) -> MetricsResult<()> {
        let body = match self.codec.encode(&task.snapshot) {
            Ok(body) => body,
            Err(report) => {
                let err = MetricsError::ExportRejected {
                    reason: "snapshot could not be encoded".into(),
                };
                self.diagnostics.report(&err);
                return Err(report.change_context(err));
            }
        };
        let payload = Payload {
            content_type: self.codec.content_type(),
            body: Bytes::from(body),
        };

        let mut backoff = self.policy.backoff();
        let mut last_error = None;

        while backoff.start_attempt() {
            task.attempts = backoff.attempt();
            self.diagnostics.record_attempt();

            let report = match self.attempt(payload.clone()).await {
                Ok(()) => {
                    self.diagnostics.record_success();
                    debug!(
                        attempts = task.attempts,
                        series = task.snapshot.len(),
                        bytes = payload.body.len(),
                        "Snapshot exported"
                    );
                    return Ok(());
                }
                Err(report) => report,
            };

            if !report.current_context().is_retryable() {
                let err = MetricsError::ExportRejected {
                    reason: report.current_context().to_string(),
                };
                self.diagnostics.report(&err);
                return Err(report.change_context(err));
            }

            let Some(delay) = backoff.next_delay() else {
                last_error = Some(report);
                break;
            };
            let past_deadline = task.deadline.is_some_and(|deadline| {
                Instant::now().checked_add(delay).map_or(true, |resume| resume > deadline)
            });
            if past_deadline {
                warn!(target: DIAGNOSTICS_TARGET, attempt = task.attempts, "Retry would pass the export deadline");
                last_error = Some(report);
                break;
            }

            warn!(
                target: DIAGNOSTICS_TARGET,
                attempt = task.attempts,
                delay_sec = delay.as_secs_f32(),
                error = %report.current_context(),
                "Export attempt failed, retrying after delay"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(target: DIAGNOSTICS_TARGET, attempt = task.attempts, "Export retries cancelled");
                    last_error = Some(report);
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let err = MetricsError::ExportFailed {
            attempts: task.attempts,
        };
        self.diagnostics.report(&err);
        Err(match last_error {
            Some(report) => report.change_context(err),
            None => Report::new(err),
        })
    }

    async fn attempt(&self, payload: Payload) -> Result<(), Report<TransportError>> {
        match tokio::time::timeout(self.attempt_timeout, self.transport.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(Report::new(TransportError::Transient {
                message: format!("attempt timed out after {:?}", self.attempt_timeout),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::aggregation::AggregationStore;
    use crate::aggregation::SeriesKey;
    use crate::attributes::AttributeSet;
    use crate::export::codec::json::JsonCodec;
    use crate::export::testing::FlakyTransport;
    use crate::export::testing::SlowTransport;
    use crate::instrument::InstrumentDescriptor;

    fn transient() -> TransportError {
        TransportError::Transient {
            message: "connection refused".into(),
        }
    }

    fn snapshot() -> Snapshot {
        let store = AggregationStore::new(10, Vec::new(), Arc::new(Diagnostics::new()));
        let key = SeriesKey::new(
            Arc::new(InstrumentDescriptor::counter("dummy_counter")),
            AttributeSet::from([("test", "curl")]),
        );
        store.record(key, 1.0, Utc::now()).expect("should record");
        store.drain()
    }

    fn exporter(transport: Arc<dyn Transport>, max_attempts: u32) -> (Exporter, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let exporter = Exporter::new(
            Box::new(JsonCodec::new("test")),
            transport,
            RetryPolicy::new(max_attempts, Duration::from_secs(1), Duration::from_secs(30)),
            Duration::from_secs(5),
            Arc::clone(&diagnostics),
        );
        (exporter, diagnostics)
    }

    #[test(tokio::test(start_paused = true))]
    async fn succeeds_on_third_attempt() {
        let transport = Arc::new(FlakyTransport::failing_first(2, transient()));
        let (exporter, diagnostics) = exporter(transport.clone(), 5);

        let mut task = ExportTask::new(snapshot());
        exporter
            .run(&mut task, &CancellationToken::new())
            .await
            .expect("third attempt should succeed");

        assert_eq!(task.attempts, 3);
        assert_eq!(transport.calls(), 3);
        assert_eq!(transport.delivered().len(), 1);
        assert_eq!(transport.delivered()[0].content_type, "application/json");
        let stats = diagnostics.snapshot();
        assert_eq!((stats.export_attempts, stats.exports_succeeded), (3, 1));
    }

    #[test(tokio::test(start_paused = true))]
    async fn gives_up_after_max_attempts() {
        let transport = Arc::new(FlakyTransport::always_failing(transient()));
        let (exporter, diagnostics) = exporter(transport.clone(), 2);

        let started = Instant::now();
        let report = exporter
            .export(snapshot())
            .await
            .expect_err("every attempt fails");
        let elapsed = started.elapsed();

        assert_eq!(report.current_context(), &MetricsError::ExportFailed { attempts: 2 });
        assert_eq!(transport.calls(), 2);
        // one backoff of 1s between the two attempts
        assert!(elapsed >= Duration::from_secs(1), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
        assert_eq!(diagnostics.snapshot().exports_failed, 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn permanent_failure_is_not_retried() {
        let transport = Arc::new(FlakyTransport::always_failing(TransportError::Rejected {
            status: 400,
            message: "malformed".into(),
        }));
        let (exporter, diagnostics) = exporter(transport.clone(), 5);

        let report = exporter.export(snapshot()).await.expect_err("rejected");

        assert!(matches!(report.current_context(), MetricsError::ExportRejected { .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(diagnostics.snapshot().exports_rejected, 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn attempt_timeout_counts_as_transient() {
        let transport = Arc::new(SlowTransport::new(Duration::from_secs(10)));
        let (exporter, _) = exporter(transport.clone(), 2);

        let report = exporter.export(snapshot()).await.expect_err("both attempts time out");

        assert_eq!(report.current_context(), &MetricsError::ExportFailed { attempts: 2 });
        assert_eq!(transport.calls(), 2);
        assert_eq!(transport.completed(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn deadline_stops_retries() {
        let transport = Arc::new(FlakyTransport::always_failing(transient()));
        let (exporter, _) = exporter(transport.clone(), 5);

        // 1s + 2s of backoff fit, the 4s one does not
        let mut task = ExportTask::new(snapshot()).with_deadline(Instant::now() + Duration::from_secs(5));
        let report = exporter
            .run(&mut task, &CancellationToken::new())
            .await
            .expect_err("deadline reached");

        assert_eq!(report.current_context(), &MetricsError::ExportFailed { attempts: 3 });
        assert_eq!(transport.calls(), 3);
    }

    #[test(tokio::test(start_paused = true))]
    async fn unbounded_backoff_stops_at_deadline() {
        let transport = Arc::new(FlakyTransport::always_failing(transient()));
        let diagnostics = Arc::new(Diagnostics::new());
        let exporter = Exporter::new(
            Box::new(JsonCodec::new("test")),
            transport.clone(),
            RetryPolicy::new(5, Duration::MAX, Duration::MAX),
            Duration::from_secs(5),
            diagnostics,
        );

        let mut task = ExportTask::new(snapshot()).with_deadline(Instant::now() + Duration::from_secs(60));
        let report = exporter
            .run(&mut task, &CancellationToken::new())
            .await
            .expect_err("the first retry would never fit");

        assert_eq!(report.current_context(), &MetricsError::ExportFailed { attempts: 1 });
        assert_eq!(transport.calls(), 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn cancel_interrupts_backoff() {
        let transport = Arc::new(FlakyTransport::always_failing(transient()));
        let (exporter, _) = exporter(transport.clone(), 5);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let mut task = ExportTask::new(snapshot());
        let report = exporter.run(&mut task, &cancel).await.expect_err("cancelled");
        canceller.await.expect("canceller should finish");

        assert_eq!(report.current_context(), &MetricsError::ExportFailed { attempts: 1 });
        assert_eq!(transport.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
