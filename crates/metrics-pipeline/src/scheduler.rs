//! Periodic drain and export.
//!
//! Two background tasks share one [`SchedulerShared`]: the ticker drains the
//! store on every period and pushes the snapshot onto a bounded queue, and the
//! worker pops snapshots one at a time and runs the exporter. A single worker
//! keeps at most one export in flight and exports windows in drain order.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;

use crate::aggregation::AggregationStore;
use crate::config::PipelineConfig;
use crate::diagnostics::Diagnostics;
use crate::diagnostics::DIAGNOSTICS_TARGET;
use crate::error::MetricsError;
use crate::error::MetricsResult;
use crate::export::ExportTask;
use crate::export::Exporter;

const PHASE_IDLE: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_SHUTTING_DOWN: u8 = 2;
const PHASE_TERMINATED: u8 = 3;

/// Stands in for deadlines too far away to represent, about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `timeout` from now; very large timeouts mean "no practical deadline".
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Observable state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// background tasks not started
    #[display("idle")]
    Idle,
    /// waiting for the next tick
    #[display("waiting")]
    Waiting,
    /// rotating the aggregation window
    #[display("draining")]
    Draining,
    /// an export is in flight
    #[display("exporting")]
    Exporting,
    /// final flush in progress
    #[display("shutting_down")]
    ShuttingDown,
    #[display("terminated")]
    Terminated,
}

type ExportDone = oneshot::Sender<MetricsResult<()>>;

struct QueuedExport {
    task: ExportTask,
    /// notified with the export result, used by forced flushes
    done: Option<ExportDone>,
}

struct SchedulerShared {
    store: Arc<AggregationStore>,
    exporter: Exporter,
    diagnostics: Arc<Diagnostics>,
    max_queue_depth: usize,
    export_empty_snapshots: bool,
    collect_lock: Mutex<()>,
    queue: Mutex<VecDeque<QueuedExport>>,
    queue_notify: Notify,
    phase: AtomicU8,
    draining: AtomicBool,
    exporting: AtomicBool,
    /// stops the ticker
    tick_token: CancellationToken,
    /// lets the worker exit once the queue is empty
    worker_close: CancellationToken,
    /// stops retries and abandons queued snapshots
    retry_token: CancellationToken,
}

impl SchedulerShared {
    /// Drain the store and queue the snapshot behind earlier windows.
    fn collect_and_enqueue(&self, deadline: Option<Instant>, done: Option<ExportDone>) {
        let _guard = self.collect_lock.lock();

        self.draining.store(true, Ordering::Release);
        let snapshot = self.store.drain();
        self.draining.store(false, Ordering::Release);

        if snapshot.is_empty() && !self.export_empty_snapshots {
            trace!("Skipping empty snapshot");
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
            return;
        }

        let mut task = ExportTask::new(snapshot);
        task.deadline = deadline;

        let mut queue = self.queue.lock();
        if queue.len() >= self.max_queue_depth {
            if let Some(dropped) = queue.pop_front() {
                let err = MetricsError::ExportBacklogDropped {
                    depth: self.max_queue_depth,
                    series: dropped.task.snapshot.len(),
                };
                self.diagnostics.report(&err);
                if let Some(done) = dropped.done {
                    let _ = done.send(Err(Report::new(err)));
                }
            }
        }
        queue.push_back(QueuedExport { task, done });
        drop(queue);

        self.queue_notify.notify_one();
    }

    /// Fail every queued snapshot that has not started exporting.
    fn abandon_queue(&self) {
        let abandoned: Vec<QueuedExport> = self.queue.lock().drain(..).collect();
        for item in abandoned {
            let err = MetricsError::ExportBacklogDropped {
                depth: self.max_queue_depth,
                series: item.task.snapshot.len(),
            };
            self.diagnostics.report(&err);
            if let Some(done) = item.done {
                let _ = done.send(Err(Report::new(err)));
            }
        }
    }
}

async fn run_ticker(shared: Arc<SchedulerShared>, period: Duration) {
    let mut interval = tokio::time::interval_at(deadline_after(period), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.tick_token.cancelled() => {
                debug!("Export ticker stopped");
                break;
            }
            _ = interval.tick() => {
                shared.collect_and_enqueue(None, None);
            }
        }
    }
}

async fn run_worker(shared: Arc<SchedulerShared>) {
    loop {
        if shared.retry_token.is_cancelled() {
            shared.abandon_queue();
            break;
        }

        let next = shared.queue.lock().pop_front();
        let Some(mut item) = next else {
            if shared.worker_close.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shared.worker_close.cancelled() => {}
                _ = shared.retry_token.cancelled() => {}
                _ = shared.queue_notify.notified() => {}
            }
            continue;
        };

        shared.exporting.store(true, Ordering::Release);
        let result = shared.exporter.run(&mut item.task, &shared.retry_token).await;
        shared.exporting.store(false, Ordering::Release);

        if let Some(done) = item.done {
            let _ = done.send(result);
        }
    }
    debug!("Export worker stopped");
}

/// Drives periodic export of the aggregation store.
pub struct ExportScheduler {
    shared: Arc<SchedulerShared>,
    interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ExportScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportScheduler")
            .field("interval", &self.interval)
            .field("state", &self.state())
            .finish()
    }
}

impl ExportScheduler {
    pub fn new(
        store: Arc<AggregationStore>,
        exporter: Exporter,
        config: &PipelineConfig,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                store,
                exporter,
                diagnostics,
                max_queue_depth: config.max_queue_depth,
                export_empty_snapshots: config.export_empty_snapshots,
                collect_lock: Mutex::new(()),
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                phase: AtomicU8::new(PHASE_IDLE),
                draining: AtomicBool::new(false),
                exporting: AtomicBool::new(false),
                tick_token: CancellationToken::new(),
                worker_close: CancellationToken::new(),
                retry_token: CancellationToken::new(),
            }),
            interval: config.export_interval,
            ticker: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the ticker and the export worker on the current Tokio runtime.
    pub fn start(&self) -> MetricsResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Report::new(MetricsError::Configuration {
                message: "export scheduler must be started inside a Tokio runtime".into(),
            })
        })?;

        if self
            .shared
            .phase
            .compare_exchange(PHASE_IDLE, PHASE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        *self.worker.lock() = Some(runtime.spawn(run_worker(Arc::clone(&self.shared))));
        *self.ticker.lock() = Some(runtime.spawn(run_ticker(Arc::clone(&self.shared), self.interval)));

        info!(interval_ms = self.interval.as_millis() as u64, "Export scheduler started");
        Ok(())
    }

    pub fn state(&self) -> SchedulerState {
        match self.shared.phase.load(Ordering::Acquire) {
            PHASE_IDLE => SchedulerState::Idle,
            PHASE_SHUTTING_DOWN => SchedulerState::ShuttingDown,
            PHASE_TERMINATED => SchedulerState::Terminated,
            _ if self.shared.draining.load(Ordering::Acquire) => SchedulerState::Draining,
            _ if self.shared.exporting.load(Ordering::Acquire) => SchedulerState::Exporting,
            _ => SchedulerState::Waiting,
        }
    }

    /// Snapshots waiting behind the in-flight export.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Drain now and wait for that window to be exported.
    ///
    /// The window is queued behind snapshots already waiting, so it is
    /// exported after them.
    pub async fn force_flush(&self, timeout: Duration) -> MetricsResult<()> {
        if self.shared.phase.load(Ordering::Acquire) != PHASE_RUNNING {
            return Err(Report::new(MetricsError::AlreadyShutdown));
        }

        let (done, result) = oneshot::channel();
        self.shared
            .collect_and_enqueue(Some(deadline_after(timeout)), Some(done));

        match tokio::time::timeout(timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Report::new(MetricsError::AlreadyShutdown)),
            Err(_) => {
                let err = MetricsError::FlushTimeout { timeout };
                self.shared.diagnostics.report(&err);
                Err(Report::new(err))
            }
        }
    }

    /// Stop ticking. Returns `false` if shutdown already began.
    pub(crate) async fn begin_shutdown(&self) -> bool {
        let entered = self
            .shared
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |phase| {
                (phase == PHASE_IDLE || phase == PHASE_RUNNING).then_some(PHASE_SHUTTING_DOWN)
            })
            .is_ok();
        if !entered {
            return false;
        }

        self.shared.tick_token.cancel();
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }
        true
    }

    /// Queue the last window with an export deadline.
    pub(crate) fn enqueue_final(&self, deadline: Instant) {
        self.shared.collect_and_enqueue(Some(deadline), None);
    }

    /// Let the worker finish the queue and wait for it until `deadline`.
    ///
    /// On timeout the worker is told to stop retrying and to drop what is
    /// still queued; an attempt already in flight runs to its own timeout in
    /// the background. Returns whether the worker finished in time; a worker
    /// that died counts as not finished.
    pub(crate) async fn finish(&self, deadline: Instant) -> bool {
        self.shared.worker_close.cancel();

        let worker = self.worker.lock().take();
        let completed = match worker {
            Some(mut worker) => match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => true,
                Ok(Err(join_error)) => {
                    error!(target: DIAGNOSTICS_TARGET, error = %join_error, "Export worker died before the final flush");
                    self.shared.abandon_queue();
                    false
                }
                Err(_) => false,
            },
            None => {
                // never started, nobody will export what is queued
                self.shared.abandon_queue();
                true
            }
        };
        if !completed {
            self.shared.retry_token.cancel();
        }

        self.shared.phase.store(PHASE_TERMINATED, Ordering::Release);
        completed
    }
}

impl Drop for ExportScheduler {
    fn drop(&mut self) {
        // dropped without shutdown: stop ticking and let the worker finish
        // what is queued, the current window is not exported
        self.shared.tick_token.cancel();
        self.shared.worker_close.cancel();
    }
}
