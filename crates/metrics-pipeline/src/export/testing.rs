//! In-memory transports for unit tests.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use parking_lot::Mutex;

use super::transport::Payload;
use super::transport::Transport;
use super::transport::TransportError;

/// Fails a fixed number of times, then accepts every payload.
pub(crate) struct FlakyTransport {
    failures: u32,
    error: TransportError,
    calls: AtomicU32,
    delivered: Mutex<Vec<Payload>>,
}

impl FlakyTransport {
    pub(crate) fn succeeding() -> Self {
        Self::failing_first(0, TransportError::Transient {
            message: "unused".into(),
        })
    }

    pub(crate) fn failing_first(failures: u32, error: TransportError) -> Self {
        Self {
            failures,
            error,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always_failing(error: TransportError) -> Self {
        Self::failing_first(u32::MAX, error)
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn delivered(&self) -> Vec<Payload> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(&self, payload: Payload) -> Result<(), Report<TransportError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(Report::new(self.error.clone()));
        }
        self.delivered.lock().push(payload);
        Ok(())
    }
}

/// Takes `delay` to accept each payload.
pub(crate) struct SlowTransport {
    delay: Duration,
    calls: AtomicU32,
    completed: AtomicU32,
}

impl SlowTransport {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SlowTransport {
    async fn send(&self, _payload: Payload) -> Result<(), Report<TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Panics inside every send, taking the calling task down.
pub(crate) struct PanickingTransport {
    calls: AtomicU32,
}

impl PanickingTransport {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for PanickingTransport {
    async fn send(&self, _payload: Payload) -> Result<(), Report<TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("transport blew up");
    }
}
