use super::events::{BucketEvent, LifecycleEvent};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};

/// A tower service that receives every [`BucketEvent`] a limiter produces.
pub trait TelemetrySink:
    Service<BucketEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// Error surfaced by the sink; always swallowed by the limiter.
    type SinkError: std::error::Error + Send + 'static;
}

/// Drive `sink` once for `event`, dropping the event if the sink is not ready or fails.
pub async fn emit_best_effort<S>(sink: S, event: BucketEvent)
where
    S: Service<BucketEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    match sink.ready_oneshot().await {
        Ok(mut sink) => {
            if let Err(e) = sink.call(event).await {
                tracing::trace!(error = %e, "telemetry sink rejected event");
            }
        }
        Err(e) => tracing::trace!(error = %e, "telemetry sink unavailable"),
    }
}

type Accepted = Ready<Result<(), Infallible>>;

/// Discards everything. The default sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<BucketEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Accepted;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: BucketEvent) -> Accepted {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event through `tracing`; failed initialization is logged at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<BucketEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Accepted;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: BucketEvent) -> Accepted {
        match &event {
            BucketEvent::Lifecycle(LifecycleEvent::InitFailed { .. }) => {
                tracing::warn!(event = %event, "bucket_event")
            }
            _ => tracing::info!(event = %event, "bucket_event"),
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

#[derive(Debug)]
struct Ring {
    events: VecDeque<BucketEvent>,
    limit: usize,
    evicted: u64,
}

/// Keeps the most recent events in memory. Clones share one buffer.
///
/// Intended for tests and debugging endpoints.
#[derive(Clone, Debug)]
pub struct MemorySink {
    ring: Arc<Mutex<Ring>>,
}

impl MemorySink {
    const DEFAULT_LIMIT: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_LIMIT)
    }

    /// Retain at most `capacity` events (minimum 1), dropping the oldest first.
    pub fn with_capacity(capacity: usize) -> Self {
        let limit = capacity.max(1);
        Self {
            ring: Arc::new(Mutex::new(Ring {
                events: VecDeque::with_capacity(limit.min(1024)),
                limit,
                evicted: 0,
            })),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Ring) -> R, poisoned: R) -> R {
        match self.ring.lock() {
            Ok(ring) => f(&ring),
            Err(_) => poisoned,
        }
    }

    /// Snapshot of retained events, oldest first.
    pub fn events(&self) -> Vec<BucketEvent> {
        self.read(|r| r.events.iter().cloned().collect(), Vec::new())
    }

    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.events.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.read(|r| r.events.len(), 0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.read(|r| r.limit, 0)
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.read(|r| r.evicted, 0)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<BucketEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Accepted;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: BucketEvent) -> Accepted {
        if let Ok(mut ring) = self.ring.lock() {
            if ring.events.len() == ring.limit {
                ring.events.pop_front();
                ring.evicted += 1;
            }
            ring.events.push_back(event);
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
