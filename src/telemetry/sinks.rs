use super::events::RateLimitEvent;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type Delivered = Ready<Result<(), Infallible>>;

/// Send `event` to `sink`, honoring `poll_ready`. Errors are swallowed.
///
/// Admission must not depend on telemetry: a sink that is not ready or fails
/// simply loses the event.
pub async fn emit_best_effort<S>(sink: S, event: RateLimitEvent)
where
    S: tower::Service<RateLimitEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<RateLimitEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Delivered;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RateLimitEvent) -> Self::Future {
        ready(Ok(()))
    }
}

/// Writes events to `tracing`.
///
/// Rejections and new blocks are logged at WARN, everything else at INFO.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<RateLimitEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Delivered;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        match &event {
            RateLimitEvent::Rejected { .. } | RateLimitEvent::Blocked { .. } => {
                tracing::warn!(target: "speedbump::telemetry", event = %event, "rate_limit_event");
            }
            _ => tracing::info!(target: "speedbump::telemetry", event = %event, "rate_limit_event"),
        }
        ready(Ok(()))
    }
}

/// Keeps the most recent events in memory. Clones share the same buffer.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<RateLimitEvent>>>,
    capacity: usize,
}

impl MemorySink {
    /// Sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Sink holding up to `capacity` events; the oldest is dropped when full.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1_024)))), capacity }
    }

    /// Stored events, oldest first.
    pub fn events(&self) -> Vec<RateLimitEvent> {
        self.events.lock().map(|guard| guard.iter().cloned().collect()).unwrap_or_default()
    }

    /// Drop all stored events.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.events.lock() {
            guard.clear();
        }
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Whether no events are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RateLimitEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Delivered;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        if let Ok(mut guard) = self.events.lock() {
            if guard.len() == self.capacity {
                guard.pop_front();
            }
            guard.push_back(event);
        }
        ready(Ok(()))
    }
}
