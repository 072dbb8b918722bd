//! Telemetry for the limiter.
//!
//! Admission decisions, new blocks, janitor sweeps and manual clears are
//! described by [`RateLimitEvent`]. A sink is any
//! `tower::Service<RateLimitEvent, Response = ()>`, so sinks compose with
//! ordinary tower combinators. Delivery goes through [`emit_best_effort`].
//!
//! ```rust
//! use speedbump::telemetry::{MemorySink, RateLimitEvent};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(RateLimitEvent::Evicted { count: 3, remaining_entries: 10 }).await.unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

pub mod events;
pub mod sinks;

pub use events::RateLimitEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink};
