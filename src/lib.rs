#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # speedbump
//!
//! Per-endpoint-class fixed-window rate limiting with escalating blocks, for
//! HTTP services built on tower.
//!
//! ## Features
//!
//! - **Endpoint classes**: one policy per route group (login, register, uploads, ...)
//! - **Fixed windows** keyed by `(class, client)` in a sharded concurrent store
//! - **Escalating blocks**: each request past quota lengthens the block, up to a cap
//! - **Tower middleware** emitting `X-RateLimit-*` headers and JSON 429 bodies
//! - **Background janitor** that evicts expired windows
//! - **Telemetry sinks** as `tower::Service`s, plus `tracing` logs
//!
//! ## Quick Start
//!
//! ```rust
//! use speedbump::{EndpointClass, RateLimitLayer, RateLimiter};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::default();
//!     let _janitor = limiter.start_janitor();
//!
//!     let login = RateLimitLayer::new(limiter.clone(), EndpointClass::AuthLogin).layer(service_fn(
//!         |_req: http::Request<String>| async {
//!             Ok::<_, std::convert::Infallible>(http::Response::new(String::from("welcome")))
//!         },
//!     ));
//!
//!     let response = login.oneshot(http::Request::new(String::new())).await.unwrap();
//!     assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
//!     assert_eq!(limiter.stats().total_entries, 1);
//! }
//! ```

pub mod client_id;
pub mod clock;
pub mod config;
pub mod error;
pub mod janitor;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod stats;
pub mod store;
pub mod telemetry;

// Re-exports
pub use client_id::{resolve_client_id, ForwardedHeaders, PeerAddr};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::LimiterConfig;
pub use error::{ConfigError, PolicyError};
pub use janitor::JanitorHandle;
pub use limiter::{Decision, RateLimiter, RateLimiterBuilder};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use policy::{EndpointClass, Policy, PolicySpec, PolicyTable};
pub use stats::LimiterStats;
pub use store::{WindowEntry, WindowKey, WindowStore};
