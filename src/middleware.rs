//! Tower middleware that applies a [`RateLimiter`] to HTTP requests.
//!
//! One layer is installed per route group, each with its [`EndpointClass`]:
//!
//! ```rust
//! use speedbump::{EndpointClass, RateLimitLayer, RateLimiter};
//! use tower::{service_fn, Layer};
//!
//! let limiter = RateLimiter::default();
//! let login = RateLimitLayer::new(limiter.clone(), EndpointClass::AuthLogin).layer(service_fn(
//!     |_req: http::Request<String>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(String::from("ok")))
//!     },
//! ));
//! # let _ = login;
//! ```
//!
//! Admitted requests get `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset` on the inner service's response. Rejected requests never
//! reach the inner service and receive a 429 with a JSON body.

use crate::client_id::{peer_addr, resolve_client_id};
use crate::limiter::{Decision, RateLimiter};
use crate::policy::EndpointClass;
use crate::telemetry::{emit_best_effort, NullSink, RateLimitEvent};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// `X-RateLimit-Limit`: quota of the endpoint class.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`: requests left in the window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`: window reset time, epoch ms. On a 429, never before the block lifts.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// A layer that rate-limits requests for one endpoint class.
#[derive(Clone, Debug)]
pub struct RateLimitLayer<Sk = NullSink> {
    limiter: RateLimiter,
    class: EndpointClass,
    sink: Sk,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(limiter: RateLimiter, class: EndpointClass) -> Self {
        Self { limiter, class, sink: NullSink }
    }
}

impl<Sk> RateLimitLayer<Sk> {
    /// Report `Allowed`, `Rejected` and `Blocked` events to `sink`.
    pub fn with_sink<T>(self, sink: T) -> RateLimitLayer<T> {
        RateLimitLayer { limiter: self.limiter, class: self.class, sink }
    }
}

impl<S, Sk: Clone> Layer<S> for RateLimitLayer<Sk> {
    type Service = RateLimitService<S, Sk>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            class: self.class,
            sink: self.sink.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitService<S, Sk = NullSink> {
    inner: S,
    limiter: RateLimiter,
    class: EndpointClass,
    sink: Sk,
}

impl<S, Sk> RateLimitService<S, Sk> {
    /// Endpoint class this service enforces.
    pub fn class(&self) -> EndpointClass {
        self.class
    }
}

fn set_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at()));
}

fn too_many_requests<B: From<String>>(decision: &Decision) -> Response<B> {
    let retry_after = decision.retry_after_secs().unwrap_or_default();
    let body = serde_json::json!({
        "error": "Too Many Requests",
        "message": format!("Rate limit exceeded. Try again in {retry_after} seconds."),
        "retryAfter": retry_after,
        "blockedUntil": decision.blocked_until().unwrap_or_default(),
    });

    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    set_limit_headers(headers, decision);
    response
}

impl<S, Sk, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, Sk>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
    Sk: tower::Service<RateLimitEvent, Response = ()> + Clone + Send + 'static,
    Sk::Error: std::error::Error + Send + 'static,
    Sk::Future: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        let class = self.class;
        let sink = self.sink.clone();

        Box::pin(async move {
            let client_id =
                resolve_client_id(req.headers(), peer_addr(req.extensions()), limiter.forwarded_headers());
            let decision = limiter.decide(class, &client_id);

            match decision {
                Decision::Allow { remaining, .. } => {
                    emit_best_effort(sink, RateLimitEvent::Allowed { class, client_id, remaining }).await;
                    let mut response = inner.call(req).await?;
                    set_limit_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Decision::Reject { retry_after_secs, new_block, .. } => {
                    if let Some(block) = new_block {
                        emit_best_effort(
                            sink.clone(),
                            RateLimitEvent::Blocked { class, client_id: client_id.clone(), block },
                        )
                        .await;
                    }
                    emit_best_effort(sink, RateLimitEvent::Rejected { class, client_id, retry_after_secs })
                        .await;
                    Ok(too_many_requests(&decision))
                }
            }
        })
    }
}
