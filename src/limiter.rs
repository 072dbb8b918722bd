//! Fixed-window admission control with escalating blocks.
//!
//! A [`RateLimiter`] is an explicitly constructed object: build one at startup,
//! clone it into every route layer (clones share state), and start its janitor
//! with [`RateLimiter::start_janitor`].
//!
//! ```rust
//! use speedbump::{Decision, EndpointClass, ManualClock, RateLimiter};
//!
//! let clock = ManualClock::new(0);
//! let limiter = RateLimiter::builder().clock(clock).build();
//!
//! for expected in [4, 3, 2, 1, 0] {
//!     let decision = limiter.decide(EndpointClass::AuthLogin, "1.2.3.4");
//!     assert_eq!(decision.remaining(), expected);
//! }
//! let sixth = limiter.decide(EndpointClass::AuthLogin, "1.2.3.4");
//! assert_eq!(sixth.retry_after_secs(), Some(900));
//! ```

use crate::client_id::ForwardedHeaders;
use crate::clock::{Clock, MonotonicClock};
use crate::config::LimiterConfig;
use crate::error::ConfigError;
use crate::janitor::{self, JanitorHandle, DEFAULT_JANITOR_INTERVAL};
use crate::policy::{EndpointClass, Policy, PolicyTable};
use crate::stats::{self, LimiterStats};
use crate::store::{WindowEntry, WindowKey, WindowStore};
use crate::telemetry::{emit_best_effort, NullSink, RateLimitEvent};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allow {
        /// Quota of the endpoint class.
        limit: u32,
        /// Requests left in the current window.
        remaining: u32,
        /// Epoch ms at which the window resets.
        reset_at: u64,
    },
    /// The request must be turned away with 429.
    Reject {
        /// Quota of the endpoint class.
        limit: u32,
        /// Whole seconds until the block lifts, rounded up.
        retry_after_secs: u64,
        /// Epoch ms at which the block lifts.
        blocked_until: u64,
        /// Epoch ms after which a request can be admitted again: the later of
        /// the window end and the block end.
        reset_at: u64,
        /// Length of the block, when this request is the one that started it.
        new_block: Option<Duration>,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// Quota of the endpoint class.
    pub fn limit(&self) -> u32 {
        match self {
            Decision::Allow { limit, .. } | Decision::Reject { limit, .. } => *limit,
        }
    }

    /// Requests left in the window; always 0 on reject.
    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allow { remaining, .. } => *remaining,
            Decision::Reject { .. } => 0,
        }
    }

    /// Epoch ms at which the window resets; on reject, never before the block lifts.
    pub fn reset_at(&self) -> u64 {
        match self {
            Decision::Allow { reset_at, .. } | Decision::Reject { reset_at, .. } => *reset_at,
        }
    }

    /// Seconds until retry is worthwhile, for rejects.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Reject { retry_after_secs, .. } => Some(*retry_after_secs),
            Decision::Allow { .. } => None,
        }
    }

    /// Epoch ms at which the block lifts, for rejects.
    pub fn blocked_until(&self) -> Option<u64> {
        match self {
            Decision::Reject { blocked_until, .. } => Some(*blocked_until),
            Decision::Allow { .. } => None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn retry_after_secs(blocked_until: u64, now: u64) -> u64 {
    let remaining = blocked_until.saturating_sub(now);
    remaining / 1_000 + u64::from(remaining % 1_000 != 0)
}

/// Apply one request to the entry for its key. Runs under the store's shard lock.
fn admit(slot: &mut Option<WindowEntry>, policy: &Policy, now: u64) -> Decision {
    let limit = policy.max_requests();

    if let Some(entry) = slot.as_ref() {
        if let Some(until) = entry.blocked_until.filter(|until| *until > now) {
            return Decision::Reject {
                limit,
                retry_after_secs: retry_after_secs(until, now),
                blocked_until: until,
                reset_at: entry.window_reset_at.max(until),
                new_block: None,
            };
        }
    }

    if slot.is_some_and(|entry| entry.window_expired_at(now)) {
        *slot = None;
    }
    let entry = slot.get_or_insert(WindowEntry::fresh(now, policy.window_millis()));
    // Block lapsed inside an open window: the count stays so the next overage escalates.
    entry.blocked_until = None;
    entry.request_count = entry.request_count.saturating_add(1);

    if entry.request_count > limit {
        let block = policy.block_duration(entry.request_count - limit);
        let until = now.saturating_add(millis(block));
        entry.blocked_until = Some(until);
        return Decision::Reject {
            limit,
            retry_after_secs: retry_after_secs(until, now),
            blocked_until: until,
            reset_at: entry.window_reset_at.max(until),
            new_block: Some(block),
        };
    }

    Decision::Allow {
        limit,
        remaining: limit.saturating_sub(entry.request_count),
        reset_at: entry.window_reset_at,
    }
}

#[derive(Debug)]
pub(crate) struct Inner {
    store: WindowStore,
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    forwarded: ForwardedHeaders,
    janitor_interval: Duration,
}

/// Per-endpoint-class rate limiter. Clones share the same store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RateLimiter {
    /// Limiter with the given policies and default clock and janitor interval.
    pub fn new(policies: PolicyTable) -> Self {
        Self::builder().policies(policies).build()
    }

    /// Start building a limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Build a limiter from a loaded configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self, ConfigError> {
        let policies = config.policy_table()?;
        Ok(Self::builder()
            .policies(policies)
            .forwarded_headers(config.forwarded_headers)
            .janitor_interval(config.janitor_interval()?)
            .build())
    }

    /// Check one request against the policy for `class`, at the limiter's clock.
    pub fn decide(&self, class: EndpointClass, client_id: &str) -> Decision {
        self.decide_at(class, client_id, self.now_millis())
    }

    /// Check one request at an explicit time (epoch ms).
    ///
    /// A client that is still blocked is rejected without touching its counter.
    /// Otherwise the request is counted in the current window (opening a new
    /// one if the old one has ended), and crossing the quota records a block of
    /// `base_block * min(overage, max_escalation_steps)`.
    pub fn decide_at(&self, class: EndpointClass, client_id: &str, now: u64) -> Decision {
        let policy = self.inner.policies.get(class);
        let key = WindowKey::new(class, client_id);
        let decision = self.inner.store.update(key, |slot| admit(slot, policy, now));

        match decision {
            Decision::Reject { new_block: Some(block), blocked_until, .. } => {
                tracing::warn!(
                    target: "speedbump::limiter",
                    class = %class,
                    client_id = %client_id,
                    block_ms = millis(block),
                    blocked_until,
                    "client blocked"
                );
            }
            Decision::Reject { retry_after_secs, .. } => {
                tracing::debug!(
                    target: "speedbump::limiter",
                    class = %class,
                    client_id = %client_id,
                    retry_after_secs,
                    "blocked client rejected"
                );
            }
            Decision::Allow { .. } => {}
        }
        decision
    }

    /// Counts of tracked entries, blocked clients and entries per class.
    pub fn stats(&self) -> LimiterStats {
        stats::collect(&self.inner.store, self.now_millis())
    }

    /// Remove state for `client_id`, for one class or all of them.
    ///
    /// Returns how many entries were removed. Used to unblock a client by hand.
    pub fn clear_entry(&self, client_id: &str, class: Option<EndpointClass>) -> usize {
        let removed = match class {
            Some(class) => {
                usize::from(self.inner.store.remove(&WindowKey::new(class, client_id)).is_some())
            }
            None => self.inner.store.retain(|key, _| key.client_id != client_id),
        };
        tracing::info!(
            target: "speedbump::limiter",
            client_id = %client_id,
            class = class.map(EndpointClass::as_str).unwrap_or("*"),
            removed,
            "rate limit entries cleared"
        );
        removed
    }

    /// [`clear_entry`](Self::clear_entry), then report a `Cleared` event to `sink`.
    pub async fn clear_entry_reported<S>(
        &self,
        client_id: &str,
        class: Option<EndpointClass>,
        sink: S,
    ) -> usize
    where
        S: tower::Service<RateLimitEvent, Response = ()> + Clone + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let count = self.clear_entry(client_id, class);
        emit_best_effort(sink, RateLimitEvent::Cleared { client_id: client_id.to_string(), class, count })
            .await;
        count
    }

    /// Evict expired entries now, at the limiter's clock.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.now_millis())
    }

    /// Evict entries stale at `now`.
    pub fn sweep_at(&self, now: u64) -> usize {
        janitor::sweep(&self.inner.store, now)
    }

    /// Spawn the background janitor at the configured interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_janitor(&self) -> JanitorHandle {
        self.start_janitor_with(self.inner.janitor_interval, NullSink)
    }

    /// Spawn the background janitor with an explicit interval and telemetry sink.
    ///
    /// A zero interval is replaced by [`DEFAULT_JANITOR_INTERVAL`].
    pub fn start_janitor_with<S>(&self, interval: Duration, sink: S) -> JanitorHandle
    where
        S: tower::Service<RateLimitEvent, Response = ()> + Clone + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let interval = if interval.is_zero() { DEFAULT_JANITOR_INTERVAL } else { interval };
        JanitorHandle::spawn(self.downgrade(), interval, sink)
    }

    /// Policy applied to `class`.
    pub fn policy(&self, class: EndpointClass) -> &Policy {
        self.inner.policies.get(class)
    }

    /// The full policy table.
    pub fn policies(&self) -> &PolicyTable {
        &self.inner.policies
    }

    /// How client identifiers are derived from forwarding headers.
    pub fn forwarded_headers(&self) -> ForwardedHeaders {
        self.inner.forwarded
    }

    /// Interval used by [`start_janitor`](Self::start_janitor).
    pub fn janitor_interval(&self) -> Duration {
        self.inner.janitor_interval
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &WindowStore {
        &self.inner.store
    }

    /// Current time on the limiter's clock, epoch ms.
    pub fn now_millis(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
}

/// Builder for [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimiterBuilder {
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    forwarded: ForwardedHeaders,
    janitor_interval: Duration,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            policies: PolicyTable::default(),
            clock: Arc::new(MonotonicClock::default()),
            forwarded: ForwardedHeaders::default(),
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
        }
    }
}

impl RateLimiterBuilder {
    /// Replace the whole policy table.
    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Override the policy for one class.
    pub fn policy(mut self, class: EndpointClass, policy: Policy) -> Self {
        self.policies = self.policies.with_policy(class, policy);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Choose how forwarding headers are trusted.
    pub fn forwarded_headers(mut self, forwarded: ForwardedHeaders) -> Self {
        self.forwarded = forwarded;
        self
    }

    /// Interval for [`RateLimiter::start_janitor`]. Zero is replaced by the default.
    pub fn janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = if interval.is_zero() { DEFAULT_JANITOR_INTERVAL } else { interval };
        self
    }

    /// Build the limiter.
    pub fn build(self) -> RateLimiter {
        RateLimiter {
            inner: Arc::new(Inner {
                store: WindowStore::new(),
                policies: self.policies,
                clock: self.clock,
                forwarded: self.forwarded,
                janitor_interval: self.janitor_interval,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;

    const LOGIN: EndpointClass = EndpointClass::AuthLogin;

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (RateLimiter::builder().clock(clock.clone()).build(), clock)
    }

    fn count(limiter: &RateLimiter, client: &str) -> u32 {
        limiter.store().get(&WindowKey::new(LOGIN, client)).map_or(0, |e| e.request_count)
    }

    #[test]
    fn allows_up_to_quota_with_decreasing_remaining() {
        let (limiter, _) = limiter();
        let remaining: Vec<u32> =
            (0..5).map(|_| limiter.decide(LOGIN, "1.2.3.4")).map(|d| d.remaining()).collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn login_scenario_blocks_sixth_request_for_fifteen_minutes() {
        let (limiter, clock) = limiter();
        let start = clock.now_millis();
        for _ in 0..5 {
            assert!(limiter.decide(LOGIN, "1.2.3.4").is_allowed());
        }

        let sixth = limiter.decide(LOGIN, "1.2.3.4");
        assert!(!sixth.is_allowed());
        assert_eq!(sixth.retry_after_secs(), Some(900));
        assert_eq!(sixth.blocked_until(), Some(start + 900_000));
        assert_eq!(sixth.remaining(), 0);
        assert!(matches!(sixth, Decision::Reject { new_block: Some(b), .. } if b == Duration::from_secs(900)));

        clock.advance(10_500);
        let seventh = limiter.decide(LOGIN, "1.2.3.4");
        assert_eq!(seventh.retry_after_secs(), Some(890));
        assert!(matches!(seventh, Decision::Reject { new_block: None, .. }));
        assert_eq!(count(&limiter, "1.2.3.4"), 6, "blocked requests are not counted");
    }

    #[test]
    fn retry_after_never_increases_while_blocked() {
        let (limiter, clock) = limiter();
        for _ in 0..6 {
            limiter.decide(LOGIN, "c");
        }
        let mut last = u64::MAX;
        for _ in 0..20 {
            let secs = limiter.decide(LOGIN, "c").retry_after_secs().expect("still blocked");
            assert!(secs <= last);
            last = secs;
            clock.advance(40_000);
        }
    }

    #[test]
    fn fresh_window_after_block_expires() {
        let (limiter, clock) = limiter();
        for _ in 0..6 {
            limiter.decide(LOGIN, "c");
        }
        clock.advance(900_001);
        let next = limiter.decide(LOGIN, "c");
        assert!(next.is_allowed());
        assert_eq!(count(&limiter, "c"), 1);
        assert_eq!(next.remaining(), 4);
        assert_eq!(next.reset_at(), clock.now_millis() + 60_000);
    }

    #[test]
    fn block_lapsing_inside_open_window_escalates() {
        let short = Policy::new(Duration::from_secs(60), 2, Duration::from_secs(10), 3).unwrap();
        let clock = ManualClock::new(0);
        let limiter = RateLimiter::builder().clock(clock.clone()).policy(LOGIN, short).build();

        limiter.decide(LOGIN, "c");
        limiter.decide(LOGIN, "c");
        let first = limiter.decide(LOGIN, "c");
        assert_eq!(first.retry_after_secs(), Some(10));

        clock.advance(10_000);
        let second = limiter.decide(LOGIN, "c");
        assert_eq!(second.retry_after_secs(), Some(20), "overage 2 doubles the block");

        clock.advance(20_000);
        let third = limiter.decide(LOGIN, "c");
        assert_eq!(third.retry_after_secs(), Some(30));

        clock.advance(29_999);
        let fourth = limiter.decide(LOGIN, "c");
        assert_eq!(fourth.retry_after_secs(), Some(1), "still inside the third block");
    }

    #[test]
    fn escalation_is_capped() {
        let policy = Policy::new(Duration::from_secs(3_600), 1, Duration::from_secs(1), 2).unwrap();
        let clock = ManualClock::new(0);
        let limiter = RateLimiter::builder().clock(clock.clone()).policy(LOGIN, policy).build();
        limiter.decide(LOGIN, "c");

        let mut blocks = Vec::new();
        for _ in 0..5 {
            if let Decision::Reject { new_block: Some(block), blocked_until, .. } = limiter.decide(LOGIN, "c") {
                blocks.push(block);
                clock.set(blocked_until);
            }
        }
        assert_eq!(
            blocks,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(2)
            ]
        );
    }

    #[test]
    fn clients_are_independent() {
        let (limiter, _) = limiter();
        for _ in 0..6 {
            limiter.decide(LOGIN, "a");
        }
        assert!(!limiter.decide(LOGIN, "a").is_allowed());
        let other = limiter.decide(LOGIN, "b");
        assert!(other.is_allowed());
        assert_eq!(other.remaining(), 4);
    }

    #[test]
    fn classes_are_independent() {
        let (limiter, _) = limiter();
        for _ in 0..6 {
            limiter.decide(LOGIN, "a");
        }
        assert!(limiter.decide(EndpointClass::ApiGeneral, "a").is_allowed());
    }

    #[test]
    fn zero_quota_rejects_everything() {
        let closed = Policy::new(Duration::from_secs(1), 0, Duration::from_secs(1), 1).unwrap();
        let limiter = RateLimiter::builder().clock(ManualClock::new(0)).policy(LOGIN, closed).build();
        let decision = limiter.decide(LOGIN, "c");
        assert_eq!(decision.retry_after_secs(), Some(1));
        assert_eq!(decision.limit(), 0);
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(1_001, 0), 2);
        assert_eq!(retry_after_secs(1_000, 0), 1);
        assert_eq!(retry_after_secs(1, 0), 1);
        assert_eq!(retry_after_secs(5, 10), 0);
    }

    #[test]
    fn clear_entry_targets_one_client() {
        let (limiter, _) = limiter();
        for _ in 0..6 {
            limiter.decide(LOGIN, "a");
        }
        limiter.decide(EndpointClass::ApiGeneral, "a");
        limiter.decide(LOGIN, "b");

        assert_eq!(limiter.clear_entry("a", Some(LOGIN)), 1);
        assert!(limiter.decide(LOGIN, "a").is_allowed(), "manual clear unblocks");
        assert_eq!(limiter.clear_entry("a", None), 2);
        assert_eq!(limiter.clear_entry("a", None), 0);
        assert_eq!(limiter.store().len(), 1);
    }

    #[tokio::test]
    async fn clear_entry_reported_emits_cleared() {
        let (limiter, _) = limiter();
        limiter.decide(LOGIN, "a");
        limiter.decide(EndpointClass::Public, "a");
        let sink = MemorySink::new();

        let count = limiter.clear_entry_reported("a", Some(LOGIN), sink.clone()).await;
        assert_eq!(count, 1);
        let count = limiter.clear_entry_reported("a", None, sink.clone()).await;
        assert_eq!(count, 1);
        assert_eq!(
            sink.events(),
            vec![
                RateLimitEvent::Cleared { client_id: "a".into(), class: Some(LOGIN), count: 1 },
                RateLimitEvent::Cleared { client_id: "a".into(), class: None, count: 1 },
            ]
        );
        assert!(limiter.store().is_empty());
    }

    #[test]
    fn reset_never_precedes_block_end() {
        let (limiter, clock) = limiter();
        let start = clock.now_millis();
        for _ in 0..6 {
            limiter.decide(LOGIN, "c");
        }
        clock.advance(120_000);
        let repeat = limiter.decide(LOGIN, "c");
        assert_eq!(repeat.retry_after_secs(), Some(780));
        assert_eq!(repeat.blocked_until(), Some(start + 900_000));
        assert_eq!(repeat.reset_at(), start + 900_000);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_janitor_interval_falls_back_to_default() {
        let (limiter, clock) = limiter();
        limiter.decide(EndpointClass::Public, "idle");
        let handle = limiter.start_janitor_with(Duration::ZERO, NullSink);
        tokio::task::yield_now().await;
        assert!(handle.is_running());

        clock.advance(61_000);
        tokio::time::sleep(DEFAULT_JANITOR_INTERVAL + Duration::from_secs(1)).await;
        assert!(handle.is_running());
        assert!(limiter.store().is_empty());
        handle.shutdown().await;
    }

    #[test]
    fn stats_reflect_blocked_entries() {
        let (limiter, _) = limiter();
        for _ in 0..6 {
            limiter.decide(LOGIN, "a");
        }
        limiter.decide(LOGIN, "b");
        limiter.decide(EndpointClass::Public, "b");

        let stats = limiter.stats();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.blocked_count, 1);
        assert_eq!(stats.counts_by_endpoint_class.get(&LOGIN), Some(&2));
        assert_eq!(stats.counts_by_endpoint_class.get(&EndpointClass::Public), Some(&1));
    }

    #[test]
    fn concurrent_decisions_count_exactly() {
        let policy = Policy::new(Duration::from_secs(60), 1_000, Duration::from_secs(1), 1).unwrap();
        let limiter = RateLimiter::builder().clock(ManualClock::new(0)).policy(LOGIN, policy).build();
        let threads: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..150).filter(|_| limiter.decide(LOGIN, "hot").is_allowed()).count()
                })
            })
            .collect();
        let allowed: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(allowed, 1_000);
        assert_eq!(count(&limiter, "hot"), 1_001, "counting stops once the block is recorded");
    }
}
