//! Read-only store statistics for operator endpoints.

use crate::policy::EndpointClass;
use crate::store::WindowStore;
use serde::Serialize;
use std::collections::BTreeMap;

/// Snapshot of the window store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    /// Entries currently tracked, stale or not.
    pub total_entries: usize,
    /// Entries whose block is still in force.
    pub blocked_count: usize,
    /// Entries per endpoint class. Classes with no entries are omitted.
    pub counts_by_endpoint_class: BTreeMap<EndpointClass, usize>,
}

/// Scan `store` once. O(n) in store size.
pub fn collect(store: &WindowStore, now: u64) -> LimiterStats {
    store.snapshot().into_iter().fold(LimiterStats::default(), |mut stats, (key, entry)| {
        stats.total_entries += 1;
        if entry.is_blocked_at(now) {
            stats.blocked_count += 1;
        }
        *stats.counts_by_endpoint_class.entry(key.class).or_insert(0) += 1;
        stats
    })
}
