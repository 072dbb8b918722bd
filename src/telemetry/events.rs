use crate::policy::EndpointClass;
use std::fmt;
use std::time::Duration;

/// Events emitted by the limiter, its middleware and its janitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A request was admitted.
    Allowed {
        /// Endpoint class of the request.
        class: EndpointClass,
        /// Resolved client identifier.
        client_id: String,
        /// Requests left in the window.
        remaining: u32,
    },
    /// A request was turned away.
    Rejected {
        /// Endpoint class of the request.
        class: EndpointClass,
        /// Resolved client identifier.
        client_id: String,
        /// Seconds until the block lifts.
        retry_after_secs: u64,
    },
    /// A client crossed its quota and a new block was recorded.
    Blocked {
        /// Endpoint class of the request.
        class: EndpointClass,
        /// Resolved client identifier.
        client_id: String,
        /// Length of the block just applied.
        block: Duration,
    },
    /// A janitor sweep removed expired entries.
    Evicted {
        /// Entries removed by this sweep.
        count: usize,
        /// Entries left after the sweep.
        remaining_entries: usize,
    },
    /// An operator cleared a client's state by hand.
    Cleared {
        /// Client whose entries were removed.
        client_id: String,
        /// Class filter, if any.
        class: Option<EndpointClass>,
        /// Entries removed.
        count: usize,
    },
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Allowed { class, client_id, remaining } => {
                write!(f, "Allowed({class}, {client_id}, remaining={remaining})")
            }
            RateLimitEvent::Rejected { class, client_id, retry_after_secs } => {
                write!(f, "Rejected({class}, {client_id}, retry_after={retry_after_secs}s)")
            }
            RateLimitEvent::Blocked { class, client_id, block } => {
                write!(f, "Blocked({class}, {client_id}, block={block:?})")
            }
            RateLimitEvent::Evicted { count, remaining_entries } => {
                write!(f, "Evicted({count}, remaining={remaining_entries})")
            }
            RateLimitEvent::Cleared { client_id, class: Some(class), count } => {
                write!(f, "Cleared({client_id}, {class}, count={count})")
            }
            RateLimitEvent::Cleared { client_id, class: None, count } => {
                write!(f, "Cleared({client_id}, *, count={count})")
            }
        }
    }
}
