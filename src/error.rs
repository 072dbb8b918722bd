//! Error types for policy validation and configuration loading.
//!
//! The admission path itself never fails: an over-quota caller is a
//! [`Decision::Reject`](crate::Decision::Reject), not an error. These types only
//! surface while building policies or reading configuration at startup.
use std::path::PathBuf;
use std::time::Duration;

/// Errors produced when validating a [`Policy`](crate::Policy).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The counting window must be non-zero.
    #[error("window must be > 0 (got {0:?})")]
    InvalidWindow(Duration),
    /// The base block duration must be non-zero.
    #[error("base_block must be > 0 (got {0:?})")]
    InvalidBaseBlock(Duration),
    /// At least one escalation step is required.
    #[error("max_escalation_steps must be >= 1 (got {provided})")]
    InvalidEscalationSteps {
        /// Value provided by caller.
        provided: u32,
    },
}

/// Errors produced while loading or validating a [`LimiterConfig`](crate::LimiterConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An endpoint-class name did not match any known class.
    #[error("unknown endpoint class '{name}'")]
    UnknownEndpointClass {
        /// The name as written in the configuration.
        name: String,
    },
    /// A policy override failed validation.
    #[error("invalid policy for '{class}': {source}")]
    InvalidPolicy {
        /// Endpoint-class name the policy was configured for.
        class: String,
        /// Underlying validation failure.
        #[source]
        source: PolicyError,
    },
    /// The janitor interval must be non-zero.
    #[error("janitor_interval_ms must be > 0")]
    ZeroJanitorInterval,
    /// The configuration document was not valid JSON for this schema.
    #[error("failed to parse limiter config: {0}")]
    Parse(#[from] serde_json::Error),
    /// The configuration file could not be read.
    #[error("failed to read limiter config {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}
