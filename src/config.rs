//! Startup configuration.
//!
//! Loaded once from JSON; the resulting [`RateLimiter`](crate::RateLimiter) does
//! not pick up later changes to the file.
//!
//! ```json
//! {
//!   "janitor_interval_ms": 300000,
//!   "forwarded_headers": "trust-first-hop",
//!   "policies": {
//!     "auth-login": { "window_ms": 60000, "max_requests": 5, "base_block_ms": 900000, "max_escalation_steps": 3 }
//!   }
//! }
//! ```

use crate::client_id::ForwardedHeaders;
use crate::error::ConfigError;
use crate::janitor::DEFAULT_JANITOR_INTERVAL;
use crate::policy::{EndpointClass, Policy, PolicySpec, PolicyTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Limiter configuration. Classes absent from `policies` keep their built-in policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    /// Janitor sweep interval in milliseconds.
    pub janitor_interval_ms: u64,
    /// Trust mode for `X-Forwarded-For`.
    pub forwarded_headers: ForwardedHeaders,
    /// Per-class policy overrides keyed by endpoint-class name.
    pub policies: BTreeMap<String, PolicySpec>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            janitor_interval_ms: u64::try_from(DEFAULT_JANITOR_INTERVAL.as_millis()).unwrap_or(u64::MAX),
            forwarded_headers: ForwardedHeaders::default(),
            policies: BTreeMap::new(),
        }
    }
}

impl LimiterConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(
            target: "speedbump::config",
            path = %path.display(),
            overrides = config.policies.len(),
            "loaded rate limit config"
        );
        Ok(config)
    }

    /// Check every override names a known class and is a valid policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.janitor_interval()?;
        self.policy_table().map(|_| ())
    }

    /// Janitor interval as a `Duration`; errors when zero.
    pub fn janitor_interval(&self) -> Result<Duration, ConfigError> {
        if self.janitor_interval_ms == 0 {
            return Err(ConfigError::ZeroJanitorInterval);
        }
        Ok(Duration::from_millis(self.janitor_interval_ms))
    }

    /// Built-in table with the configured overrides applied.
    pub fn policy_table(&self) -> Result<PolicyTable, ConfigError> {
        self.policies.iter().try_fold(PolicyTable::default(), |table, (name, spec)| -> Result<_, ConfigError> {
            let class: EndpointClass = name.parse()?;
            let policy = Policy::try_from(*spec)
                .map_err(|source| ConfigError::InvalidPolicy { class: name.clone(), source })?;
            Ok(table.with_policy(class, policy))
        })
    }

    /// Record `policy` as the override for `class`.
    pub fn with_policy(mut self, class: EndpointClass, policy: Policy) -> Self {
        self.policies.insert(class.as_str().to_string(), policy.into());
        self
    }
}
