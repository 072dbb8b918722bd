//! Endpoint classes and their rate-limit policies.
//!
//! Every route registers under one [`EndpointClass`]. The set is closed, so the
//! [`PolicyTable`] always holds a policy for every class and there is no
//! runtime fallback for a mistyped name: parsing an unknown name is an error.

use crate::error::{ConfigError, PolicyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const CLASS_COUNT: usize = 7;

/// Logical grouping of routes that share one rate-limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointClass {
    /// Credential checks (`POST /auth/login`).
    AuthLogin,
    /// Account creation.
    AuthRegister,
    /// Password reset requests and token redemption.
    PasswordReset,
    /// Default class for authenticated API reads.
    ApiGeneral,
    /// Authenticated API mutations.
    ApiWrite,
    /// Artwork and attachment uploads.
    FileUpload,
    /// Unauthenticated endpoints (health, public catalog).
    Public,
}

impl EndpointClass {
    /// Every class, in declaration order.
    pub const ALL: [EndpointClass; CLASS_COUNT] = [
        EndpointClass::AuthLogin,
        EndpointClass::AuthRegister,
        EndpointClass::PasswordReset,
        EndpointClass::ApiGeneral,
        EndpointClass::ApiWrite,
        EndpointClass::FileUpload,
        EndpointClass::Public,
    ];

    /// Stable kebab-case name used in configuration and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::AuthLogin => "auth-login",
            EndpointClass::AuthRegister => "auth-register",
            EndpointClass::PasswordReset => "password-reset",
            EndpointClass::ApiGeneral => "api-general",
            EndpointClass::ApiWrite => "api-write",
            EndpointClass::FileUpload => "file-upload",
            EndpointClass::Public => "public",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointClass {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownEndpointClass { name: s.to_string() })
    }
}

/// Window size, quota and block escalation for one endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    window: Duration,
    max_requests: u32,
    base_block: Duration,
    max_escalation_steps: u32,
}

impl Policy {
    /// Create a validated policy.
    ///
    /// Errors if `window` or `base_block` is zero or `max_escalation_steps` is
    /// zero. A `max_requests` of zero is allowed and rejects every request.
    ///
    /// # Examples
    /// ```
    /// use speedbump::Policy;
    /// use std::time::Duration;
    /// let login = Policy::new(Duration::from_secs(60), 5, Duration::from_secs(900), 3).unwrap();
    /// assert_eq!(login.block_duration(7), Duration::from_secs(2_700));
    /// ```
    pub fn new(
        window: Duration,
        max_requests: u32,
        base_block: Duration,
        max_escalation_steps: u32,
    ) -> Result<Self, PolicyError> {
        if window.is_zero() {
            return Err(PolicyError::InvalidWindow(window));
        }
        if base_block.is_zero() {
            return Err(PolicyError::InvalidBaseBlock(base_block));
        }
        if max_escalation_steps == 0 {
            return Err(PolicyError::InvalidEscalationSteps { provided: 0 });
        }
        Ok(Self { window, max_requests, base_block, max_escalation_steps })
    }

    const fn preset(window_secs: u64, max_requests: u32, block_secs: u64, steps: u32) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_requests,
            base_block: Duration::from_secs(block_secs),
            max_escalation_steps: steps,
        }
    }

    /// Length of the counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests allowed per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Block length for the first step of overage.
    pub fn base_block(&self) -> Duration {
        self.base_block
    }

    /// Cap on the block multiplier.
    pub fn max_escalation_steps(&self) -> u32 {
        self.max_escalation_steps
    }

    /// Block length for a caller `overage` requests past quota.
    ///
    /// Grows linearly, one `base_block` per step, and stops growing at
    /// `max_escalation_steps`. An overage of zero is not a block.
    pub fn block_duration(&self, overage: u32) -> Duration {
        let steps = overage.min(self.max_escalation_steps);
        self.base_block.saturating_mul(steps)
    }

    pub(crate) fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Built-in policy for `class`.
    pub const fn default_for(class: EndpointClass) -> Self {
        match class {
            EndpointClass::AuthLogin => Self::preset(60, 5, 15 * 60, 3),
            EndpointClass::AuthRegister => Self::preset(60 * 60, 3, 60 * 60, 3),
            EndpointClass::PasswordReset => Self::preset(60 * 60, 3, 60 * 60, 2),
            EndpointClass::ApiGeneral => Self::preset(60, 100, 60, 5),
            EndpointClass::ApiWrite => Self::preset(60, 30, 2 * 60, 5),
            EndpointClass::FileUpload => Self::preset(60, 10, 5 * 60, 3),
            EndpointClass::Public => Self::preset(60, 300, 30, 3),
        }
    }
}

/// Wire form of [`Policy`]: millisecond integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Requests allowed per window.
    pub max_requests: u32,
    /// First-step block length in milliseconds.
    pub base_block_ms: u64,
    /// Cap on the block multiplier.
    pub max_escalation_steps: u32,
}

impl TryFrom<PolicySpec> for Policy {
    type Error = PolicyError;

    fn try_from(spec: PolicySpec) -> Result<Self, Self::Error> {
        Policy::new(
            Duration::from_millis(spec.window_ms),
            spec.max_requests,
            Duration::from_millis(spec.base_block_ms),
            spec.max_escalation_steps,
        )
    }
}

impl From<Policy> for PolicySpec {
    fn from(policy: Policy) -> Self {
        Self {
            window_ms: policy.window_millis(),
            max_requests: policy.max_requests,
            base_block_ms: u64::try_from(policy.base_block.as_millis()).unwrap_or(u64::MAX),
            max_escalation_steps: policy.max_escalation_steps,
        }
    }
}

/// Policy for every [`EndpointClass`]. Fixed once a limiter is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    policies: [Policy; CLASS_COUNT],
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self { policies: EndpointClass::ALL.map(Policy::default_for) }
    }
}

impl PolicyTable {
    /// Policy for `class`.
    pub fn get(&self, class: EndpointClass) -> &Policy {
        &self.policies[class.index()]
    }

    /// Replace the policy for `class`.
    pub fn with_policy(mut self, class: EndpointClass, policy: Policy) -> Self {
        self.policies[class.index()] = policy;
        self
    }

    /// Iterate `(class, policy)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (EndpointClass, &Policy)> + '_ {
        EndpointClass::ALL.into_iter().zip(self.policies.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login() -> Policy {
        Policy::new(Duration::from_millis(60_000), 5, Duration::from_millis(900_000), 3).unwrap()
    }

    #[test]
    fn names_round_trip() {
        for class in EndpointClass::ALL {
            assert_eq!(class.as_str().parse::<EndpointClass>().unwrap(), class);
            assert_eq!(class.to_string(), class.as_str());
        }
    }

    #[test]
    fn unknown_name_is_an_error() {
        let err = "auth_login".parse::<EndpointClass>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEndpointClass { ref name } if name == "auth_login"));
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&EndpointClass::PasswordReset).unwrap();
        assert_eq!(json, "\"password-reset\"");
        let back: EndpointClass = serde_json::from_str("\"file-upload\"").unwrap();
        assert_eq!(back, EndpointClass::FileUpload);
    }

    #[test]
    fn rejects_invalid_policies() {
        assert!(matches!(
            Policy::new(Duration::ZERO, 1, Duration::from_secs(1), 1),
            Err(PolicyError::InvalidWindow(_))
        ));
        assert!(matches!(
            Policy::new(Duration::from_secs(1), 1, Duration::ZERO, 1),
            Err(PolicyError::InvalidBaseBlock(_))
        ));
        assert!(matches!(
            Policy::new(Duration::from_secs(1), 1, Duration::from_secs(1), 0),
            Err(PolicyError::InvalidEscalationSteps { provided: 0 })
        ));
        assert!(Policy::new(Duration::from_secs(1), 0, Duration::from_secs(1), 1).is_ok());
    }

    #[test]
    fn block_duration_scales_linearly_then_caps() {
        let policy = login();
        assert_eq!(policy.block_duration(0), Duration::ZERO);
        assert_eq!(policy.block_duration(1), Duration::from_millis(900_000));
        assert_eq!(policy.block_duration(2), Duration::from_millis(1_800_000));
        assert_eq!(policy.block_duration(3), Duration::from_millis(2_700_000));
        assert_eq!(policy.block_duration(4), Duration::from_millis(2_700_000));
        assert_eq!(policy.block_duration(u32::MAX), Duration::from_millis(2_700_000));
    }

    #[test]
    fn default_table_matches_login_scenario() {
        let table = PolicyTable::default();
        assert_eq!(*table.get(EndpointClass::AuthLogin), login());
        assert_eq!(table.iter().count(), EndpointClass::ALL.len());
    }

    #[test]
    fn with_policy_overrides_one_class() {
        let strict = Policy::new(Duration::from_secs(10), 1, Duration::from_secs(5), 1).unwrap();
        let table = PolicyTable::default().with_policy(EndpointClass::Public, strict);
        assert_eq!(*table.get(EndpointClass::Public), strict);
        assert_eq!(*table.get(EndpointClass::ApiGeneral), Policy::default_for(EndpointClass::ApiGeneral));
    }

    #[test]
    fn spec_conversion_validates() {
        let spec = PolicySpec::from(login());
        assert_eq!(spec.window_ms, 60_000);
        assert_eq!(spec.base_block_ms, 900_000);
        assert_eq!(Policy::try_from(spec).unwrap(), login());

        let bad = PolicySpec { max_escalation_steps: 0, ..spec };
        assert!(Policy::try_from(bad).is_err());
    }
}
