//! Core data types for admission control.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::policy::PolicyError;

/// Identifies the bucket a request counts against, e.g. `ip:1.2.3.4` or
/// `ip:1.2.3.4|route:/api/auth/login`. The controller adds the matched rule
/// via [`AdmissionKey::scoped`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdmissionKey(String);

impl AdmissionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Narrow the key to one policy rule, so each route class keeps its
    /// own window for the same client.
    pub fn scoped(&self, rule_prefix: &str) -> Self {
        Self(format!("{}|policy:{}", self.0, rule_prefix))
    }
}

impl fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdmissionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for AdmissionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Limit parameters for one route category.
///
/// Both fields are guaranteed non-zero; the only way to build one is
/// [`Policy::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", rename_all = "camelCase")]
pub struct Policy {
    max_requests: u32,
    window_length_ms: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPolicy {
    max_requests: u32,
    window_length_ms: u64,
}

impl TryFrom<RawPolicy> for Policy {
    type Error = PolicyError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        Policy::new(raw.max_requests, raw.window_length_ms)
    }
}

impl Policy {
    pub fn new(max_requests: u32, window_length_ms: u64) -> Result<Self, PolicyError> {
        if max_requests == 0 {
            return Err(PolicyError::ZeroMaxRequests);
        }
        if window_length_ms == 0 {
            return Err(PolicyError::ZeroWindow);
        }
        Ok(Self { max_requests, window_length_ms })
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    /// Window length in whole seconds, rounded up
    pub fn window_secs(&self) -> u64 {
        self.window_length_ms.div_ceil(1000)
    }
}

/// Mutable per-key window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests admitted in the current window
    pub count: u32,
    /// Unix ms at which the current window opened
    pub window_start: u64,
    /// `window_start + window_length_ms` of the policy last applied
    pub expires_at: u64,
}

impl WindowEntry {
    pub fn fresh(now: u64, policy: &Policy) -> Self {
        Self {
            count: 0,
            window_start: now,
            expires_at: now.saturating_add(policy.window_length_ms()),
        }
    }

    /// True once `now` has reached the end of the window
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of a single admission check. A denial is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// `max_requests` of the policy that produced this decision
    pub limit: u32,
    pub remaining: u32,
    /// Unix ms at which the current window closes
    pub reset_at: u64,
}

impl Decision {
    /// Seconds until the window resets, rounded up and floored at zero.
    pub fn retry_after_secs(&self, now: u64) -> u64 {
        self.reset_at.saturating_sub(now).div_ceil(1000)
    }
}
