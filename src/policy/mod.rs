//! Route prefix → limit table.
//!
//! Rules are matched by longest prefix on path segment boundaries, so
//! `/api/auth` covers `/api/auth/login` but not `/api/authors`. Paths that
//! match no rule get the table's default policy.

use serde::Serialize;
use thiserror::Error;

use crate::types::Policy;

const MINUTE_MS: u64 = 60 * 1000;

/// Prefix of the fallback rule
pub const DEFAULT_PREFIX: &str = "*";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("max_requests must be greater than zero")]
    ZeroMaxRequests,
    #[error("window length must be greater than zero")]
    ZeroWindow,
    #[error("invalid route prefix {0:?}: must be non-empty and start with '/'")]
    InvalidPrefix(String),
    #[error("duplicate route prefix {0:?}")]
    DuplicatePrefix(String),
}

/// One row of the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub prefix: String,
    /// Label used in logs, events and the `RateLimit-Policy` header
    pub name: String,
    pub policy: Policy,
}

impl PolicyRule {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>, policy: Policy) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            policy,
        }
    }

    fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/')
    }
}

/// Immutable once built; validation happens in [`PolicyTable::new`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTable {
    default: PolicyRule,
    /// Sorted by prefix length, longest first
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    /// Build a table. The default rule's prefix is replaced with `*`.
    pub fn new(default: PolicyRule, rules: Vec<PolicyRule>) -> Result<Self, PolicyError> {
        let mut default = default;
        default.prefix = DEFAULT_PREFIX.to_string();
        let mut rules = rules;
        for (i, rule) in rules.iter().enumerate() {
            if rule.prefix.is_empty() || !rule.prefix.starts_with('/') {
                return Err(PolicyError::InvalidPrefix(rule.prefix.clone()));
            }
            if rules[..i].iter().any(|r| r.prefix == rule.prefix) {
                return Err(PolicyError::DuplicatePrefix(rule.prefix.clone()));
            }
        }
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self { default, rules })
    }

    /// Table with no route rules
    pub fn uniform(name: impl Into<String>, policy: Policy) -> Self {
        Self {
            default: PolicyRule::new(DEFAULT_PREFIX, name, policy),
            rules: Vec::new(),
        }
    }

    /// Route classes used by the marketplace gateway: public pages are
    /// loose, the JSON API is per-minute, auth endpoints are strict.
    pub fn standard() -> Result<Self, PolicyError> {
        Self::new(
            PolicyRule::new("*", "public", Policy::new(100, 15 * MINUTE_MS)?),
            vec![
                PolicyRule::new("/api", "api", Policy::new(100, MINUTE_MS)?),
                PolicyRule::new("/api/auth", "critical", Policy::new(10, 15 * MINUTE_MS)?),
                PolicyRule::new("/api/admin", "admin", Policy::new(1000, 15 * MINUTE_MS)?),
            ],
        )
    }

    /// Replace or add rules. A rule with prefix `*` replaces the default.
    pub fn with_overrides(self, overrides: Vec<PolicyRule>) -> Result<Self, PolicyError> {
        let mut default = self.default;
        let mut rules = self.rules;
        for rule in overrides {
            if rule.prefix == DEFAULT_PREFIX {
                default = rule;
            } else if let Some(existing) = rules.iter_mut().find(|r| r.prefix == rule.prefix) {
                *existing = rule;
            } else {
                rules.push(rule);
            }
        }
        Self::new(default, rules)
    }

    /// Rule governing `path`
    pub fn resolve(&self, path: &str) -> &PolicyRule {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .unwrap_or(&self.default)
    }

    pub fn lookup(&self, path: &str) -> Policy {
        self.resolve(path).policy
    }

    pub fn default_rule(&self) -> &PolicyRule {
        &self.default
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }
}
