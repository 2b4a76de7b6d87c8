//! Gateway configuration, read from the command line.
//!
//! Options:
//!   --port <PORT>                 API port (default: 8080)
//!   --sweep-interval <MS>         Sweeper period in ms (default: 60000)
//!   --key-strategy <STRATEGY>     ip | ip-route | subject (default: ip-route);
//!                                 `subject` needs an auth layer that sets
//!                                 `AuthenticatedSubject`, otherwise it keys
//!                                 like ip-route
//!   --no-trust-forwarded          Ignore X-Forwarded-For / CF-Connecting-IP / X-Real-IP
//!   --policy <RULE>               PREFIX=MAX/WINDOW_MS[:NAME], repeatable;
//!                                 PREFIX `*` replaces the default policy

use std::time::Duration;
use thiserror::Error;

use crate::keys::{KeyExtractor, KeyStrategy};
use crate::policy::{PolicyError, PolicyRule, PolicyTable};
use crate::types::Policy;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },
    #[error("malformed policy rule {0:?}, expected PREFIX=MAX/WINDOW_MS[:NAME]")]
    MalformedPolicy(String),
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub api_port: u16,
    pub sweep_interval_ms: u64,
    pub key_strategy: KeyStrategy,
    pub trust_forwarded: bool,
    /// Layered over [`PolicyTable::standard`]
    pub policy_overrides: Vec<PolicyRule>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_port: 8080,
            sweep_interval_ms: 60_000,
            key_strategy: KeyStrategy::IpRoute,
            trust_forwarded: true,
            policy_overrides: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Parse from `std::env::args()`
    pub fn from_env_args() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args().skip(1))
    }

    /// Parse options (without the program name)
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--port" => {
                    let value = next_value(&mut args, &flag)?;
                    config.api_port = parse_value(&flag, &value)?;
                }
                "--sweep-interval" => {
                    let value = next_value(&mut args, &flag)?;
                    config.sweep_interval_ms = parse_value(&flag, &value)?;
                    if config.sweep_interval_ms == 0 {
                        return Err(ConfigError::InvalidValue { flag: flag.clone(), value });
                    }
                }
                "--key-strategy" => {
                    let value = next_value(&mut args, &flag)?;
                    config.key_strategy = parse_value(&flag, &value)?;
                }
                "--no-trust-forwarded" => {
                    config.trust_forwarded = false;
                }
                "--policy" => {
                    let value = next_value(&mut args, &flag)?;
                    config.policy_overrides.push(parse_policy_rule(&value)?);
                }
                _ => return Err(ConfigError::UnknownOption(flag.clone())),
            }
        }

        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn build_policy_table(&self) -> Result<PolicyTable, PolicyError> {
        PolicyTable::standard()?.with_overrides(self.policy_overrides.clone())
    }

    pub fn key_extractor(&self) -> KeyExtractor {
        KeyExtractor::new(self.key_strategy).trust_forwarded(self.trust_forwarded)
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, ConfigError> {
    args.next().ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}

/// `/api/auth=5/60000:login`
fn parse_policy_rule(raw: &str) -> Result<PolicyRule, ConfigError> {
    let malformed = || ConfigError::MalformedPolicy(raw.to_string());

    let (prefix, rest) = raw.split_once('=').ok_or_else(malformed)?;
    let (limits, name) = match rest.split_once(':') {
        Some((limits, name)) if !name.is_empty() => (limits, name.to_string()),
        Some(_) => return Err(malformed()),
        None => (rest, prefix.trim_start_matches('/').replace('/', "-")),
    };
    let (max, window) = limits.split_once('/').ok_or_else(malformed)?;
    let max: u32 = max.trim().parse().map_err(|_| malformed())?;
    let window: u64 = window.trim().parse().map_err(|_| malformed())?;

    let name = match name.as_str() {
        "" => "root".to_string(),
        "*" => "default".to_string(),
        _ => name,
    };
    Ok(PolicyRule::new(prefix.trim(), name, Policy::new(max, window)?))
}
