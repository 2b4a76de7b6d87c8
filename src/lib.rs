//! Admission Gate Library
//!
//! Per-key fixed-window request admission control, plus an axum layer that
//! puts it in front of HTTP routes.
//!
//! ## Modules
//!
//! - `clock` - Time sources (wall clock, hand-driven clock for tests)
//! - `types` - Core data structures (AdmissionKey, Policy, WindowEntry, Decision)
//! - `policy` - Route prefix → policy table
//! - `keys` - Admission key extraction from request metadata
//! - `admission` - Window store, admission controller and background sweeper
//! - `api` - HTTP middleware, 429 responses and introspection endpoints
//! - `config` - Command-line configuration for the gateway binary

pub mod clock;
pub mod types;
pub mod policy;
pub mod keys;
pub mod admission;
pub mod api;
pub mod config;

pub use types::*;
pub use admission::{AdmissionController, Sweeper, SweeperHandle, Verdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use keys::{KeyExtractor, KeyStrategy, RequestMeta};
pub use policy::{PolicyError, PolicyRule, PolicyTable};
