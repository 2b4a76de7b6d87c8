//! Fixed-window admission control.
//!
//! Each key gets a counter that resets once its window has elapsed. Denied
//! requests do not touch the counter, so a client hammering a closed window
//! is let back in as soon as the window ends.
//!
//! [`AdmissionController::check`] keeps one bucket per client and policy
//! rule, so `/api` traffic and `/api/auth` traffic count separately.
//!
//! State is per process. Running N instances behind a load balancer gives
//! each instance its own quota, so the effective limit is N times the
//! configured one.

pub mod sweeper;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::keys::{KeyExtractor, RequestMeta};
use crate::policy::PolicyTable;
use crate::types::{AdmissionKey, Decision, Policy, WindowEntry};

pub use sweeper::{SweepReport, Sweeper, SweeperHandle, DEFAULT_SWEEP_INTERVAL};

/// Per-key window state. Only [`AdmissionController`] and the sweeper touch
/// it; every read-modify-write happens under one lock.
#[derive(Default)]
pub struct WindowStore {
    entries: Mutex<HashMap<AdmissionKey, WindowEntry>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `key` if its window has room.
    pub(crate) fn admit(&self, key: &AdmissionKey, policy: &Policy, now: u64) -> Decision {
        let mut entries = self.entries.lock();

        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| WindowEntry::fresh(now, policy));

        if now.saturating_sub(entry.window_start) >= policy.window_length_ms() {
            *entry = WindowEntry::fresh(now, policy);
        } else {
            // Direct `admit` callers may apply another policy to a live key;
            // keep the expiry in step with the one being applied.
            entry.expires_at = entry.window_start.saturating_add(policy.window_length_ms());
        }

        let reset_at = entry.expires_at;
        if entry.count >= policy.max_requests() {
            return Decision {
                allowed: false,
                limit: policy.max_requests(),
                remaining: 0,
                reset_at,
            };
        }

        entry.count += 1;
        Decision {
            allowed: true,
            limit: policy.max_requests(),
            remaining: policy.max_requests() - entry.count,
            reset_at,
        }
    }

    /// Drop every entry whose window ended before `now`. Returns how many
    /// were removed.
    pub(crate) fn sweep(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn get(&self, key: &AdmissionKey) -> Option<WindowEntry> {
        self.entries.lock().get(key).copied()
    }
}

/// Full result of checking one request
#[derive(Debug, Clone)]
pub struct Verdict {
    pub key: AdmissionKey,
    /// Name of the policy rule that applied
    pub policy_name: String,
    pub policy: Policy,
    pub decision: Decision,
    /// Time the decision was taken at
    pub now: u64,
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.decision.retry_after_secs(self.now)
    }
}

/// Counters since process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStats {
    pub allowed: u64,
    pub denied: u64,
    pub tracked_keys: usize,
    pub evicted: u64,
}

#[derive(Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

/// Ties key extraction, policy lookup and the window store together.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<WindowStore>,
    policies: Arc<PolicyTable>,
    extractor: KeyExtractor,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl AdmissionController {
    pub fn new(policies: PolicyTable, extractor: KeyExtractor) -> Self {
        Self::with_clock(policies, extractor, Arc::new(SystemClock))
    }

    pub fn with_clock(policies: PolicyTable, extractor: KeyExtractor, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(WindowStore::new()),
            policies: Arc::new(policies),
            extractor,
            clock,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Decide a single request for `key` under `policy` at `now`.
    pub fn admit(&self, key: &AdmissionKey, policy: &Policy, now: u64) -> Decision {
        let decision = self.store.admit(key, policy, now);
        if decision.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// Extract the key, look up the route's policy and admit, using the
    /// controller's clock. The bucket is the client key scoped to the
    /// matched rule, so traffic under one rule never spends or resets the
    /// quota of another.
    pub fn check(&self, meta: &RequestMeta) -> Verdict {
        self.check_at(meta, self.clock.now_ms())
    }

    pub fn check_at(&self, meta: &RequestMeta, now: u64) -> Verdict {
        let rule = self.policies.resolve(meta.route.as_deref().unwrap_or("/"));
        let key = self.extractor.extract_key(meta).scoped(&rule.prefix);
        let decision = self.admit(&key, &rule.policy, now);

        if !decision.allowed {
            debug!(
                policy = %rule.name,
                limit = decision.limit,
                reset_at = decision.reset_at,
                "request denied"
            );
        }

        Verdict {
            key,
            policy_name: rule.name.clone(),
            policy: rule.policy,
            decision,
            now,
        }
    }

    /// One eviction pass over the store
    pub fn sweep(&self, now: u64) -> usize {
        let evicted = self.store.sweep(now);
        self.counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            tracked_keys: self.store.len(),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }
}
