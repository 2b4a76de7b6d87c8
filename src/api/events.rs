//! Recent admission activity for the introspection endpoint.
//! Ring buffer; oldest events fall off once it is full.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const MAX_EVENTS: usize = 200;

/// Events never carry the admission key or client address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum AdmissionEvent {
    #[serde(rename = "request_denied", rename_all = "camelCase")]
    RequestDenied {
        timestamp: u64,
        route: String,
        policy: String,
        limit: u32,
        retry_after_secs: u64,
    },
    #[serde(rename = "sweep_completed", rename_all = "camelCase")]
    SweepCompleted {
        timestamp: u64,
        evicted: usize,
        remaining: usize,
    },
    #[serde(rename = "gate_started", rename_all = "camelCase")]
    GateStarted {
        timestamp: u64,
        version: String,
        policies: usize,
    },
}

#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<VecDeque<AdmissionEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_EVENTS))),
        }
    }

    pub async fn push(&self, event: AdmissionEvent) {
        let mut events = self.events.write().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Newest first
    pub async fn latest(&self, limit: usize) -> Vec<AdmissionEvent> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied(timestamp: u64) -> AdmissionEvent {
        AdmissionEvent::RequestDenied {
            timestamp,
            route: "/api/auth/login".into(),
            policy: "critical".into(),
            limit: 10,
            retry_after_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_ring_buffer_drops_oldest() {
        let log = EventLog::new();
        for ts in 0..(MAX_EVENTS as u64 + 5) {
            log.push(denied(ts)).await;
        }

        assert_eq!(log.len().await, MAX_EVENTS);
        assert_eq!(log.latest(1).await, vec![denied(MAX_EVENTS as u64 + 4)]);
        assert_eq!(log.latest(MAX_EVENTS).await.last(), Some(&denied(5)));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(denied(1)).unwrap();
        assert_eq!(json["type"], "request_denied");
        assert_eq!(json["policy"], "critical");
        assert_eq!(json["retryAfterSecs"], 30);
        assert!(json.get("retry_after_secs").is_none());
    }
}
