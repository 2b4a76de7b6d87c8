//! Derives admission keys from request metadata.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;

use crate::types::AdmissionKey;

/// Source address used when nothing better is available. Every such request
/// shares one bucket.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// What the hosting layer knows about an inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Raw `X-Forwarded-For` value
    pub forwarded_for: Option<String>,
    /// `CF-Connecting-IP` or `X-Real-IP`
    pub connecting_ip: Option<String>,
    /// Socket peer
    pub peer_addr: Option<SocketAddr>,
    pub route: Option<String>,
    /// Authenticated user id, if an upstream layer resolved one
    pub subject: Option<String>,
}

impl RequestMeta {
    pub fn from_peer(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr: Some(peer_addr),
            ..Default::default()
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// How requests are grouped into buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// `ip:<addr>`
    Ip,
    /// `ip:<addr>|route:<path>`
    #[default]
    IpRoute,
    /// `user:<id>`, or the ip-route key for anonymous requests
    Subject,
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(KeyStrategy::Ip),
            "ip-route" => Ok(KeyStrategy::IpRoute),
            "subject" => Ok(KeyStrategy::Subject),
            other => Err(format!("unknown key strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyExtractor {
    strategy: KeyStrategy,
    /// Honour forwarding headers. Turn off when not behind a proxy, since
    /// clients can set them freely.
    trust_forwarded: bool,
}

impl Default for KeyExtractor {
    fn default() -> Self {
        Self::new(KeyStrategy::default())
    }
}

impl KeyExtractor {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            strategy,
            trust_forwarded: true,
        }
    }

    pub fn trust_forwarded(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Client address: first forwarded-for hop, then the proxy's
    /// connecting-ip header, then the socket peer, then [`UNKNOWN_SOURCE`].
    pub fn source_address(&self, meta: &RequestMeta) -> String {
        if self.trust_forwarded {
            let forwarded = meta
                .forwarded_for
                .as_deref()
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return addr.to_string();
            }

            let connecting = meta
                .connecting_ip
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = connecting {
                return addr.to_string();
            }
        }

        meta.peer_addr
            .map(|peer| peer.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
    }

    pub fn extract_key(&self, meta: &RequestMeta) -> AdmissionKey {
        if self.strategy == KeyStrategy::Subject {
            if let Some(subject) = meta.subject.as_deref().filter(|s| !s.is_empty()) {
                return AdmissionKey::new(format!("user:{subject}"));
            }
        }

        let source = self.source_address(meta);
        match (self.strategy, meta.route.as_deref()) {
            (KeyStrategy::Ip, _) | (_, None) => AdmissionKey::new(format!("ip:{source}")),
            (_, Some(route)) => AdmissionKey::new(format!("ip:{source}|route:{route}")),
        }
    }
}
