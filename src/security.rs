//! Admission checks for inbound events: per-sender rate limiting, the IP
//! allowlist and chat-platform event authenticity.

use axum::http::HeaderMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Sliding window used by sender rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Max distinct senders tracked before the least recently seen is evicted.
pub const RATE_LIMIT_MAX_KEYS: usize = 10_000;
/// How often the limiter sweeps idle senders from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300;

pub const TIMESTAMP_HEADER: &str = "X-Lark-Request-Timestamp";
pub const NONCE_HEADER: &str = "X-Lark-Request-Nonce";
pub const SIGNATURE_HEADER: &str = "X-Lark-Signature";

/// Per-identifier sliding-window limiter. A limit of 0 admits everything.
#[derive(Debug)]
pub struct RateLimiter {
    limit_per_window: u32,
    window: Duration,
    max_keys: usize,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl RateLimiter {
    pub fn new(limit_per_window: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            limit_per_window,
            window,
            max_keys: max_keys.max(1),
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(
            limit,
            Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            RATE_LIMIT_MAX_KEYS,
        )
    }

    fn prune_stale(requests: &mut HashMap<String, Vec<Instant>>, cutoff: Instant) {
        requests.retain(|_, timestamps| {
            timestamps.retain(|t| *t > cutoff);
            !timestamps.is_empty()
        });
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Admission check as of `now`; records the call when admitted.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        if now.saturating_duration_since(*last_sweep)
            >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS)
        {
            Self::prune_stale(requests, cutoff);
            *last_sweep = now;
        }

        if !requests.contains_key(key) && requests.len() >= self.max_keys {
            Self::prune_stale(requests, cutoff);
            *last_sweep = now;

            if requests.len() >= self.max_keys {
                let evict_key = requests
                    .iter()
                    .min_by_key(|(_, timestamps)| timestamps.last().copied().unwrap_or(cutoff))
                    .map(|(k, _)| k.clone());
                if let Some(evict_key) = evict_key {
                    requests.remove(&evict_key);
                }
            }
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            tracing::warn!(key, "Rate limit exceeded");
            return false;
        }

        entry.push(now);
        true
    }

    /// Number of identifiers currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.requests.lock().0.len()
    }
}

/// Exact-match IP allowlist. Disabled or empty means allow all.
#[derive(Debug, Clone, Default)]
pub struct IpAllowlist {
    enabled: bool,
    entries: Vec<String>,
}

impl IpAllowlist {
    pub fn new(enabled: bool, entries: &[String]) -> Self {
        Self {
            enabled,
            entries: entries
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, client_ip: &str) -> bool {
        if !self.enabled || self.entries.is_empty() {
            return true;
        }
        let allowed = self.entries.iter().any(|entry| entry == client_ip);
        if !allowed {
            tracing::warn!(client_ip, "IP not in allowlist");
        }
        allowed
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Checks the verification token and request signature on inbound events.
#[derive(Debug, Clone, Default)]
pub struct EventVerifier {
    enabled: bool,
    verification_token: Option<String>,
    encrypt_key: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl EventVerifier {
    pub fn new(enabled: bool, verification_token: &str, encrypt_key: &str) -> Self {
        Self {
            enabled,
            verification_token: non_empty(verification_token),
            encrypt_key: non_empty(encrypt_key),
        }
    }

    pub fn checks_token(&self) -> bool {
        self.enabled && self.verification_token.is_some()
    }

    pub fn checks_signature(&self) -> bool {
        self.enabled && self.encrypt_key.is_some()
    }

    /// The event's token lives in `header.token` (schema 2.0) or at the top
    /// level (legacy events).
    pub fn verify_token(&self, event: &serde_json::Value) -> bool {
        let Some(expected) = self.verification_token.as_deref().filter(|_| self.enabled) else {
            return true;
        };
        let presented = event
            .pointer("/header/token")
            .or_else(|| event.get("token"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        constant_time_eq(presented.as_bytes(), expected.as_bytes())
    }

    /// `sha256(timestamp + nonce + encrypt_key + body)`, hex encoded.
    pub fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(key) = self.encrypt_key.as_deref().filter(|_| self.enabled) else {
            return true;
        };
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let signature = header(SIGNATURE_HEADER);
        if signature.is_empty() {
            return false;
        }
        let expected = event_signature(&header(TIMESTAMP_HEADER), &header(NONCE_HEADER), key, body);
        constant_time_eq(signature.as_bytes(), expected.as_bytes())
    }
}

pub fn event_signature(timestamp: &str, nonce: &str, encrypt_key: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub fn parse_client_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"').trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }

    let value = value.trim_matches(['[', ']']);
    value.parse::<IpAddr>().ok()
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        for candidate in xff.split(',') {
            if let Some(ip) = parse_client_ip(candidate) {
                return Some(ip);
            }
        }
    }

    headers
        .get("X-Real-IP")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_client_ip)
}

/// Client IP used for the allowlist: forwarded headers first when trusted,
/// then the socket peer.
pub fn client_ip_from_request(
    peer_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_forwarded_headers: bool,
) -> String {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_client_ip(headers) {
            return ip.to_string();
        }
    }

    peer_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
