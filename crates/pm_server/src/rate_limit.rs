//! Per-IP rate limiting
//!
//! Fixed-window counters keyed by (hashed ip, action). Raw client addresses
//! never enter the table: they are hashed with a deployment salt first, and
//! only the 16-hex-char truncation is kept. Counter races between
//! concurrent workers may overshoot a limit by the worker count, which is
//! acceptable.

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub const AUTH_MAX_PER_WINDOW: u32 = 5;
pub const MESSAGE_MAX_PER_WINDOW: u32 = 60;
pub const WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateAction {
    Connection,
    Auth,
    Message,
}

struct Bucket {
    count: u32,
    reset_at: i64,
}

pub struct RateLimiter {
    enabled: bool,
    buckets: Mutex<HashMap<(String, RateAction), Bucket>>,
}

impl RateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn is_rate_limited(
        &self,
        ip_hash: &str,
        action: RateAction,
        max: u32,
        window_ms: i64,
    ) -> bool {
        self.is_rate_limited_at(
            ip_hash,
            action,
            max,
            window_ms,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn is_rate_limited_at(
        &self,
        ip_hash: &str,
        action: RateAction,
        max: u32,
        window_ms: i64,
        now: i64,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((ip_hash.to_string(), action))
            .or_insert(Bucket { count: 0, reset_at: now + window_ms });

        if now > bucket.reset_at {
            bucket.count = 1;
            bucket.reset_at = now + window_ms;
            return false;
        }
        if bucket.count >= max {
            return true;
        }
        bucket.count += 1;
        false
    }

    /// Drop the counter, e.g. after a successful authentication.
    pub fn reset_for_ip(&self, ip_hash: &str, action: RateAction) {
        self.buckets.lock().remove(&(ip_hash.to_string(), action));
    }
}

/// sha256(ip ‖ salt), truncated to 16 hex chars.
pub fn hash_ip(ip: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}
