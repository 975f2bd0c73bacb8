//! Fixed-window rate limiter.
//!
//! Best-effort and per-process only: each instance counts independently, so
//! this is not a substitute for limiting at an edge or load-balancer layer
//! when running multiple instances.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub ok: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

struct WindowCounter {
    window_start_ms: i64,
    count: u32,
}

pub struct RateLimiter {
    name: &'static str,
    limit: u32,
    window_ms: i64,
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: u32, window_secs: u64) -> Self {
        Self {
            name,
            limit,
            window_ms: (window_secs.max(1) * 1000) as i64,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of caller keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Count one hit for `key` in the current window.
    pub fn hit(&self, key: &str, now: DateTime<Utc>) -> RateDecision {
        let now_ms = now.timestamp_millis();
        let window_start_ms = now_ms - now_ms.rem_euclid(self.window_ms);
        let reset_at = Utc
            .timestamp_millis_opt(window_start_ms + self.window_ms)
            .single()
            .unwrap_or(now);

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        // Windows are epoch-aligned, so every key shares the same boundary;
        // one sweep drops all rolled-over counters and keeps the map bounded
        // by the number of distinct callers in the current window.
        counters.retain(|_, counter| counter.window_start_ms == window_start_ms);
        let counter = counters.entry(key.to_string()).or_insert(WindowCounter {
            window_start_ms,
            count: 0,
        });

        if counter.count >= self.limit {
            return RateDecision {
                ok: false,
                limit: self.limit,
                remaining: 0,
                reset_at,
            };
        }

        counter.count += 1;
        RateDecision {
            ok: true,
            limit: self.limit,
            remaining: self.limit - counter.count,
            reset_at,
        }
    }
}
