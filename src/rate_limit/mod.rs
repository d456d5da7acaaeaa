// Fixed-window rate limiting for login, OAuth and introspection paths.
//
// Keyed "<category>:<ip>". State is in-memory only (resets on restart) and
// per process, so it is an abuse guard rather than a security boundary.

use crate::clock::SharedClock;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

mod middleware;

pub use middleware::{classify_path, client_ip, rate_limit_middleware, RateLimitCategory};

/// Stale windows are swept at most this often.
const SWEEP_INTERVAL_SECONDS: i64 = 60;

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    /// Login attempts: 5 per 15 minutes per IP
    pub const LOGIN: RateLimitPolicy = RateLimitPolicy {
        limit: 5,
        window: Duration::minutes(15),
    };

    /// OAuth flows: 10 per hour per IP
    pub const OAUTH: RateLimitPolicy = RateLimitPolicy {
        limit: 10,
        window: Duration::hours(1),
    };

    /// Token introspection: 100 per minute per IP
    pub const INTROSPECTION: RateLimitPolicy = RateLimitPolicy {
        limit: 100,
        window: Duration::minutes(1),
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests counted in the current window, including this one
    pub current: u32,
    pub limit: u32,
    /// Time until the window resets
    pub reset_in: Duration,
}

impl RateLimitResult {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.current)
    }

    /// Whole seconds until reset, rounded up.
    pub fn reset_in_seconds(&self) -> u64 {
        let millis = self.reset_in.num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// Counter for one key.
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Fixed-window rate limiter.
///
/// Windows are created lazily on first request and reset lazily once
/// `reset_at` has passed.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    clock: SharedClock,
    last_sweep: Mutex<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            windows: DashMap::new(),
            clock,
            last_sweep: Mutex::new(now),
        }
    }

    /// Count one request against `key` and report whether it is allowed.
    ///
    /// Requests over the limit are still counted.
    pub fn check(&self, key: &str, policy: RateLimitPolicy) -> RateLimitResult {
        let now = self.clock.now();
        self.maybe_sweep(now);

        // The entry guard holds the shard lock for read-increment-write.
        let mut window = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            reset_at: now + policy.window,
        });

        if window.reset_at <= now {
            window.count = 0;
            window.reset_at = now + policy.window;
        }

        window.count = window.count.saturating_add(1);

        RateLimitResult {
            allowed: window.count <= policy.limit,
            current: window.count,
            limit: policy.limit,
            reset_in: (window.reset_at - now).max(Duration::zero()),
        }
    }

    /// Drop every window whose reset time has passed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at > now);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys (for monitoring)
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        {
            let Ok(mut last) = self.last_sweep.try_lock() else {
                // Another request is already sweeping.
                return;
            };
            if now - *last < Duration::seconds(SWEEP_INTERVAL_SECONDS) {
                return;
            }
            *last = now;
        }
        self.windows.retain(|_, window| window.reset_at > now);
    }
}
