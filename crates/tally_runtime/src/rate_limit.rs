//! Per-origin sliding-window rate limiting for the write path.
//!
//! The origin is whatever the gate resolved as the submitter's network
//! address. It is only ever a key in this map and is never stored with a
//! sample.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Maximum requests allowed in the window.
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(30)
    }
}

/// Request instants for one origin, oldest first.
#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<Instant>,
}

impl Window {
    fn expire(&mut self, cutoff: Instant) {
        while self.hits.front().is_some_and(|t| *t <= cutoff) {
            self.hits.pop_front();
        }
    }

    fn check_and_record(&mut self, now: Instant, config: &RateLimitConfig) -> RateLimitResult {
        self.expire(now.checked_sub(config.window).unwrap_or(now));
        let current = self.hits.len() as u32;
        match self.hits.front() {
            Some(oldest) if current >= config.max_requests => RateLimitResult::Limited {
                retry_after: config.window.saturating_sub(now - *oldest),
            },
            _ => {
                self.hits.push_back(now);
                RateLimitResult::Allowed {
                    remaining: config.max_requests.saturating_sub(current + 1),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Whole seconds for a `Retry-After` header, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Limited { retry_after } => Some(retry_after.as_secs() + 1),
            Self::Allowed { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: RwLock<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and record one request from `origin`.
    pub async fn check(&self, origin: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        windows
            .entry(origin.to_string())
            .or_default()
            .check_and_record(now, &self.config)
    }

    /// Remaining quota without consuming any.
    pub async fn remaining(&self, origin: &str) -> u32 {
        let Some(cutoff) = Instant::now().checked_sub(self.config.window) else {
            return self.config.max_requests;
        };
        let windows = self.windows.read().await;
        let active = windows
            .get(origin)
            .map(|w| w.hits.iter().filter(|t| **t > cutoff).count() as u32)
            .unwrap_or(0);
        self.config.max_requests.saturating_sub(active)
    }

    /// Drop origins whose window has fully expired. Returns how many remain.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);
        let mut windows = self.windows.write().await;
        windows.retain(|_, w| {
            w.expire(cutoff);
            !w.hits.is_empty()
        });
        windows.len()
    }

    pub async fn tracked_origins(&self) -> usize {
        self.windows.read().await.len()
    }
}
