// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-ratelimit
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Default request body ceiling (1 MiB), enforced before parsing.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Quota for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteQuota {
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RouteQuota {
    /// A per-minute quota.
    #[must_use]
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

/// Rejection carrying the time after which a retry can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limited; retry after {retry_after_secs}s")]
pub struct RateLimited {
    /// Whole seconds until the oldest in-window request expires.
    pub retry_after_secs: u64,
}

/// Sliding-window limiter keyed by `(route, caller)`.
///
/// The caller key is the authenticated principal when one exists, otherwise
/// the source address.
pub struct KeyedRateLimiter {
    routes: HashMap<String, RouteQuota>,
    default_quota: RouteQuota,
    windows: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl KeyedRateLimiter {
    /// Build with the gateway's required route floors.
    #[must_use]
    pub fn with_gateway_defaults() -> Self {
        let mut routes = HashMap::new();
        routes.insert("evaluate".to_string(), RouteQuota::per_minute(120));
        routes.insert("execute".to_string(), RouteQuota::per_minute(60));
        routes.insert("login".to_string(), RouteQuota::per_minute(10));
        Self::new(routes, RouteQuota::per_minute(200))
    }

    /// Build with explicit quotas.
    #[must_use]
    pub fn new(routes: HashMap<String, RouteQuota>, default_quota: RouteQuota) -> Self {
        Self {
            routes,
            default_quota,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn quota(&self, route: &str) -> RouteQuota {
        self.routes.get(route).copied().unwrap_or(self.default_quota)
    }

    /// Admit or reject one request for `(route, key)`.
    ///
    /// # Errors
    ///
    /// [`RateLimited`] when the window is full.
    pub async fn check(&self, route: &str, key: &str) -> Result<(), RateLimited> {
        self.check_at(route, key, Instant::now()).await
    }

    /// [`Self::check`] with an explicit clock, for tests.
    ///
    /// # Errors
    ///
    /// [`RateLimited`] when the window is full.
    pub async fn check_at(&self, route: &str, key: &str, now: Instant) -> Result<(), RateLimited> {
        let quota = self.quota(route);
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry((route.to_string(), key.to_string()))
            .or_default();

        while let Some(&front) = window.front() {
            if now.duration_since(front) >= quota.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() as u32 >= quota.max_requests {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = quota
                .window
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(RateLimited {
                retry_after_secs: retry_after,
            });
        }

        window.push_back(now);
        Ok(())
    }
}
