//! Request admission policy.
//!
//! Quota tiers are derived from authentication state only: callers that
//! presented a recognized, enabled account get the wider tier, everyone else
//! the stricter one. The limiter itself is a windowed in-process counter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaTier {
    pub max_requests: u32,
    pub window_ms: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    pub authenticated: QuotaTier,
    pub anonymous: QuotaTier,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            authenticated: QuotaTier {
                max_requests: 60,
                window_ms: 10 * 60 * 1000,
            },
            anonymous: QuotaTier {
                max_requests: 30,
                window_ms: 10 * 60 * 1000,
            },
        }
    }
}

impl AdmissionPolicy {
    pub fn tier_for(&self, authenticated: bool) -> QuotaTier {
        if authenticated {
            self.authenticated
        } else {
            self.anonymous
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("request quota exceeded: {max_requests} per window")]
pub struct QuotaExceeded {
    pub max_requests: u32,
}

#[derive(Debug, Default)]
pub struct RequestLimiter {
    usage: HashMap<String, WindowUsage>,
    next_gc_ms: i64,
}

#[derive(Clone, Debug)]
struct WindowUsage {
    window: i64,
    window_ms: i64,
    requests: u32,
}

impl WindowUsage {
    fn is_live(&self, now_ms: i64) -> bool {
        self.window_ms > 0 && now_ms / self.window_ms == self.window
    }
}

impl RequestLimiter {
    /// Count one request against `scope`, denying it once the tier's window
    /// budget is spent.
    pub fn check_and_consume(
        &mut self,
        scope: &str,
        tier: QuotaTier,
        now_ms: i64,
    ) -> Result<(), QuotaExceeded> {
        let window = if tier.window_ms > 0 {
            now_ms / tier.window_ms
        } else {
            0
        };

        // Each bucket carries its own window length, so tiers with different
        // windows never invalidate each other's buckets.
        if now_ms >= self.next_gc_ms {
            self.usage.retain(|_, usage| usage.is_live(now_ms));
            self.next_gc_ms = now_ms.saturating_add(tier.window_ms.max(1));
        }

        let usage = self.usage.entry(scope.to_string()).or_insert(WindowUsage {
            window,
            window_ms: tier.window_ms,
            requests: 0,
        });

        if usage.window != window || usage.window_ms != tier.window_ms {
            usage.window = window;
            usage.window_ms = tier.window_ms;
            usage.requests = 0;
        }

        let next = usage.requests.saturating_add(1);
        if tier.max_requests == 0 || next > tier.max_requests {
            return Err(QuotaExceeded {
                max_requests: tier.max_requests,
            });
        }

        usage.requests = next;
        Ok(())
    }
}
