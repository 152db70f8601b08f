//! Rate Limiter
//!
//! Per-identity budgets plus a global ceiling. The identity map is locked
//! only to look up or insert an `Arc<TokenBucket>`; the buckets themselves
//! are mutated through atomics, so unrelated identities do not contend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use super::bucket::TokenBucket;
use crate::auth::Identity;
use crate::config::RateLimitSettings;
use crate::error::GatewayError;

/// Rate limiter over all identities.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,

    /// Lazily created per-identity buckets
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,

    /// Global ceiling independent of per-identity budgets
    global: TokenBucket,
}

impl RateLimiter {
    /// Create a limiter from configured thresholds.
    pub fn new(settings: RateLimitSettings) -> Self {
        let global = TokenBucket::per_minute(settings.global.burst, settings.global.per_minute);
        Self {
            settings,
            buckets: RwLock::new(HashMap::new()),
            global,
        }
    }

    /// Create a limiter that allows everything (for tests).
    pub fn disabled() -> Self {
        let settings = RateLimitSettings {
            enabled: false,
            ..Default::default()
        };
        Self::new(settings)
    }

    /// Check whether one request from `identity` is within budget.
    ///
    /// Consumes one token from the identity bucket and one from the global
    /// bucket. If the global ceiling denies the request, the identity token
    /// is refunded so the caller is not double-charged.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` with a retry-after hint when either budget is
    /// exhausted.
    pub fn allow(&self, identity: &Identity) -> Result<(), GatewayError> {
        if !self.settings.enabled {
            return Ok(());
        }

        let bucket = self.bucket_for(identity);

        if !bucket.try_consume(1) {
            let retry = retry_after_secs(bucket.time_until_available(1));
            debug!(identity = %identity.id, retry_after_secs = retry, "identity rate limit hit");
            return Err(GatewayError::RateLimited {
                retry_after_secs: retry,
            });
        }

        if !self.global.try_consume(1) {
            bucket.refund(1);
            let retry = retry_after_secs(self.global.time_until_available(1));
            debug!(identity = %identity.id, retry_after_secs = retry, "global rate limit hit");
            return Err(GatewayError::RateLimited {
                retry_after_secs: retry,
            });
        }

        Ok(())
    }

    /// Fetch or lazily create the bucket for an identity.
    fn bucket_for(&self, identity: &Identity) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().unwrap().get(&identity.id) {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write().unwrap();
        // Another task may have inserted while we upgraded the lock.
        if let Some(bucket) = buckets.get(&identity.id) {
            return bucket.clone();
        }

        let sizing = self.settings.for_tier(identity.tier);
        let bucket = Arc::new(TokenBucket::per_minute(sizing.burst, sizing.per_minute));
        buckets.insert(identity.id.clone(), bucket.clone());
        bucket
    }

    /// Reclaim buckets idle longer than the configured TTL. Returns the
    /// number removed. Intended to be called periodically.
    pub fn reclaim_idle(&self) -> usize {
        let ttl = Duration::from_secs(self.settings.idle_ttl_secs);
        let mut buckets = self.buckets.write().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for() < ttl);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, "reclaimed idle rate buckets");
        }
        removed
    }

    /// Number of live per-identity buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().unwrap().len()
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs_f64().ceil().max(1.0) as u64
}
