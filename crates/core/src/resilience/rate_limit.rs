//! Sliding-window rate limiting over store sorted sets.
//!
//! Every accepted request becomes one uniquely named member scored by its
//! arrival time. A check prunes members older than the window and counts what
//! is left, so the window slides with the clock instead of resetting on fixed
//! boundaries.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::{RateLimitExceededError, RateLimitScope};
use crate::store::{millis_score, SharedStore, StoreError};

const GLOBAL_KEY: &str = "ratelimit:global";
const USER_KEY_PREFIX: &str = "ratelimit:user:";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub global_limit: u64,
    pub global_window_secs: u64,
    pub user_limit: u64,
    pub user_window_secs: u64,
    pub top_n: usize,
    /// Identities that skip limiting entirely (operators, health probes).
    pub bypass_user_ids: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_limit: 600,
            global_window_secs: 60,
            user_limit: 20,
            user_window_secs: 60,
            top_n: 10,
            bypass_user_ids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current_count: u64,
    pub limit: u64,
    pub remaining: Option<u64>,
    #[serde(with = "duration_secs")]
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn evaluate(current_count: u64, limit: u64, window: Duration) -> Self {
        if current_count < limit {
            Self {
                allowed: true,
                current_count,
                limit,
                remaining: Some(limit - current_count),
                retry_after: None,
            }
        } else {
            Self {
                allowed: false,
                current_count,
                limit,
                remaining: None,
                retry_after: Some(window),
            }
        }
    }

    fn unrestricted(limit: u64) -> Self {
        Self { allowed: true, current_count: 0, limit, remaining: Some(limit), retry_after: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserUsage {
    pub user_id: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub global_count: u64,
    pub global_limit: u64,
    pub global_window_secs: u64,
    pub user_limit: u64,
    pub user_window_secs: u64,
    pub top_users: Vec<UserUsage>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, clock }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_bypassed(&self, user_id: &str) -> bool {
        self.config.bypass_user_ids.iter().any(|bypassed| bypassed == user_id)
    }

    fn global_window(&self) -> Duration {
        Duration::from_secs(self.config.global_window_secs)
    }

    fn user_window(&self) -> Duration {
        Duration::from_secs(self.config.user_window_secs)
    }

    pub async fn check_global_rate_limit(&self) -> RateLimitDecision {
        self.check_window(GLOBAL_KEY, self.config.global_limit, self.global_window()).await
    }

    pub async fn check_user_rate_limit(&self, user_id: &str) -> RateLimitDecision {
        if self.is_bypassed(user_id) {
            return RateLimitDecision::unrestricted(self.config.user_limit);
        }
        let key = user_key(user_id);
        self.check_window(&key, self.config.user_limit, self.user_window()).await
    }

    /// Appends one entry to the global window and to the user's window.
    pub async fn record_request(&self, user_id: &str) {
        let now = self.clock.now_millis();
        let member = format!("{now}-{}", Uuid::new_v4());

        let global = self.append(GLOBAL_KEY, &member, now, self.global_window()).await;
        let user = self.append(&user_key(user_id), &member, now, self.user_window()).await;

        for result in [global, user] {
            if let Err(error) = result {
                warn!(
                    event_name = "resilience.rate_limit.record_failed",
                    user_id,
                    error = %error,
                    "could not record request in rate window"
                );
            }
        }
    }

    /// Bypass, then the global window, then the user's window, then record.
    /// A rejection records nothing.
    pub async fn enforce(
        &self,
        user_id: &str,
    ) -> Result<RateLimitDecision, RateLimitExceededError> {
        if self.is_bypassed(user_id) {
            return Ok(RateLimitDecision::unrestricted(self.config.user_limit));
        }

        let global = self.check_global_rate_limit().await;
        if !global.allowed {
            return Err(self.rejection(RateLimitScope::Global, &global, user_id));
        }

        let user = self.check_user_rate_limit(user_id).await;
        if !user.allowed {
            return Err(self.rejection(RateLimitScope::User(user_id.to_owned()), &user, user_id));
        }

        self.record_request(user_id).await;
        Ok(user)
    }

    pub async fn get_rate_limit_stats(&self) -> Result<RateLimitStats, StoreError> {
        let now = self.clock.now_millis();
        let global_floor = window_floor(now, self.global_window());
        let global_count = self.store.zcount(GLOBAL_KEY, global_floor, millis_score(now)).await?;

        let user_floor = window_floor(now, self.user_window());
        let mut top_users = Vec::new();
        for key in self.store.scan_prefix(USER_KEY_PREFIX).await? {
            let count = self.store.zcount(&key, user_floor, millis_score(now)).await?;
            if count == 0 {
                continue;
            }
            let user_id = key.trim_start_matches(USER_KEY_PREFIX).to_owned();
            top_users.push(UserUsage { user_id, count });
        }
        top_users.sort_by(|left, right| {
            right.count.cmp(&left.count).then_with(|| left.user_id.cmp(&right.user_id))
        });
        top_users.truncate(self.config.top_n);

        Ok(RateLimitStats {
            global_count,
            global_limit: self.config.global_limit,
            global_window_secs: self.config.global_window_secs,
            user_limit: self.config.user_limit,
            user_window_secs: self.config.user_window_secs,
            top_users,
        })
    }

    async fn check_window(&self, key: &str, limit: u64, window: Duration) -> RateLimitDecision {
        match self.count_window(key, window).await {
            Ok(count) => RateLimitDecision::evaluate(count, limit, window),
            Err(error) => {
                warn!(
                    event_name = "resilience.rate_limit.store_error",
                    key,
                    error = %error,
                    "rate window unreadable; allowing request"
                );
                RateLimitDecision::unrestricted(limit)
            }
        }
    }

    async fn count_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let expired_before = now.saturating_sub(window_millis(window));
        self.store.zrem_range_by_score(key, f64::NEG_INFINITY, millis_score(expired_before)).await?;
        self.store.zcard(key).await
    }

    async fn append(
        &self,
        key: &str,
        member: &str,
        now: i64,
        window: Duration,
    ) -> Result<(), StoreError> {
        self.store.zadd(key, member, millis_score(now)).await?;
        self.store.expire(key, window * 2).await
    }

    fn rejection(
        &self,
        scope: RateLimitScope,
        decision: &RateLimitDecision,
        user_id: &str,
    ) -> RateLimitExceededError {
        debug!(
            event_name = "resilience.rate_limit.rejected",
            scope = %scope,
            user_id,
            current = decision.current_count,
            limit = decision.limit,
            "request over rate limit"
        );
        RateLimitExceededError {
            scope,
            limit: decision.limit,
            retry_after: decision.retry_after.unwrap_or_default(),
        }
    }
}

fn user_key(user_id: &str) -> String {
    format!("{USER_KEY_PREFIX}{user_id}")
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

/// Lowest score still inside the window ending at `now`.
fn window_floor(now: i64, window: Duration) -> f64 {
    millis_score(now.saturating_sub(window_millis(window)).saturating_add(1))
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }
}
