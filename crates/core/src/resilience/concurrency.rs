//! Conversation admission control.
//!
//! Active conversations are members of one store sorted set scored by their
//! last activity. Admission is optimistic: check the count, add, re-count and
//! back out if the add overshot. Two racing registrants can both lose; they
//! can never both win past the limit.
//!
//! When the store is unreachable admission falls back to a process-local
//! derived count and refuses once that count says the process is full.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::{CapacityExceededError, CapacityReason};
use crate::store::{millis_score, SharedStore, StoreError};

const ACTIVE_KEY: &str = "conversations:active";
const SLOT_KEY_PREFIX: &str = "conversation:";
const QUEUE_SEQUENCE_KEY: &str = "conversations:queue:seq";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    RejectNew,
    DropOldest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Drain order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    fn queue_key(self) -> String {
        format!("conversations:queue:{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
    pub backpressure_ratio: f64,
    pub conversation_ttl_secs: u64,
    pub max_queue_size: usize,
    pub queue_entry_ttl_secs: u64,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            backpressure_ratio: 0.8,
            conversation_ttl_secs: 300,
            max_queue_size: 50,
            queue_entry_ttl_secs: 120,
            overflow_policy: OverflowPolicy::RejectNew,
        }
    }
}

impl ConcurrencyConfig {
    pub fn backpressure_threshold(&self) -> usize {
        (self.max_concurrent as f64 * self.backpressure_ratio).ceil() as usize
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub enqueued_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConcurrencyStats {
    pub active_conversations: usize,
    pub max_concurrent: usize,
    pub utilization_percent: f64,
    pub backpressure_threshold: usize,
    pub under_backpressure: bool,
    pub accepting_new: bool,
    pub queue_length: usize,
    pub max_queue_size: usize,
    pub store_reachable: bool,
}

pub struct ConcurrencyManager {
    config: ConcurrencyConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    local_active: AtomicUsize,
}

impl ConcurrencyManager {
    pub fn new(
        config: ConcurrencyConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, clock, local_active: AtomicUsize::new(0) }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.config.conversation_ttl_secs)
    }

    pub async fn register_conversation(&self, user_id: &str) -> bool {
        match self.try_register(user_id).await {
            Ok(admitted) => admitted,
            Err(error) => {
                let admitted = self.admit_locally();
                warn!(
                    event_name = "resilience.concurrency.store_error",
                    user_id,
                    admitted,
                    error = %error,
                    "conversation store unavailable; using local count"
                );
                admitted
            }
        }
    }

    pub async fn unregister_conversation(&self, user_id: &str) {
        let removed = async {
            let removed = self.store.zrem(ACTIVE_KEY, user_id).await?;
            self.store.delete(&slot_key(user_id)).await?;
            Ok::<bool, StoreError>(removed)
        }
        .await;

        match removed {
            Ok(false) => {}
            Ok(true) => self.release_locally(),
            Err(error) => {
                self.release_locally();
                warn!(
                    event_name = "resilience.concurrency.store_error",
                    user_id,
                    error = %error,
                    "could not release conversation slot"
                );
            }
        }
    }

    /// Refreshes last activity. Returns whether the identity held a slot.
    pub async fn touch_conversation(&self, user_id: &str) -> bool {
        let touched = async {
            if self.store.zscore(ACTIVE_KEY, user_id).await?.is_none() {
                return Ok(false);
            }
            self.store.zadd(ACTIVE_KEY, user_id, millis_score(self.clock.now_millis())).await?;
            self.store.expire(&slot_key(user_id), self.conversation_ttl()).await?;
            Ok::<bool, StoreError>(true)
        }
        .await;

        touched.unwrap_or_else(|error| {
            warn!(
                event_name = "resilience.concurrency.store_error",
                user_id,
                error = %error,
                "could not refresh conversation slot"
            );
            false
        })
    }

    pub async fn get_active_conversation_count(&self) -> usize {
        match self.active_count().await {
            Ok(count) => count,
            Err(error) => {
                warn!(
                    event_name = "resilience.concurrency.store_error",
                    error = %error,
                    "active count unavailable; using local count"
                );
                self.local_active.load(Ordering::SeqCst)
            }
        }
    }

    pub async fn is_under_backpressure(&self) -> bool {
        self.get_active_conversation_count().await >= self.config.backpressure_threshold()
    }

    pub async fn queue_request(
        &self,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid, CapacityExceededError> {
        let limit = self.config.max_queue_size as u64;
        let queue_full = |current: u64| CapacityExceededError {
            reason: CapacityReason::QueueFull,
            current,
            limit,
        };

        let length = match self.queue_length().await {
            Ok(length) => length as u64,
            Err(error) => {
                warn!(
                    event_name = "resilience.concurrency.store_error",
                    error = %error,
                    "queue unavailable; rejecting request"
                );
                return Err(queue_full(0));
            }
        };

        if length >= limit {
            match self.config.overflow_policy {
                OverflowPolicy::RejectNew => {
                    debug!(event_name = "resilience.concurrency.queue_full", length, "queue full");
                    return Err(queue_full(length));
                }
                OverflowPolicy::DropOldest => {
                    let dropped = self.drop_oldest().await.unwrap_or(false);
                    if !dropped {
                        return Err(queue_full(length));
                    }
                }
            }
        }

        let request = QueuedRequest {
            id: Uuid::new_v4(),
            payload,
            priority,
            enqueued_at_ms: self.clock.now_millis(),
        };
        let encoded = serde_json::to_string(&request).map_err(|_| queue_full(length))?;
        let enqueued = match self.store.incr(QUEUE_SEQUENCE_KEY).await {
            Ok(sequence) => {
                let member = queue_member(sequence, &encoded);
                self.store
                    .zadd(&priority.queue_key(), &member, millis_score(request.enqueued_at_ms))
                    .await
            }
            Err(error) => Err(error),
        };
        if let Err(error) = enqueued {
            warn!(
                event_name = "resilience.concurrency.store_error",
                error = %error,
                "could not enqueue request"
            );
            return Err(queue_full(length));
        }

        debug!(
            event_name = "resilience.concurrency.queued",
            request_id = %request.id,
            priority = priority.as_str(),
            "request queued"
        );
        Ok(request.id)
    }

    /// Pops as many queued requests as there are free slots, highest
    /// priority first and oldest first within a priority. Entries that
    /// waited longer than the queue TTL are discarded.
    pub async fn process_queued_requests(&self) -> Vec<QueuedRequest> {
        match self.drain_queue().await {
            Ok(drained) => drained,
            Err(error) => {
                warn!(
                    event_name = "resilience.concurrency.store_error",
                    error = %error,
                    "could not drain queue"
                );
                Vec::new()
            }
        }
    }

    pub async fn queue_length(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        for priority in Priority::ALL {
            total += self.store.zcard(&priority.queue_key()).await?;
        }
        Ok(total as usize)
    }

    pub async fn get_stats(&self) -> ConcurrencyStats {
        let (active, queue_length, store_reachable) =
            match (self.active_count().await, self.queue_length().await) {
                (Ok(active), Ok(queue)) => (active, queue, true),
                _ => (self.local_active.load(Ordering::SeqCst), 0, false),
            };

        let max = self.config.max_concurrent;
        let utilization_percent =
            if max == 0 { 100.0 } else { (active as f64 / max as f64 * 1000.0).round() / 10.0 };

        ConcurrencyStats {
            active_conversations: active,
            max_concurrent: max,
            utilization_percent,
            backpressure_threshold: self.config.backpressure_threshold(),
            under_backpressure: active >= self.config.backpressure_threshold(),
            accepting_new: active < max,
            queue_length,
            max_queue_size: self.config.max_queue_size,
            store_reachable,
        }
    }

    /// Evicts every slot. Returns how many were held.
    pub async fn force_cleanup(&self) -> Result<usize, StoreError> {
        let evicted = self.store.zcard(ACTIVE_KEY).await?;
        self.store.delete(ACTIVE_KEY).await?;
        for key in self.store.scan_prefix(SLOT_KEY_PREFIX).await? {
            self.store.delete(&key).await?;
        }
        self.local_active.store(0, Ordering::SeqCst);

        info!(
            event_name = "resilience.concurrency.force_cleanup",
            evicted,
            "all conversation slots evicted"
        );
        Ok(evicted as usize)
    }

    /// Evicts slots idle for longer than the conversation TTL.
    pub async fn sweep_stale(&self) -> Result<u64, StoreError> {
        let cutoff = self.clock.now_millis().saturating_sub(ttl_millis(self.conversation_ttl()));
        let evicted = self
            .store
            .zrem_range_by_score(ACTIVE_KEY, f64::NEG_INFINITY, millis_score(cutoff))
            .await?;
        if evicted > 0 {
            info!(
                event_name = "resilience.concurrency.stale_evicted",
                evicted,
                "idle conversations evicted"
            );
        }
        Ok(evicted)
    }

    async fn try_register(&self, user_id: &str) -> Result<bool, StoreError> {
        self.sweep_stale().await?;
        let now = self.clock.now_millis();

        if self.store.zscore(ACTIVE_KEY, user_id).await?.is_some() {
            self.store.zadd(ACTIVE_KEY, user_id, millis_score(now)).await?;
            self.store.expire(&slot_key(user_id), self.conversation_ttl()).await?;
            return Ok(true);
        }

        let max = self.config.max_concurrent as u64;
        let before = self.store.zcard(ACTIVE_KEY).await?;
        if before >= max {
            self.observe(before);
            debug!(
                event_name = "resilience.concurrency.rejected",
                user_id,
                active = before,
                max,
                "at conversation capacity"
            );
            return Ok(false);
        }

        self.store.zadd(ACTIVE_KEY, user_id, millis_score(now)).await?;
        let after = self.store.zcard(ACTIVE_KEY).await?;
        if after > max {
            self.store.zrem(ACTIVE_KEY, user_id).await?;
            self.observe(after.saturating_sub(1));
            debug!(
                event_name = "resilience.concurrency.rejected",
                user_id,
                active = after,
                max,
                "lost admission race"
            );
            return Ok(false);
        }

        self.store.set(&slot_key(user_id), &now.to_string(), Some(self.conversation_ttl())).await?;
        self.observe(after);
        Ok(true)
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        self.sweep_stale().await?;
        let count = self.store.zcard(ACTIVE_KEY).await?;
        self.observe(count);
        Ok(count as usize)
    }

    async fn drain_queue(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let active = self.active_count().await?;
        let mut free = self.config.max_concurrent.saturating_sub(active);
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(ttl_millis(Duration::from_secs(self.config.queue_entry_ttl_secs)));

        let mut drained = Vec::new();
        for priority in Priority::ALL {
            let key = priority.queue_key();
            let expired = self
                .store
                .zrem_range_by_score(&key, f64::NEG_INFINITY, millis_score(cutoff))
                .await?;
            if expired > 0 {
                info!(
                    event_name = "resilience.concurrency.queue_expired",
                    priority = priority.as_str(),
                    expired,
                    "stale queued requests dropped"
                );
            }

            while free > 0 {
                let popped = self.store.zpop_min(&key, free).await?;
                if popped.is_empty() {
                    break;
                }
                for (member, _) in popped {
                    match serde_json::from_str::<QueuedRequest>(queue_entry(&member)) {
                        Ok(request) => {
                            drained.push(request);
                            free -= 1;
                        }
                        Err(error) => warn!(
                            event_name = "resilience.concurrency.queue_corrupt",
                            error = %error,
                            "discarding undecodable queue entry"
                        ),
                    }
                }
            }
        }
        Ok(drained)
    }

    /// Lowest priority goes first; within it, the oldest entry.
    async fn drop_oldest(&self) -> Result<bool, StoreError> {
        for priority in Priority::ALL.into_iter().rev() {
            if !self.store.zpop_min(&priority.queue_key(), 1).await?.is_empty() {
                info!(
                    event_name = "resilience.concurrency.queue_dropped",
                    priority = priority.as_str(),
                    "queue full; oldest request dropped"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn observe(&self, count: u64) {
        self.local_active.store(count as usize, Ordering::SeqCst);
    }

    fn admit_locally(&self) -> bool {
        let current = self.local_active.fetch_add(1, Ordering::SeqCst);
        if current >= self.config.max_concurrent {
            self.local_active.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn release_locally(&self) {
        let _ = self
            .local_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
    }
}

/// Queue members sort by score first, then by member text. The zero-padded
/// sequence prefix keeps same-millisecond entries in arrival order.
fn queue_member(sequence: i64, encoded: &str) -> String {
    format!("{sequence:020}|{encoded}")
}

fn queue_entry(member: &str) -> &str {
    member.split_once('|').map_or(member, |(_, encoded)| encoded)
}

fn slot_key(user_id: &str) -> String {
    format!("{SLOT_KEY_PREFIX}{user_id}")
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::task::JoinSet;

    use super::{ConcurrencyConfig, ConcurrencyManager, OverflowPolicy, Priority};
    use crate::clock::ManualClock;
    use crate::errors::CapacityReason;
    use crate::store::{InMemoryStore, SharedStore};

    struct Harness {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            Self { store: Arc::new(InMemoryStore::new(clock.clone())), clock }
        }

        fn manager(&self, config: ConcurrencyConfig) -> ConcurrencyManager {
            ConcurrencyManager::new(config, self.store.clone(), self.clock.clone())
        }
    }

    fn sized(max_concurrent: usize, max_queue_size: usize) -> ConcurrencyConfig {
        ConcurrencyConfig { max_concurrent, max_queue_size, ..ConcurrencyConfig::default() }
    }

    #[tokio::test]
    async fn admits_up_to_max_then_one_more_after_release() {
        let harness = Harness::new();
        let manager = harness.manager(ConcurrencyConfig::default());

        for user in 1..=100 {
            assert!(manager.register_conversation(&format!("user-{user}")).await, "user {user}");
        }
        assert!(!manager.register_conversation("user-101").await);
        assert_eq!(manager.get_active_conversation_count().await, 100);

        manager.unregister_conversation("user-1").await;
        assert!(manager.register_conversation("user-102").await);
        assert!(!manager.register_conversation("user-103").await);
    }

    #[tokio::test]
    async fn re_registering_refreshes_without_consuming_capacity() {
        let harness = Harness::new();
        let manager = harness.manager(sized(2, 5));

        assert!(manager.register_conversation("a").await);
        assert!(manager.register_conversation("b").await);
        assert!(manager.register_conversation("a").await);
        assert_eq!(manager.get_active_conversation_count().await, 2);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let harness = Harness::new();
        let manager = harness.manager(sized(2, 5));

        manager.register_conversation("a").await;
        manager.unregister_conversation("a").await;
        manager.unregister_conversation("a").await;
        manager.unregister_conversation("never-registered").await;
        assert_eq!(manager.get_active_conversation_count().await, 0);
    }

    #[tokio::test]
    async fn backpressure_starts_at_ratio_threshold() {
        let harness = Harness::new();
        let manager = harness.manager(sized(10, 5));
        assert_eq!(manager.config().backpressure_threshold(), 8);

        for user in 0..7 {
            manager.register_conversation(&user.to_string()).await;
        }
        assert!(!manager.is_under_backpressure().await);

        manager.register_conversation("7").await;
        assert!(manager.is_under_backpressure().await);
    }

    #[tokio::test]
    async fn idle_conversations_are_swept() {
        let harness = Harness::new();
        let manager = harness.manager(sized(2, 5));

        manager.register_conversation("idle").await;
        manager.register_conversation("busy").await;
        harness.clock.advance_millis(200_000);
        assert!(manager.touch_conversation("busy").await);
        harness.clock.advance_millis(100_001);

        assert_eq!(manager.sweep_stale().await.expect("sweep"), 1);
        assert_eq!(manager.get_active_conversation_count().await, 1);
        assert!(!manager.touch_conversation("idle").await);
        assert!(manager.register_conversation("newcomer").await);
    }

    #[tokio::test]
    async fn full_queue_rejects_new_requests() {
        let harness = Harness::new();
        let manager = harness.manager(sized(1, 2));

        manager.queue_request(json!({"text": "one"}), Priority::Normal).await.expect("queued");
        manager.queue_request(json!({"text": "two"}), Priority::Low).await.expect("queued");
        let error = manager
            .queue_request(json!({"text": "three"}), Priority::High)
            .await
            .expect_err("queue full");
        assert_eq!(error.reason, CapacityReason::QueueFull);
        assert_eq!((error.current, error.limit), (2, 2));
    }

    #[tokio::test]
    async fn drop_oldest_sheds_lowest_priority_first() {
        let harness = Harness::new();
        let mut config = sized(0, 2);
        config.overflow_policy = OverflowPolicy::DropOldest;
        let manager = harness.manager(config);

        manager.queue_request(json!("low"), Priority::Low).await.expect("queued");
        harness.clock.advance_millis(1);
        manager.queue_request(json!("normal"), Priority::Normal).await.expect("queued");
        harness.clock.advance_millis(1);
        manager.queue_request(json!("high"), Priority::High).await.expect("queued");

        assert_eq!(manager.queue_length().await.expect("length"), 2);
        assert_eq!(harness.store.zcard("conversations:queue:low").await.expect("zcard"), 0);
    }

    #[tokio::test]
    async fn drains_by_priority_then_fifo_up_to_free_capacity() {
        let harness = Harness::new();
        let manager = harness.manager(sized(3, 10));
        manager.register_conversation("holder").await;

        for (text, priority) in [
            ("n1", Priority::Normal),
            ("l1", Priority::Low),
            ("n2", Priority::Normal),
            ("h1", Priority::High),
        ] {
            manager.queue_request(json!(text), priority).await.expect("queued");
            harness.clock.advance_millis(10);
        }

        let drained: Vec<serde_json::Value> = manager
            .process_queued_requests()
            .await
            .into_iter()
            .map(|request| request.payload)
            .collect();
        assert_eq!(drained, vec![json!("h1"), json!("n1")]);
        assert_eq!(manager.queue_length().await.expect("length"), 2);
    }

    #[tokio::test]
    async fn same_millisecond_entries_drain_in_arrival_order() {
        let harness = Harness::new();
        let manager = harness.manager(sized(10, 20));

        let texts = ["first", "second", "third", "fourth", "fifth", "sixth", "seventh", "eighth"];
        for text in texts {
            manager.queue_request(json!(text), Priority::Normal).await.expect("queued");
        }

        let drained: Vec<serde_json::Value> = manager
            .process_queued_requests()
            .await
            .into_iter()
            .map(|request| request.payload)
            .collect();
        let expected: Vec<serde_json::Value> = texts.iter().map(|text| json!(text)).collect();
        assert_eq!(drained, expected);
    }

    #[tokio::test]
    async fn stale_queue_entries_are_dropped_on_drain() {
        let harness = Harness::new();
        let manager = harness.manager(sized(5, 10));

        manager.queue_request(json!("old"), Priority::Normal).await.expect("queued");
        harness.clock.advance_millis(121_000);
        manager.queue_request(json!("fresh"), Priority::Normal).await.expect("queued");

        let drained = manager.process_queued_requests().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, json!("fresh"));
        assert_eq!(manager.queue_length().await.expect("length"), 0);
    }

    #[tokio::test]
    async fn force_cleanup_reports_evicted_slots() {
        let harness = Harness::new();
        let manager = harness.manager(sized(5, 5));
        for user in ["a", "b", "c"] {
            manager.register_conversation(user).await;
        }

        assert_eq!(manager.force_cleanup().await.expect("cleanup"), 3);
        assert_eq!(manager.get_active_conversation_count().await, 0);
        assert_eq!(harness.store.get("conversation:a").await.expect("get"), None);
    }

    #[tokio::test]
    async fn store_outage_admits_until_local_count_is_full() {
        let harness = Harness::new();
        let manager = harness.manager(sized(3, 5));
        manager.register_conversation("a").await;
        manager.register_conversation("b").await;

        harness.store.set_unavailable(true);
        assert!(manager.register_conversation("c").await);
        assert!(!manager.register_conversation("d").await);

        manager.unregister_conversation("a").await;
        assert!(manager.register_conversation("e").await);
        assert!(manager.queue_request(json!("x"), Priority::Normal).await.is_err());
        assert!(!manager.get_stats().await.store_reachable);
    }

    #[tokio::test]
    async fn stats_report_utilization_and_queue() {
        let harness = Harness::new();
        let manager = harness.manager(sized(4, 5));
        for user in ["a", "b", "c"] {
            manager.register_conversation(user).await;
        }
        manager.queue_request(json!("waiting"), Priority::Normal).await.expect("queued");

        let stats = manager.get_stats().await;
        assert_eq!(stats.active_conversations, 3);
        assert_eq!(stats.utilization_percent, 75.0);
        assert_eq!(stats.backpressure_threshold, 4);
        assert!(!stats.under_backpressure);
        assert!(stats.accepting_new);
        assert_eq!(stats.queue_length, 1);
        assert!(stats.store_reachable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_workers_never_exceed_capacity() {
        let harness = Harness::new();
        let workers = [
            Arc::new(harness.manager(sized(10, 5))),
            Arc::new(harness.manager(sized(10, 5))),
        ];

        let mut tasks = JoinSet::new();
        for user in 0..60 {
            let manager = workers[user % 2].clone();
            tasks.spawn(async move { manager.register_conversation(&format!("u{user}")).await });
        }

        let mut admitted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.expect("task") {
                admitted += 1;
            }
        }
        assert!(admitted <= 10);
        assert_eq!(workers[0].get_active_conversation_count().await, admitted);
    }
}
