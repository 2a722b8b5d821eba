//! Shared operational store.
//!
//! Every piece of cross-worker state (circuit records, rate windows,
//! conversation slots, the admission backlog) goes through this trait. Each
//! method is a single-key primitive and must be atomic on its own; callers
//! never rely on two calls happening together.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryStore;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("key `{key}` holds a value of the wrong type for `{operation}`")]
    WrongType { key: String, operation: &'static str },
    #[error("value at `{key}` is not an integer")]
    NotAnInteger { key: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Writes `value` only when the current value equals `expected`
    /// (`None` meaning "key absent"). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Members with `min <= score <= max`.
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    /// Removes and returns up to `count` members with the lowest scores,
    /// lowest first.
    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>, StoreError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub fn millis_score(millis: i64) -> f64 {
    millis as f64
}
