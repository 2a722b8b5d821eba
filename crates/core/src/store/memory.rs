use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{SharedStore, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Clone, Debug)]
enum StoredValue {
    Text(String),
    Sorted(HashMap<String, f64>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: StoredValue,
    expires_at_ms: Option<i64>,
}

/// Single-process store. Good for tests and single-worker deployments; the
/// sqlite-backed store in `pricebot-db` is the one to use across processes.
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock, unavailable: AtomicBool::new(false) }
    }

    /// Makes every subsequent call fail with `StoreError::Unavailable` until
    /// switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_owned()));
        }
        Ok(())
    }

    fn expiry_from(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| self.clock.now_millis() + duration_millis(ttl))
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now_ms: i64,
) -> Option<&'a mut Entry> {
    let expired = entries
        .get(key)
        .and_then(|entry| entry.expires_at_ms)
        .is_some_and(|expires_at| expires_at <= now_ms);
    if expired {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

fn sorted_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now_ms: i64,
    operation: &'static str,
) -> Result<Option<&'a mut HashMap<String, f64>>, StoreError> {
    match live(entries, key, now_ms) {
        None => Ok(None),
        Some(Entry { value: StoredValue::Sorted(members), .. }) => Ok(Some(members)),
        Some(_) => Err(StoreError::WrongType { key: key.to_owned(), operation }),
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry { value: StoredValue::Text(text), .. }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongType { key: key.to_owned(), operation: "get" }),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at_ms = self.expiry_from(ttl);
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            Entry { value: StoredValue::Text(value.to_owned()), expires_at_ms },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let expires_at_ms = self.expiry_from(ttl);
        let mut entries = self.entries.lock().await;

        let current = match live(&mut entries, key, now) {
            None => None,
            Some(Entry { value: StoredValue::Text(text), .. }) => Some(text.clone()),
            Some(_) => {
                return Err(StoreError::WrongType {
                    key: key.to_owned(),
                    operation: "compare_and_set",
                })
            }
        };
        if current.as_deref() != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_owned(),
            Entry { value: StoredValue::Text(value.to_owned()), expires_at_ms },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;

        match live(&mut entries, key, now) {
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry { value: StoredValue::Text("1".to_owned()), expires_at_ms: None },
                );
                Ok(1)
            }
            Some(Entry { value: StoredValue::Text(text), .. }) => {
                let next = text
                    .parse::<i64>()
                    .map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })?
                    .saturating_add(1);
                *text = next.to_string();
                Ok(next)
            }
            Some(_) => Err(StoreError::WrongType { key: key.to_owned(), operation: "incr" }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let existed = live(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let expires_at_ms = now + duration_millis(ttl);
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live(&mut entries, key, now) {
            entry.expires_at_ms = Some(expires_at_ms);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        if let Some(members) = sorted_mut(&mut entries, key, now, "zadd")? {
            members.insert(member.to_owned(), score);
            return Ok(());
        }

        let members = HashMap::from([(member.to_owned(), score)]);
        entries
            .insert(
                key.to_owned(),
                Entry { value: StoredValue::Sorted(members), expires_at_ms: None },
            );
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Ok(sorted_mut(&mut entries, key, now, "zrem")?
            .is_some_and(|members| members.remove(member).is_some()))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Ok(sorted_mut(&mut entries, key, now, "zscore")?
            .and_then(|members| members.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Ok(sorted_mut(&mut entries, key, now, "zcard")?
            .map_or(0, |members| members.len() as u64))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Ok(sorted_mut(&mut entries, key, now, "zcount")?.map_or(0, |members| {
            members.values().filter(|score| **score >= min && **score <= max).count() as u64
        }))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let Some(members) = sorted_mut(&mut entries, key, now, "zrem_range_by_score")? else {
            return Ok(0);
        };
        let before = members.len();
        members.retain(|_, score| *score < min || *score > max);
        Ok((before - members.len()) as u64)
    }

    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let Some(members) = sorted_mut(&mut entries, key, now, "zpop_min")? else {
            return Ok(Vec::new());
        };

        let mut ordered: Vec<(String, f64)> =
            members.iter().map(|(member, score)| (member.clone(), *score)).collect();
        ordered.sort_by(|left, right| {
            left.1.total_cmp(&right.1).then_with(|| left.0.cmp(&right.0))
        });
        ordered.truncate(count);
        for (member, _) in &ordered {
            members.remove(member);
        }
        Ok(ordered)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at_ms.map_or(true, |expires_at| expires_at > now));
        let mut keys: Vec<String> =
            entries.keys().filter(|key| key.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
