//! Per-dependency circuit breaker backed by the shared store.
//!
//! ```text
//! CLOSED --failure_threshold failures--> OPEN
//! OPEN   --cooldown elapsed, next read--> HALF_OPEN
//! HALF_OPEN --success_threshold successes--> CLOSED
//! HALF_OPEN --any failure--> OPEN
//! ```
//!
//! There is no timer. The OPEN -> HALF_OPEN move is evaluated from the stored
//! record and the clock every time the state is read, and written back with
//! `compare_and_set` so exactly one worker performs it.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::CircuitOpenError;
use crate::store::{SharedStore, StoreError};

pub const NLP_SERVICE: &str = "nlp_service";
pub const PRICING_API: &str = "pricing_api";
pub const CHAT_TRANSPORT: &str = "chat_transport";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl From<BreakerState> for HealthStatus {
    fn from(state: BreakerState) -> Self {
        match state {
            BreakerState::Closed => Self::Healthy,
            BreakerState::HalfOpen => Self::Degraded,
            BreakerState::Open => Self::Unhealthy,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
    /// Calls let through per HALF_OPEN episode.
    pub half_open_max_probes: u32,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cooldown_ms: u64, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            cooldown_ms,
            half_open_max_probes: success_threshold,
        }
    }

    /// Defaults by dependency. The AI service is slow and expensive to call,
    /// so it tolerates more failures and cools down longer than the internal
    /// pricing API.
    pub fn defaults_for(name: &str) -> Self {
        match name {
            NLP_SERVICE => Self::new(5, 60_000, 2),
            PRICING_API => Self::new(3, 30_000, 2),
            CHAT_TRANSPORT => Self::new(5, 15_000, 1),
            _ => Self::new(5, 30_000, 2),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error("{0}")]
    Inner(E),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u64,
    pub success_count: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub can_attempt: bool,
    pub health: HealthStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StateRecord {
    state: BreakerState,
    last_transition_ms: i64,
}

struct Snapshot {
    state: BreakerState,
    last_transition_ms: Option<i64>,
    raw: Option<String>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    state_ttl: Duration,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        state_ttl: Duration,
    ) -> Self {
        Self { name: name.into(), config, store, clock, state_ttl }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn record_key(&self) -> String {
        format!("circuit:{}", self.name)
    }

    fn counter_key(&self, counter: &str) -> String {
        format!("circuit:{}:{counter}", self.name)
    }

    pub async fn execute<F, Fut, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admitted = match self.get_state().await {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => self.reserve_probe().await,
        };

        if !admitted {
            debug!(
                event_name = "resilience.circuit.rejected",
                dependency = %self.name,
                "call rejected without attempting dependency"
            );
            return Err(BreakerError::Open(CircuitOpenError { dependency: self.name.clone() }));
        }

        match call().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(error) => {
                self.record_failure().await;
                Err(BreakerError::Inner(error))
            }
        }
    }

    /// Current state with the lazy OPEN -> HALF_OPEN check applied. Store
    /// failures read as CLOSED.
    pub async fn get_state(&self) -> BreakerState {
        match self.resolve().await {
            Ok(snapshot) => snapshot.state,
            Err(error) => {
                self.log_store_error("get_state", &error);
                BreakerState::Closed
            }
        }
    }

    pub async fn can_attempt(&self) -> bool {
        match self.get_state().await {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                match self.read_counter("probes").await {
                    Ok(probes) => probes < u64::from(self.config.half_open_max_probes),
                    Err(error) => {
                        self.log_store_error("can_attempt", &error);
                        true
                    }
                }
            }
        }
    }

    pub async fn record_success(&self) {
        if let Err(error) = self.try_record_success().await {
            self.log_store_error("record_success", &error);
        }
    }

    pub async fn record_failure(&self) {
        if let Err(error) = self.try_record_failure().await {
            self.log_store_error("record_failure", &error);
        }
    }

    pub async fn force_open(&self) -> Result<(), StoreError> {
        self.overwrite(BreakerState::Open).await?;
        warn!(
            event_name = "resilience.circuit.forced_open",
            dependency = %self.name,
            "circuit forced open by operator"
        );
        Ok(())
    }

    pub async fn reset(&self) -> Result<(), StoreError> {
        self.overwrite(BreakerState::Closed).await?;
        info!(event_name = "resilience.circuit.reset", dependency = %self.name, "circuit reset");
        Ok(())
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        self.get_state().await.into()
    }

    pub async fn get_stats(&self) -> CircuitStats {
        let (state, last_transition_ms) = match self.resolve().await {
            Ok(snapshot) => (snapshot.state, snapshot.last_transition_ms),
            Err(error) => {
                self.log_store_error("get_stats", &error);
                (BreakerState::Closed, None)
            }
        };

        CircuitStats {
            name: self.name.clone(),
            state,
            failure_count: self.read_counter("failures").await.unwrap_or(0),
            success_count: self.read_counter("successes").await.unwrap_or(0),
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            cooldown_ms: self.config.cooldown_ms,
            last_transition_at: last_transition_ms
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            can_attempt: self.can_attempt().await,
            health: state.into(),
        }
    }

    async fn try_record_success(&self) -> Result<(), StoreError> {
        let snapshot = self.resolve().await?;
        match snapshot.state {
            BreakerState::Closed => {
                self.store.set(&self.counter_key("failures"), "0", Some(self.state_ttl)).await
            }
            BreakerState::HalfOpen => {
                let successes = self.bump("successes").await?;
                if successes >= i64::from(self.config.success_threshold) {
                    self.transition(snapshot.raw.as_deref(), BreakerState::Closed).await?;
                }
                Ok(())
            }
            BreakerState::Open => Ok(()),
        }
    }

    async fn try_record_failure(&self) -> Result<(), StoreError> {
        let snapshot = self.resolve().await?;
        match snapshot.state {
            BreakerState::Closed => {
                let failures = self.bump("failures").await?;
                if failures >= i64::from(self.config.failure_threshold) {
                    self.transition(snapshot.raw.as_deref(), BreakerState::Open).await?;
                }
                Ok(())
            }
            BreakerState::HalfOpen => {
                self.transition(snapshot.raw.as_deref(), BreakerState::Open).await?;
                Ok(())
            }
            BreakerState::Open => Ok(()),
        }
    }

    async fn reserve_probe(&self) -> bool {
        match self.bump("probes").await {
            Ok(probes) => probes <= i64::from(self.config.half_open_max_probes),
            Err(error) => {
                self.log_store_error("reserve_probe", &error);
                true
            }
        }
    }

    async fn resolve(&self) -> Result<Snapshot, StoreError> {
        let snapshot = self.load().await?;
        if snapshot.state != BreakerState::Open {
            return Ok(snapshot);
        }

        let opened_at = snapshot.last_transition_ms.unwrap_or(0);
        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
        if elapsed < i64::try_from(self.config.cooldown_ms).unwrap_or(i64::MAX) {
            return Ok(snapshot);
        }

        if self.transition(snapshot.raw.as_deref(), BreakerState::HalfOpen).await? {
            return self.load().await;
        }
        // Another worker moved it first; report whatever it wrote.
        self.load().await
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        let raw = self.store.get(&self.record_key()).await?;
        let Some(raw) = raw else {
            return Ok(Snapshot {
                state: BreakerState::Closed,
                last_transition_ms: None,
                raw: None,
            });
        };

        let record: StateRecord = serde_json::from_str(&raw).map_err(|error| {
            StoreError::Backend(format!("corrupt circuit record for `{}`: {error}", self.name))
        })?;
        Ok(Snapshot {
            state: record.state,
            last_transition_ms: Some(record.last_transition_ms),
            raw: Some(raw),
        })
    }

    async fn transition(
        &self,
        expected: Option<&str>,
        to: BreakerState,
    ) -> Result<bool, StoreError> {
        let record = self.encode(to)?;
        let won = self
            .store
            .compare_and_set(&self.record_key(), expected, &record, Some(self.state_ttl))
            .await?;

        if !won {
            debug!(
                event_name = "resilience.circuit.transition_lost",
                dependency = %self.name,
                to = to.as_str(),
                "another worker changed the circuit first"
            );
            return Ok(false);
        }

        self.reset_counters().await?;
        info!(
            event_name = "resilience.circuit.transition",
            dependency = %self.name,
            to = to.as_str(),
            "circuit state changed"
        );
        Ok(true)
    }

    async fn overwrite(&self, to: BreakerState) -> Result<(), StoreError> {
        let record = self.encode(to)?;
        self.store.set(&self.record_key(), &record, Some(self.state_ttl)).await?;
        self.reset_counters().await
    }

    fn encode(&self, state: BreakerState) -> Result<String, StoreError> {
        serde_json::to_string(&StateRecord { state, last_transition_ms: self.clock.now_millis() })
            .map_err(|error| StoreError::Backend(error.to_string()))
    }

    async fn reset_counters(&self) -> Result<(), StoreError> {
        for counter in ["failures", "successes", "probes"] {
            self.store.set(&self.counter_key(counter), "0", Some(self.state_ttl)).await?;
        }
        Ok(())
    }

    async fn bump(&self, counter: &str) -> Result<i64, StoreError> {
        let key = self.counter_key(counter);
        let value = self.store.incr(&key).await?;
        self.store.expire(&key, self.state_ttl).await?;
        Ok(value)
    }

    async fn read_counter(&self, counter: &str) -> Result<u64, StoreError> {
        let key = self.counter_key(counter);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw.parse::<u64>().map_err(|_| StoreError::NotAnInteger { key }),
        }
    }

    fn log_store_error(&self, operation: &'static str, error: &StoreError) {
        warn!(
            event_name = "resilience.circuit.store_error",
            dependency = %self.name,
            operation,
            error = %error,
            "circuit store unavailable; failing open"
        );
    }
}

/// Hands out one breaker per dependency name, creating it on first use.
pub struct CircuitBreakerRegistry {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    state_ttl: Duration,
    overrides: BTreeMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        state_ttl: Duration,
        overrides: BTreeMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self { store, clock, state_ttl, overrides, breakers: RwLock::new(HashMap::new()) }
    }

    pub fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerConfig::defaults_for(name))
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).get(name)
        {
            return existing.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config_for(name),
                    self.store.clone(),
                    self.clock.clone(),
                    self.state_ttl,
                ))
            })
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn all_stats(&self) -> Vec<CircuitStats> {
        let mut stats = Vec::new();
        for name in self.names() {
            stats.push(self.breaker(&name).get_stats().await);
        }
        stats
    }

    /// Healthy only when every known breaker is healthy; unhealthy as soon as
    /// one is.
    pub async fn aggregate_health(&self) -> HealthStatus {
        let mut worst = HealthStatus::Healthy;
        for name in self.names() {
            worst = worst.max(self.breaker(&name).get_health_status().await);
        }
        worst
    }
}
