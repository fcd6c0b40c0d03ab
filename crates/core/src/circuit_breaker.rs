use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, timeout: Duration::from_secs(60) }
    }
}

/// Failure-count gate for one resource.
///
/// Half-open admits a single probe; its outcome either closes the circuit or
/// re-opens it with a fresh cooldown. A probe whose outcome is never recorded
/// is given up on after another cooldown window, and a new one is admitted.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    probe_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            probe_started_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.last_failure_time
    }

    pub fn should_allow_request(&mut self) -> bool {
        self.should_allow_request_at(Utc::now())
    }

    pub fn should_allow_request_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.cooldown_elapsed(now) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started_at = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match self.probe_started_at {
                Some(started) if !self.window_elapsed(started, now) => false,
                _ => {
                    self.probe_started_at = Some(now);
                    true
                }
            },
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.probe_started_at = None;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
        self.probe_started_at = None;

        if self.state == CircuitState::HalfOpen
            || self.failure_count >= self.config.failure_threshold
        {
            self.state = CircuitState::Open;
        }
    }

    /// Time left in the cooldown window; zero unless the circuit is open.
    pub fn retry_after_at(&self, now: DateTime<Utc>) -> Duration {
        if self.state != CircuitState::Open {
            return Duration::ZERO;
        }
        let Some(last_failure) = self.last_failure_time else {
            return Duration::ZERO;
        };
        let elapsed = (now - last_failure).to_std().unwrap_or(Duration::ZERO);
        self.config.timeout.saturating_sub(elapsed)
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_failure_time {
            Some(last_failure) => self.window_elapsed(last_failure, now),
            None => true,
        }
    }

    fn window_elapsed(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - since).to_std() {
            Ok(elapsed) => elapsed >= self.config.timeout,
            Err(_) => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub resource: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub retry_after_secs: u64,
}

/// Circuit breakers keyed by resource name, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn should_allow_request(&self, resource: &str) -> bool {
        self.should_allow_request_at(resource, Utc::now())
    }

    pub fn should_allow_request_at(&self, resource: &str, now: DateTime<Utc>) -> bool {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(resource.to_owned())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let was = breaker.state();
        let allowed = breaker.should_allow_request_at(now);
        if was == CircuitState::Open && breaker.state() == CircuitState::HalfOpen {
            info!(
                event_name = "recovery.circuit.half_open",
                resource,
                "circuit cooldown elapsed, admitting probe"
            );
        }
        allowed
    }

    pub fn record_success(&self, resource: &str) {
        let mut breakers = self.lock();
        if let Some(breaker) = breakers.get_mut(resource) {
            if breaker.state() != CircuitState::Closed {
                info!(event_name = "recovery.circuit.closed", resource, "circuit closed");
            }
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, resource: &str) {
        self.record_failure_at(resource, Utc::now());
    }

    pub fn record_failure_at(&self, resource: &str, now: DateTime<Utc>) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(resource.to_owned())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let was = breaker.state();
        breaker.record_failure_at(now);
        if was != CircuitState::Open && breaker.state() == CircuitState::Open {
            warn!(
                event_name = "recovery.circuit.opened",
                resource,
                failure_count = breaker.failure_count(),
                cooldown_secs = self.config.timeout.as_secs(),
                "circuit opened"
            );
        }
    }

    pub fn state(&self, resource: &str) -> CircuitState {
        self.lock().get(resource).map(CircuitBreaker::state).unwrap_or(CircuitState::Closed)
    }

    pub fn retry_after(&self, resource: &str) -> Duration {
        self.retry_after_at(resource, Utc::now())
    }

    pub fn retry_after_at(&self, resource: &str, now: DateTime<Utc>) -> Duration {
        self.lock()
            .get(resource)
            .map(|breaker| breaker.retry_after_at(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Sorted by resource name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Utc::now();
        let breakers = self.lock();
        let mut snapshot: Vec<_> = breakers
            .iter()
            .map(|(resource, breaker)| CircuitSnapshot {
                resource: resource.clone(),
                state: breaker.state(),
                failure_count: breaker.failure_count(),
                last_failure_time: breaker.last_failure_time(),
                retry_after_secs: breaker.retry_after_at(now).as_secs(),
            })
            .collect();
        snapshot.sort_by(|left, right| left.resource.cmp(&right.resource));
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
