//! Per-provider circuit breaker.
//!
//! Closed → Open once `failures >= failure_threshold`, with
//! `open_until = now + cool_down`. There is no timer: the circuit closes
//! lazily on the first check after `open_until` has passed. The failure count
//! is only reset by a success, so a provider that fails again right after its
//! cool-down re-opens immediately.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cool_down: DEFAULT_COOL_DOWN,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub failures: u32,
    pub last_failure_at: Option<Instant>,
    pub open_until: Option<Instant>,
}

/// Observable circuit status for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
}

pub struct CircuitBreaker {
    provider: String,
    config: CircuitConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current state.
    pub fn state(&self) -> CircuitState {
        *self.lock()
    }

    /// True while `open_until` is in the future. An expired window is cleared
    /// here, which is the Open → Closed transition.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        match state.open_until {
            Some(until) if now <= until => true,
            Some(_) => {
                state.open_until = None;
                tracing::info!(
                    provider = %self.provider,
                    failures = state.failures,
                    "circuit closed after cool-down"
                );
                false
            }
            None => false,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        if self.is_open() {
            CircuitStatus::Open
        } else {
            CircuitStatus::Closed
        }
    }

    /// Reset failures and close the circuit. No-op on an already clean circuit.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.failures == 0 && state.open_until.is_none() {
            return;
        }
        if state.open_until.is_some() {
            tracing::info!(provider = %self.provider, "circuit closed on success");
        }
        state.failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        state.last_failure_at = Some(now);

        if state.failures >= self.config.failure_threshold {
            let was_open = state.open_until.is_some_and(|until| now <= until);
            state.open_until = Some(now + self.config.cool_down);
            if !was_open {
                tracing::warn!(
                    provider = %self.provider,
                    failures = state.failures,
                    cool_down_ms = self.config.cool_down.as_millis() as u64,
                    "circuit opened"
                );
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
