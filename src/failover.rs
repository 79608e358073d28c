//! Policy-free redundancy layer.
//!
//! Shuffles its providers and tries each available one once. Keeps its own
//! health map, independent of any orchestrator registry, so the same adapters
//! can be registered with both.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{Config, DEFAULT_TIMEOUT};
use crate::dispatch::backoff::BackoffPolicy;
use crate::dispatch::{GenerateRequest, Provider};
use crate::error::OrchestratorError;
use crate::orchestrator::call_provider;
use crate::response::{FailureStage, Response};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailoverHealth {
    pub healthy: bool,
    pub failure_count: u32,
    #[serde(skip)]
    pub unhealthy_until: Option<Instant>,
}

impl FailoverHealth {
    fn fresh() -> Self {
        Self {
            healthy: true,
            failure_count: 0,
            unhealthy_until: None,
        }
    }
}

pub struct FailoverManager {
    providers: RwLock<Vec<Arc<dyn Provider>>>,
    health: Mutex<HashMap<String, FailoverHealth>>,
    failure_threshold: u32,
    cooldown: Duration,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl Default for FailoverManager {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl FailoverManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            health: Mutex::new(HashMap::new()),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            timeout,
            backoff: BackoffPolicy::immediate(u32::MAX),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.timeout())
            .with_failure_threshold(config.failover.failure_threshold)
            .with_cooldown(Duration::from_millis(config.failover.cooldown_ms))
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Delay between tries and a cap on how many providers one request may
    /// try. The default tries every provider with no delay.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn health_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, FailoverHealth>> {
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, provider: Arc<dyn Provider>) -> Result<(), OrchestratorError> {
        let id = provider.id().to_string();
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if providers.iter().any(|p| p.id() == id) {
            return Err(OrchestratorError::DuplicateProvider(id));
        }
        providers.push(provider);
        self.health_map().insert(id, FailoverHealth::fresh());
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = providers.len();
        providers.retain(|p| p.id() != id);
        self.health_map().remove(id);
        providers.len() != before
    }

    pub fn health(&self, id: &str) -> Option<FailoverHealth> {
        self.health_map().get(id).copied()
    }

    /// Available = adapter reports healthy and either our flag is healthy or
    /// the cooldown has elapsed (which resets the entry).
    fn is_available(&self, provider: &Arc<dyn Provider>, now: Instant) -> bool {
        if !provider.is_healthy() {
            return false;
        }
        let mut map = self.health_map();
        let entry = map
            .entry(provider.id().to_string())
            .or_insert_with(FailoverHealth::fresh);
        if entry.healthy {
            return true;
        }
        if entry.unhealthy_until.is_some_and(|until| now > until) {
            tracing::info!(provider = %provider.id(), "failover cooldown elapsed");
            *entry = FailoverHealth::fresh();
            return true;
        }
        false
    }

    fn mark_success(&self, id: &str) {
        if let Some(entry) = self.health_map().get_mut(id) {
            *entry = FailoverHealth::fresh();
        }
    }

    fn mark_failure(&self, id: &str) {
        let mut map = self.health_map();
        let entry = map.entry(id.to_string()).or_insert_with(FailoverHealth::fresh);
        entry.failure_count = entry.failure_count.saturating_add(1);
        if entry.healthy && entry.failure_count >= self.failure_threshold {
            entry.healthy = false;
            entry.unhealthy_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                provider = %id,
                failures = entry.failure_count,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "failover marked provider unhealthy"
            );
        }
    }

    pub async fn generate(&self, request: GenerateRequest) -> Response {
        let now = Instant::now();
        let mut candidates: Vec<Arc<dyn Provider>> = self
            .providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|p| self.is_available(p, now))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Response::Failure {
                stage: FailureStage::None,
                error: "no available provider".to_string(),
            };
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.backoff.max_attempts.max(1) as usize);

        let request = Arc::new(request);
        let total = candidates.len();
        let mut last_error = String::new();

        for (i, provider) in candidates.into_iter().enumerate() {
            let id = provider.id().to_string();
            let deadline = Instant::now() + self.timeout;
            match call_provider(provider, request.clone(), deadline).await {
                Ok((data, latency_ms)) => {
                    self.mark_success(&id);
                    return Response::Success {
                        provider_id: id,
                        data,
                        latency_ms,
                    };
                }
                Err(e) => {
                    tracing::warn!(provider = %id, reason = e.reason(), error = %e, "failover attempt failed");
                    self.mark_failure(&id);
                    last_error = e.user_message();
                }
            }

            let attempt = (i + 1) as u32;
            if i + 1 < total {
                let delay = self.backoff.delay_for(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Response::Failure {
            stage: FailureStage::All,
            error: format!("all {total} provider(s) failed: {last_error}"),
        }
    }
}
