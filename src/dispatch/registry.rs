use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde::Serialize;

use crate::dispatch::Provider;
use crate::dispatch::circuit::{CircuitBreaker, CircuitConfig, CircuitStatus};
use crate::dispatch::limiter::{ConcurrencyLimiter, DEFAULT_CONCURRENCY};
use crate::error::OrchestratorError;

/// Registration-time settings for one provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderOptions {
    /// Relative selection probability. Must be finite and > 0.
    pub weight: f64,
    pub concurrency: usize,
    /// Overrides the registry-wide circuit settings.
    pub circuit: Option<CircuitConfig>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            weight: 1.0,
            concurrency: DEFAULT_CONCURRENCY,
            circuit: None,
        }
    }
}

impl ProviderOptions {
    pub fn weight(weight: f64) -> Self {
        Self {
            weight,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = Some(circuit);
        self
    }
}

#[derive(Debug, Default)]
pub struct ProviderStats {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Everything the registry tracks for one provider.
pub struct ProviderSlot {
    pub provider: Arc<dyn Provider>,
    pub weight: f64,
    pub circuit: CircuitBreaker,
    pub limiter: ConcurrencyLimiter,
    pub stats: ProviderStats,
    healthy: AtomicBool,
}

impl ProviderSlot {
    pub fn id(&self) -> &str {
        self.provider.id()
    }

    /// Health as seen by selection: the registry flag and the adapter's own.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && self.provider.is_healthy()
    }

    fn is_eligible(&self, exclude: &HashSet<String>) -> bool {
        !exclude.contains(self.id()) && self.is_healthy() && !self.circuit.is_open()
    }
}

impl std::fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("id", &self.id())
            .field("weight", &self.weight)
            .field("healthy", &self.is_healthy())
            .field("circuit", &self.circuit)
            .field("limiter", &self.limiter)
            .finish()
    }
}

/// Point-in-time view of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub id: String,
    pub weight: f64,
    pub healthy: bool,
    pub circuit: CircuitStatus,
    pub consecutive_failures: u32,
    pub in_flight: usize,
    pub concurrency: usize,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

pub struct Registry {
    slots: RwLock<Vec<Arc<ProviderSlot>>>,
    circuit: CircuitConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl Registry {
    pub fn new(circuit: CircuitConfig) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            circuit,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<ProviderSlot>>> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<ProviderSlot>>> {
        self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().iter().any(|s| s.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProviderSlot>> {
        self.read().iter().find(|s| s.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.read().iter().map(|s| s.id().to_string()).collect()
    }

    /// Register a provider. Runs its `init` hook first; init failures are
    /// logged and the provider is still registered.
    pub async fn register(
        &self,
        provider: Arc<dyn Provider>,
        options: ProviderOptions,
    ) -> Result<(), OrchestratorError> {
        let id = provider.id().to_string();
        if !options.weight.is_finite() || options.weight <= 0.0 {
            return Err(OrchestratorError::InvalidProvider {
                id,
                reason: format!("weight must be a positive number, got {}", options.weight),
            });
        }
        if options.concurrency == 0 {
            return Err(OrchestratorError::InvalidProvider {
                id,
                reason: "concurrency limit must be at least 1".to_string(),
            });
        }
        if self.contains(&id) {
            return Err(OrchestratorError::DuplicateProvider(id));
        }

        if let Err(e) = provider.init().await {
            tracing::warn!(provider = %id, error = %e, "provider init failed");
        }

        let slot = Arc::new(ProviderSlot {
            weight: options.weight,
            circuit: CircuitBreaker::new(&id, options.circuit.unwrap_or(self.circuit)),
            limiter: ConcurrencyLimiter::new(&id, options.concurrency),
            stats: ProviderStats::default(),
            healthy: AtomicBool::new(true),
            provider,
        });

        // Re-check under the write lock: another register may have won the
        // race while init was running.
        let mut slots = self.write();
        if slots.iter().any(|s| s.id() == id) {
            return Err(OrchestratorError::DuplicateProvider(id));
        }
        let total: f64 = slots.iter().map(|s| s.weight).sum::<f64>() + options.weight;
        if !total.is_finite() {
            return Err(OrchestratorError::InvalidProvider {
                id,
                reason: "combined provider weight is not finite".to_string(),
            });
        }
        slots.push(slot);
        tracing::info!(
            provider = %id,
            weight = options.weight,
            concurrency = options.concurrency,
            "provider registered"
        );
        Ok(())
    }

    /// Remove a provider and all its state. The shutdown hook is best-effort.
    pub async fn deregister(&self, id: &str) -> Result<(), OrchestratorError> {
        let slot = {
            let mut slots = self.write();
            let idx = slots
                .iter()
                .position(|s| s.id() == id)
                .ok_or_else(|| OrchestratorError::ProviderNotFound(id.to_string()))?;
            slots.remove(idx)
        };
        slot.limiter.close();
        if let Err(e) = slot.provider.shutdown().await {
            tracing::warn!(provider = %id, error = %e, "provider shutdown failed");
        }
        tracing::info!(provider = %id, "provider deregistered");
        Ok(())
    }

    /// Weighted random choice among eligible providers. None means nothing
    /// is eligible, which is a terminal condition for the caller, not an error.
    pub fn select(&self, exclude: &HashSet<String>) -> Option<Arc<ProviderSlot>> {
        let candidates: Vec<Arc<ProviderSlot>> = self
            .read()
            .iter()
            .filter(|s| s.is_eligible(exclude))
            .cloned()
            .collect();

        match candidates.len() {
            0 => None,
            1 => candidates.into_iter().next(),
            _ => {
                let total: f64 = candidates.iter().map(|s| s.weight).sum();
                let mut rng = rand::thread_rng();
                if !total.is_finite() || total <= 0.0 {
                    let idx = rng.gen_range(0..candidates.len());
                    return candidates.into_iter().nth(idx);
                }
                pick_weighted(&candidates, rng.gen_range(0.0..1.0) * total)
            }
        }
    }

    /// Like `select`, but returns the hinted provider when it is eligible.
    pub fn select_preferred(
        &self,
        hint: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Option<Arc<ProviderSlot>> {
        if let Some(hint) = hint {
            match self.get(hint) {
                Some(slot) if slot.is_eligible(exclude) => return Some(slot),
                Some(_) => {
                    tracing::debug!(provider = %hint, "hinted provider not eligible")
                }
                None => tracing::debug!(provider = %hint, "hinted provider not registered"),
            }
        }
        self.select(exclude)
    }

    /// Set the registry health flag. This is how an unhealthy provider is
    /// brought back.
    pub fn set_healthy(&self, id: &str, healthy: bool) -> Result<(), OrchestratorError> {
        let slot = self
            .get(id)
            .ok_or_else(|| OrchestratorError::ProviderNotFound(id.to_string()))?;
        let was = slot.healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            tracing::info!(provider = %id, healthy, "provider health changed");
        }
        Ok(())
    }

    /// Run every provider's health probe and record the outcome.
    pub async fn probe_health(&self) -> Vec<(String, bool)> {
        let slots: Vec<Arc<ProviderSlot>> = self.read().clone();
        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            let report = slot.provider.health().await;
            let was = slot.healthy.swap(report.healthy, Ordering::AcqRel);
            if was != report.healthy {
                tracing::info!(
                    provider = %slot.id(),
                    healthy = report.healthy,
                    info = report.info.as_deref().unwrap_or(""),
                    "health probe changed provider health"
                );
            }
            results.push((slot.id().to_string(), report.healthy));
        }
        results
    }

    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.read()
            .iter()
            .map(|s| ProviderSnapshot {
                id: s.id().to_string(),
                weight: s.weight,
                healthy: s.is_healthy(),
                circuit: s.circuit.status(),
                consecutive_failures: s.circuit.state().failures,
                in_flight: s.limiter.in_flight(),
                concurrency: s.limiter.max(),
                successes: s.stats.successes.load(Ordering::Relaxed),
                failures: s.stats.failures.load(Ordering::Relaxed),
                timeouts: s.stats.timeouts.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Walk candidates subtracting weights until the remainder is non-positive.
/// Ties go to the first candidate whose cumulative weight covers the draw.
fn pick_weighted(candidates: &[Arc<ProviderSlot>], draw: f64) -> Option<Arc<ProviderSlot>> {
    let mut remaining = draw;
    for slot in candidates {
        remaining -= slot.weight;
        if remaining <= 0.0 {
            return Some(slot.clone());
        }
    }
    // Float rounding can leave a sliver past the last weight.
    candidates.last().cloned()
}
