use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{Config, DEFAULT_TIMEOUT};
use crate::dispatch::backoff::BackoffPolicy;
use crate::dispatch::circuit::CircuitConfig;
use crate::dispatch::limiter::{ConcurrencyLimiter, DEFAULT_CONCURRENCY};
use crate::dispatch::registry::{ProviderOptions, ProviderSlot, Registry};
use crate::dispatch::{CallContext, GenerateRequest, Provider, ProviderOutput};
use crate::error::OrchestratorError;
use crate::policy::PolicyFilter;
use crate::response::{FailureStage, Response};

/// Per-call overrides for `Orchestrator::generate`.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
    /// Allow the local fallback when every provider is exhausted.
    pub use_fallback: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_attempts: None,
            timeout: None,
            use_fallback: true,
        }
    }
}

impl GenerateOptions {
    pub fn without_fallback() -> Self {
        Self {
            use_fallback: false,
            ..Default::default()
        }
    }
}

struct Fallback {
    provider: Arc<dyn Provider>,
    limiter: ConcurrencyLimiter,
}

/// Dispatches one logical request across the registered providers.
///
/// Each attempt goes to a provider not yet tried for this request, so a
/// failing backend is not hammered while others are available. Per-attempt
/// errors never escape: every path ends in a `Response`.
pub struct Orchestrator {
    registry: Arc<Registry>,
    policy: PolicyFilter,
    backoff: BackoffPolicy,
    timeout: Duration,
    fallback: Option<Fallback>,
}

#[derive(Default)]
pub struct OrchestratorBuilder {
    policy: Option<PolicyFilter>,
    backoff: Option<BackoffPolicy>,
    timeout: Option<Duration>,
    circuit: Option<CircuitConfig>,
    fallback: Option<Arc<dyn Provider>>,
}

impl OrchestratorBuilder {
    pub fn policy(mut self, policy: PolicyFilter) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = Some(circuit);
        self
    }

    pub fn fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            registry: Arc::new(Registry::new(self.circuit.unwrap_or_default())),
            policy: self.policy.unwrap_or_default(),
            backoff: self.backoff.unwrap_or_default(),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            fallback: self.fallback.map(|provider| Fallback {
                limiter: ConcurrencyLimiter::new(provider.id(), DEFAULT_CONCURRENCY),
                provider,
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Build from configuration and register every configured provider.
    pub async fn from_config(config: &Config) -> Result<Self, OrchestratorError> {
        let mut builder = Self::builder()
            .policy(PolicyFilter::standard(&config.policy))
            .backoff(config.backoff_policy())
            .timeout(config.timeout())
            .circuit(config.circuit_config());
        if let Some(fallback) = config.fallback_provider() {
            builder = builder.fallback(Arc::new(fallback));
        }
        let orchestrator = builder.build();

        for (provider, options) in config.build_providers()? {
            orchestrator.register(provider, options).await?;
        }
        Ok(orchestrator)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn fallback_id(&self) -> Option<&str> {
        self.fallback.as_ref().map(|f| f.provider.id())
    }

    pub async fn register(
        &self,
        provider: Arc<dyn Provider>,
        options: ProviderOptions,
    ) -> Result<(), OrchestratorError> {
        self.registry.register(provider, options).await
    }

    pub async fn deregister(&self, id: &str) -> Result<(), OrchestratorError> {
        self.registry.deregister(id).await
    }

    pub async fn generate(&self, request: GenerateRequest, options: GenerateOptions) -> Response {
        let verdict = self.policy.evaluate(&request);
        if !verdict.passed() {
            let err = OrchestratorError::PolicyViolation {
                reasons: verdict.violations,
            };
            tracing::warn!(error = %err, "request rejected by policy");
            return Response::Failure {
                stage: FailureStage::Policy,
                error: err.user_message(),
            };
        }

        let request = Arc::new(request);
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.backoff.max_attempts)
            .max(1);
        let timeout = options.timeout.unwrap_or(self.timeout);

        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0u32;
        let mut last_error: Option<OrchestratorError> = None;

        for attempt in 1..=max_attempts {
            let hint = if attempt == 1 {
                request.provider_hint.as_deref()
            } else {
                None
            };
            let Some(slot) = self.registry.select_preferred(hint, &tried) else {
                tracing::debug!(attempt, "no eligible provider left");
                break;
            };
            tried.insert(slot.id().to_string());
            attempts = attempt;
            tracing::debug!(provider = %slot.id(), attempt, "dispatching attempt");

            match attempt_on(&slot, &request, timeout).await {
                Ok((data, latency_ms)) => {
                    slot.circuit.record_success();
                    slot.stats.successes.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(provider = %slot.id(), attempt, latency_ms, "generate succeeded");
                    return Response::Success {
                        provider_id: slot.id().to_string(),
                        data,
                        latency_ms,
                    };
                }
                Err(e) if !e.counts_against_provider() => {
                    tracing::debug!(provider = %slot.id(), attempt, reason = e.reason(), "attempt skipped");
                    last_error = Some(e);
                }
                Err(e) => {
                    slot.circuit.record_failure();
                    slot.stats.failures.fetch_add(1, Ordering::Relaxed);
                    if matches!(e, OrchestratorError::Timeout(_)) {
                        slot.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::warn!(
                        provider = %slot.id(),
                        attempt,
                        reason = e.reason(),
                        error = %e,
                        "attempt failed"
                    );
                    last_error = Some(e);

                    if attempt < max_attempts {
                        let delay = self.backoff.delay_for(attempt);
                        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let stage = if attempts == 0 {
            FailureStage::None
        } else {
            FailureStage::All
        };
        let error = match last_error {
            Some(e) if attempts > 0 => OrchestratorError::Exhausted {
                attempts,
                last_error: e.user_message(),
            }
            .user_message(),
            _ => "no eligible provider".to_string(),
        };

        if options.use_fallback
            && let Some(fallback) = &self.fallback
        {
            return self.run_fallback(fallback, &request, timeout, stage, error).await;
        }

        tracing::warn!(stage = stage.as_str(), error = %error, "generate exhausted");
        Response::Failure { stage, error }
    }

    async fn run_fallback(
        &self,
        fallback: &Fallback,
        request: &Arc<GenerateRequest>,
        timeout: Duration,
        stage: FailureStage,
        exhausted: String,
    ) -> Response {
        let id = fallback.provider.id().to_string();
        tracing::info!(provider = %id, stage = stage.as_str(), "providers exhausted, using local fallback");

        let deadline = Instant::now() + timeout;
        let result = match fallback.limiter.acquire_until(deadline).await {
            Ok(mut permit) => {
                let result = call_provider(fallback.provider.clone(), request.clone(), deadline).await;
                permit.release();
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((data, latency_ms)) => Response::Success {
                provider_id: id,
                data,
                latency_ms,
            },
            Err(e) => {
                let err = OrchestratorError::FallbackFailure(format!("{exhausted}; {}", e.user_message()));
                tracing::error!(provider = %id, error = %err, "fallback failed");
                Response::Failure {
                    stage,
                    error: err.user_message(),
                }
            }
        }
    }

    /// Run every registered provider's health probe.
    pub async fn probe_health(&self) -> Vec<(String, bool)> {
        self.registry.probe_health().await
    }

    /// Deregister every provider and shut down the fallback.
    pub async fn shutdown(&self) {
        for id in self.registry.ids() {
            if let Err(e) = self.registry.deregister(&id).await {
                tracing::warn!(provider = %id, error = %e, "deregister during shutdown failed");
            }
        }
        if let Some(fallback) = &self.fallback {
            fallback.limiter.close();
            if let Err(e) = fallback.provider.shutdown().await {
                tracing::warn!(provider = %fallback.provider.id(), error = %e, "fallback shutdown failed");
            }
        }
    }
}

/// One attempt: take a limiter slot, re-check the circuit, call the adapter.
///
/// The queue wait counts against the same deadline as the call. A call that
/// times out after queueing did not get the full timeout, so it is reported
/// as `Saturated` rather than charged to the provider.
async fn attempt_on(
    slot: &Arc<ProviderSlot>,
    request: &Arc<GenerateRequest>,
    timeout: Duration,
) -> Result<(ProviderOutput, u64), OrchestratorError> {
    let deadline = Instant::now() + timeout;
    let (mut permit, queued) = match slot.limiter.try_acquire() {
        Some(permit) => (permit, false),
        None => (slot.limiter.acquire_until(deadline).await?, true),
    };

    if slot.circuit.is_open() {
        return Err(OrchestratorError::CircuitOpen {
            provider: slot.id().to_string(),
        });
    }

    let result = call_provider(slot.provider.clone(), request.clone(), deadline).await;
    permit.release();
    match result {
        Err(OrchestratorError::Timeout(_)) if queued => Err(OrchestratorError::Saturated {
            provider: slot.id().to_string(),
        }),
        other => other,
    }
}

/// Call an adapter in its own task, bounded by `deadline`.
///
/// On timeout the call's cancellation token is cancelled and the task is
/// aborted. Both are best-effort: an adapter blocked in I/O that ignores
/// cancellation may hold its connection until the I/O resolves, but its
/// result is discarded. A panicking adapter is reported as `Panicked`.
pub(crate) async fn call_provider(
    provider: Arc<dyn Provider>,
    request: Arc<GenerateRequest>,
    deadline: Instant,
) -> Result<(ProviderOutput, u64), OrchestratorError> {
    let start = Instant::now();
    let id = provider.id().to_string();
    let ctx = CallContext::new(deadline);
    let cancel = ctx.cancel.clone();

    let mut handle = tokio::spawn(async move { provider.generate(&request, ctx).await });

    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(result)) => result.map(|output| (output, start.elapsed().as_millis() as u64)),
        Ok(Err(join_err)) if join_err.is_panic() => Err(OrchestratorError::Panicked {
            provider: id,
            message: join_err.to_string(),
        }),
        Ok(Err(join_err)) => Err(OrchestratorError::Other(format!(
            "attempt on {id} was cancelled: {join_err}"
        ))),
        Err(_) => {
            cancel.cancel();
            handle.abort();
            Err(OrchestratorError::Timeout(start.elapsed().as_millis() as u64))
        }
    }
}
