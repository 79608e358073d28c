pub mod backoff;
pub mod circuit;
pub mod http;
pub mod limiter;
pub mod local;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;

/// A logical generate request. Immutable once handed to the orchestrator.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// System prompt to set model behavior (HTTP: separate message).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Sampling temperature (0 = deterministic, 2 = most random).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Provider id the caller would like tried first. Ignored when that
    /// provider is unknown, unhealthy, or circuit-open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_hint: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_hint(mut self, provider: impl Into<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self
    }
}

/// Per-attempt context handed to an adapter.
///
/// Cancellation is cooperative: the orchestrator cancels `cancel` and aborts
/// the attempt's task when the deadline passes, but an adapter whose transport
/// ignores both may keep its connection open until the I/O resolves.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Time left before the deadline, or None once it has passed.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

/// What an adapter returns on success.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderOutput {
    pub text: String,
    /// Upstream model name, when the adapter knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProviderOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }
}

/// Result of an active health probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// Contract every backend adapter satisfies. Adapters are opaque to the
/// orchestrator: a structured decline is `Err(Declined)`, anything else the
/// adapter reports as an error is treated the same way.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique id, used as the selection and log key.
    fn id(&self) -> &str;

    /// Adapter-reported health. `false` makes the provider ineligible.
    fn is_healthy(&self) -> bool {
        true
    }

    /// One-time setup (e.g. verifying credentials). Failures are logged by
    /// the registry and do not prevent registration.
    async fn init(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        ctx: CallContext,
    ) -> Result<ProviderOutput, OrchestratorError>;

    /// Active probe. Defaults to the passive flag.
    async fn health(&self) -> HealthReport {
        HealthReport {
            healthy: self.is_healthy(),
            info: None,
        }
    }

    async fn shutdown(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }
}
