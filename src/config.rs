use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::Provider;
use crate::dispatch::backoff::{self, BackoffPolicy};
use crate::dispatch::circuit::{self, CircuitConfig};
use crate::dispatch::http::HttpProvider;
use crate::dispatch::limiter::DEFAULT_CONCURRENCY;
use crate::dispatch::local::{DEFAULT_FALLBACK_ID, DEFAULT_FALLBACK_MESSAGE, LocalFallback};
use crate::dispatch::registry::ProviderOptions;
use crate::error::OrchestratorError;
use crate::policy::{DEFAULT_MAX_PROMPT_CHARS, DEFAULT_MAX_TOKENS};

/// Env var naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "CONDUCTOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "conductor.toml";

/// Per-attempt timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub backoff: BackoffConfig,
    pub circuit: CircuitSection,
    pub policy: PolicyConfig,
    pub failover: FailoverConfig,
    pub fallback: FallbackConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_attempts: u32,
    pub timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: backoff::DEFAULT_MAX_ATTEMPTS,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: backoff::DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: backoff::DEFAULT_MAX_DELAY.as_millis() as u64,
            jitter_ms: backoff::DEFAULT_JITTER.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub cool_down_ms: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: circuit::DEFAULT_FAILURE_THRESHOLD,
            cool_down_ms: circuit::DEFAULT_COOL_DOWN.as_millis() as u64,
        }
    }
}

impl CircuitSection {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(1),
            cool_down: Duration::from_millis(self.cool_down_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Case-insensitive terms that block a prompt outright.
    pub blocklist: Vec<String>,
    pub max_prompt_chars: usize,
    pub max_tokens: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            blocklist: Vec::new(),
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::failover::DEFAULT_FAILURE_THRESHOLD,
            cooldown_ms: crate::failover::DEFAULT_COOLDOWN.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub id: String,
    pub message: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            id: DEFAULT_FALLBACK_ID.to_string(),
            message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    /// Name of the env var holding the API key. Unset means no auth header
    /// (e.g. a local Ollama).
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub cool_down_ms: Option<u64>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl ProviderConfig {
    /// Registration options, layering per-provider circuit overrides on top
    /// of the global section.
    pub fn options(&self, global: &CircuitSection) -> ProviderOptions {
        let circuit = (self.failure_threshold.is_some() || self.cool_down_ms.is_some()).then(|| {
            CircuitSection {
                failure_threshold: self.failure_threshold.unwrap_or(global.failure_threshold),
                cool_down_ms: self.cool_down_ms.unwrap_or(global.cool_down_ms),
            }
            .to_circuit_config()
        });
        ProviderOptions {
            weight: self.weight,
            concurrency: self.concurrency,
            circuit,
        }
    }
}

impl Config {
    /// Load `.env`, then the TOML file named by `CONDUCTOR_CONFIG` (default
    /// `conductor.toml`). A missing file yields defaults; a malformed one is
    /// an error.
    pub fn load() -> Result<Self, OrchestratorError> {
        dotenvy::dotenv().ok();
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_path(path)
    }

    pub fn from_path(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, OrchestratorError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), OrchestratorError> {
        if self.orchestrator.max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "orchestrator.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.timeout_ms == 0 {
            return Err(OrchestratorError::Config(
                "orchestrator.timeout_ms must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if p.id.trim().is_empty() {
                return Err(OrchestratorError::Config("provider id must not be empty".to_string()));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(OrchestratorError::Config(format!("duplicate provider id: {}", p.id)));
            }
            if p.kind == ProviderKind::OpenaiCompatible && p.base_url.trim().is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "provider {} needs a base_url",
                    p.id
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.timeout_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.orchestrator.max_attempts,
            base_delay: Duration::from_millis(self.backoff.base_delay_ms),
            max_delay: Duration::from_millis(self.backoff.max_delay_ms),
            jitter: Duration::from_millis(self.backoff.jitter_ms),
        }
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        self.circuit.to_circuit_config()
    }

    pub fn fallback_provider(&self) -> Option<LocalFallback> {
        self.fallback
            .enabled
            .then(|| LocalFallback::new(&self.fallback.id, &self.fallback.message))
    }

    /// Build adapters for every configured provider. Providers whose
    /// `api_key_env` is unset in the environment are skipped with a warning.
    pub fn build_providers(
        &self,
    ) -> Result<Vec<(Arc<dyn Provider>, ProviderOptions)>, OrchestratorError> {
        let mut built: Vec<(Arc<dyn Provider>, ProviderOptions)> = Vec::new();

        for p in &self.providers {
            let api_key = match p.api_key_env.as_deref() {
                Some(var) => match env::var(var) {
                    Ok(key) if !key.trim().is_empty() => Some(key),
                    _ => {
                        tracing::warn!(provider = %p.id, env = var, "API key not set, provider unavailable");
                        continue;
                    }
                },
                None => None,
            };

            let provider: Arc<dyn Provider> = match p.kind {
                ProviderKind::OpenaiCompatible => Arc::new(HttpProvider::new(
                    &p.id,
                    &p.base_url,
                    &p.model,
                    api_key,
                )?),
                ProviderKind::Local => Arc::new(LocalFallback::new(&p.id, &self.fallback.message)),
            };
            built.push((provider, p.options(&self.circuit)));
        }

        if built.is_empty() {
            tracing::error!("no providers configured, only the local fallback can answer");
        }
        Ok(built)
    }
}
