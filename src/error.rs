use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("policy violation: {}", reasons.join("; "))]
    PolicyViolation { reasons: Vec<String> },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("{provider} declined the request: {message}")]
    Declined { provider: String, message: String },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider {provider} panicked: {message}")]
    Panicked { provider: String, message: String },

    #[error("circuit open for {provider}")]
    CircuitOpen { provider: String },

    #[error("all providers exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("fallback failed: {0}")]
    FallbackFailure(String),

    #[error("provider already registered: {0}")]
    DuplicateProvider(String),

    #[error("invalid provider {id}: {reason}")]
    InvalidProvider { id: String, reason: String },

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("concurrency limiter closed for {provider}")]
    LimiterClosed { provider: String },

    #[error("{provider} at capacity: no slot before the deadline")]
    Saturated { provider: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Declined { provider, .. } => Some(provider),
            Self::RateLimited { provider } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::Panicked { provider, .. } => Some(provider),
            Self::CircuitOpen { provider } => Some(provider),
            Self::LimiterClosed { provider } => Some(provider),
            Self::Saturated { provider } => Some(provider),
            Self::DuplicateProvider(id) => Some(id),
            Self::InvalidProvider { id, .. } => Some(id),
            Self::ProviderNotFound(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this attempt outcome is the provider's fault and should count
    /// against its circuit. Skips caused by local state (circuit opened while
    /// queued, deregistration, a saturated limiter) do not.
    pub fn counts_against_provider(&self) -> bool {
        !matches!(
            self,
            Self::CircuitOpen { .. } | Self::LimiterClosed { .. } | Self::Saturated { .. }
        )
    }

    /// Short machine-readable classification for logs and audit records.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PolicyViolation { .. } => "policy",
            Self::Timeout(_) => "timeout",
            Self::Declined { .. } => "declined",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream",
            Self::AuthFailed { .. } => "auth_failed",
            Self::SchemaParse(_) => "parse_error",
            Self::Request(_) => "request",
            Self::Panicked { .. } => "panic",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Exhausted { .. } => "exhausted",
            Self::FallbackFailure(_) => "fallback_failure",
            Self::LimiterClosed { .. } => "limiter_closed",
            Self::Saturated { .. } => "saturated",
            _ => "error",
        }
    }

    /// Produce a sanitized error message safe for returning to callers.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::PolicyViolation { reasons } => reasons.join("; "),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Declined { provider, message } => {
                format!("{provider} declined the request: {message}")
            }
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("upstream error from {provider} (status {code})"),
                None => format!("upstream error from {provider}"),
            },
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Panicked { provider, .. } => format!("provider {provider} crashed"),
            Self::CircuitOpen { provider } => {
                format!("{provider} is temporarily unavailable")
            }
            Self::Exhausted { attempts, last_error } => {
                format!("all providers failed after {attempts} attempt(s): {last_error}")
            }
            Self::FallbackFailure(msg) => format!("fallback failed: {msg}"),
            Self::DuplicateProvider(id) => format!("provider already registered: {id}"),
            Self::InvalidProvider { id, reason } => format!("invalid provider {id}: {reason}"),
            Self::ProviderNotFound(id) => format!("provider not found: {id}"),
            Self::LimiterClosed { provider } => format!("{provider} was deregistered"),
            Self::Saturated { provider } => {
                format!("{provider} is at capacity, try again shortly")
            }
            Self::Config(msg) => format!("config error: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }
}
