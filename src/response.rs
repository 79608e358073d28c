use serde::{Serialize, Serializer};

use crate::dispatch::ProviderOutput;

/// Which stage produced a failed response. Serialised into the `providerId`
/// field so callers and audit logs can tell rejections apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Rejected by the policy filter. No provider was called.
    Policy,
    /// No eligible provider existed, so nothing was attempted.
    None,
    /// Every attempt (and the fallback, if configured) failed.
    All,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::None => "none",
            Self::All => "all",
        }
    }
}

impl Serialize for FailureStage {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// The only thing that crosses the orchestrator's public boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success {
        provider_id: String,
        data: ProviderOutput,
        latency_ms: u64,
    },
    Failure {
        stage: FailureStage,
        error: String,
    },
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// `providerId` as the wire format reports it.
    pub fn provider_id(&self) -> &str {
        match self {
            Self::Success { provider_id, .. } => provider_id,
            Self::Failure { stage, .. } => stage.as_str(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { data, .. } => Some(&data.text),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    /// Serialize to the JSON shape callers consume. Falls back to a
    /// hand-built error object if serialization itself fails.
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                let escaped = e.to_string().replace('\\', "\\\\").replace('"', "\\\"");
                format!(
                    r#"{{"success":false,"providerId":"all","error":"serialization failed: {escaped}"}}"#
                )
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SuccessWire<'a> {
    success: bool,
    provider_id: &'a str,
    data: &'a ProviderOutput,
    latency_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FailureWire<'a> {
    success: bool,
    provider_id: FailureStage,
    error: &'a str,
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Success {
                provider_id,
                data,
                latency_ms,
            } => SuccessWire {
                success: true,
                provider_id,
                data,
                latency_ms: *latency_ms,
            }
            .serialize(s),
            Self::Failure { stage, error } => FailureWire {
                success: false,
                provider_id: *stage,
                error,
            }
            .serialize(s),
        }
    }
}
