use async_trait::async_trait;

use crate::dispatch::{CallContext, GenerateRequest, Provider, ProviderOutput};
use crate::error::OrchestratorError;

pub const DEFAULT_FALLBACK_ID: &str = "local";

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "AI assistance is temporarily unavailable. Your request was received and can be retried shortly.";

/// Longest prompt excerpt echoed back in a fallback reply, in chars.
const EXCERPT_CHARS: usize = 120;

/// Deterministic, always-available backend used once every external provider
/// has been exhausted. The same request always yields the same reply.
#[derive(Debug, Clone)]
pub struct LocalFallback {
    id: String,
    message: String,
}

impl Default for LocalFallback {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_ID, DEFAULT_FALLBACK_MESSAGE)
    }
}

impl LocalFallback {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn reply_for(&self, request: &GenerateRequest) -> String {
        let prompt = request.prompt.trim();
        let mut excerpt: String = prompt.chars().take(EXCERPT_CHARS).collect();
        if excerpt.len() < prompt.len() {
            excerpt.push_str("...");
        }
        format!("{}\n\nRequest: {excerpt}", self.message)
    }
}

#[async_trait]
impl Provider for LocalFallback {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        _ctx: CallContext,
    ) -> Result<ProviderOutput, OrchestratorError> {
        Ok(ProviderOutput {
            text: self.reply_for(request),
            model: Some("local-deterministic".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_is_deterministic() {
        let fallback = LocalFallback::default();
        let req = GenerateRequest::new("Plan a recovery session for a sprained ankle");
        assert_eq!(fallback.reply_for(&req), fallback.reply_for(&req));
        assert!(fallback.reply_for(&req).contains("sprained ankle"));
    }

    #[test]
    fn long_prompts_are_truncated() {
        let fallback = LocalFallback::default();
        let req = GenerateRequest::new("x".repeat(500));
        let reply = fallback.reply_for(&req);
        assert!(reply.ends_with("..."));
        assert!(reply.len() < DEFAULT_FALLBACK_MESSAGE.len() + 200);
    }
}
