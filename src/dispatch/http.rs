use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::{CallContext, GenerateRequest, HealthReport, Provider, ProviderOutput};
use crate::error::OrchestratorError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Adapter for OpenAI-compatible chat completion endpoints. OpenRouter,
/// Ollama (`/v1`), the HuggingFace router and Gemini's compatibility endpoint
/// all speak this format.
pub struct HttpProvider {
    id: String,
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl HttpProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            id: id.into(),
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
        })
    }

    fn request_body(&self, req: &GenerateRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = req.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": req.prompt}));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }

    async fn send(
        &self,
        req: &GenerateRequest,
        timeout: Duration,
    ) -> Result<ProviderOutput, OrchestratorError> {
        let mut builder = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&self.request_body(req));
        if let Some(ref key) = self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(OrchestratorError::RateLimited {
                provider: self.id.clone(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(OrchestratorError::AuthFailed {
                provider: self.id.clone(),
                message: format!("{status}"),
            });
        }

        if !status.is_success() {
            let (body, _) = read_capped(response, MAX_RESPONSE_BYTES)
                .await
                .unwrap_or_default();
            let text = String::from_utf8_lossy(&body);
            return Err(OrchestratorError::Upstream {
                provider: self.id.clone(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_RESPONSE_BYTES)
        {
            return Err(self.too_large());
        }

        let (bytes, overflowed) = read_capped(response, MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| OrchestratorError::Upstream {
                provider: self.id.clone(),
                message: format!("failed to read response body: {e}"),
                status: None,
            })?;

        if overflowed {
            return Err(self.too_large());
        }

        parse_completion(&self.id, &bytes)
    }

    fn too_large(&self) -> OrchestratorError {
        OrchestratorError::Upstream {
            provider: self.id.clone(),
            message: format!("response too large (max {MAX_RESPONSE_BYTES} bytes)"),
            status: None,
        }
    }
}

/// Read at most `cap` bytes of the body, chunk by chunk. Stops as soon as the
/// cap is crossed and reports that with the returned flag.
async fn read_capped(
    mut response: reqwest::Response,
    cap: usize,
) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = cap - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body, true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, false))
}

/// Extract the first choice's content from a chat completion body.
pub fn parse_completion(provider: &str, body: &[u8]) -> Result<ProviderOutput, OrchestratorError> {
    let completion: ChatCompletion = serde_json::from_slice(body)
        .map_err(|e| OrchestratorError::SchemaParse(format!("failed to parse response: {e}")))?;

    let text = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| OrchestratorError::Declined {
            provider: provider.to_string(),
            message: "empty choices or null content".to_string(),
        })?;

    Ok(ProviderOutput {
        text,
        model: completion.model,
    })
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn init(&self) -> Result<(), OrchestratorError> {
        if self.base_url.trim().is_empty() {
            return Err(OrchestratorError::Config(format!(
                "{}: base_url is empty",
                self.id
            )));
        }
        Ok(())
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        ctx: CallContext,
    ) -> Result<ProviderOutput, OrchestratorError> {
        // Check for expired deadline before making the request
        let timeout = ctx
            .remaining()
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or(OrchestratorError::Timeout(0))?;

        tokio::select! {
            result = self.send(request, timeout) => result,
            _ = ctx.cancel.cancelled() => Err(OrchestratorError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn health(&self) -> HealthReport {
        HealthReport {
            healthy: !self.base_url.trim().is_empty(),
            info: Some(format!("model {} at {}", self.model, self.base_url)),
        }
    }
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
