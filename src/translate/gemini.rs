//! Gemini REST client.
//!
//! Non-streaming calls go through `generateContent`, streaming ones through
//! `streamGenerateContent?alt=sse` with the deltas surfaced to the caller
//! as they arrive.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::{Client, Url};
use serde::Deserialize;
use tokio_stream::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Other,
}

impl FinishReason {
    fn from_api(raw: &str) -> Self {
        match raw {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::Safety,
            "RECITATION" => FinishReason::Recitation,
            _ => FinishReason::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no api key configured")]
    MissingKey,
    #[error("model rate limited the request")]
    RateLimited,
    #[error("model service unavailable")]
    Unavailable,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected model response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Transport(err.to_string())
    }
}

/// Seam between the translation engine and the actual model service. Tests
/// script this; production uses [`GeminiClient`].
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Output token budget of the configured model.
    fn output_token_cap(&self) -> u64;

    async fn generate(&self, prompt: &str) -> Result<GenerationResult, LlmError>;

    /// Token-streamed generation. `on_delta` sees every raw text delta in
    /// arrival order; the returned result carries the full text.
    async fn generate_streaming(
        &self,
        prompt: &str,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<GenerationResult, LlmError>;
}

/// Conservative output caps by model family. The cap only changes with the
/// model id, so a static table beats burning a models.get round-trip on
/// every boot.
fn model_output_cap(model: &str) -> u64 {
    const CAPS: &[(&str, u64)] = &[
        ("gemini-2.5-pro", 65_536),
        ("gemini-2.5-flash", 65_536),
        ("gemini-2.0-flash", 8_192),
        ("gemini-1.5-pro", 8_192),
        ("gemini-1.5-flash", 8_192),
    ];
    CAPS.iter()
        .find(|(family, _)| model.starts_with(family))
        .map(|(_, cap)| *cap)
        .unwrap_or(8_192)
}

#[derive(Debug)]
pub struct GeminiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    output_cap: OnceLock<u64>,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

impl GeminiClient {
    pub fn new(http: Client, api_key: String, model: String) -> Self {
        Self {
            http,
            base_url: Url::parse("https://generativelanguage.googleapis.com/v1beta/").unwrap(),
            api_key,
            model,
            output_cap: OnceLock::new(),
        }
    }

    fn endpoint(&self, method: &str) -> Url {
        self.base_url
            .join(&format!("models/{}:{}", self.model, method))
            .unwrap()
    }

    fn body(prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": 0.2,
            }
        })
    }

    async fn send(&self, url: Url, prompt: &str) -> Result<reqwest::Response, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::MissingKey);
        }
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&Self::body(prompt))
            .send()
            .await?;
        match response.status().as_u16() {
            200..=299 => Ok(response),
            429 => Err(LlmError::RateLimited),
            502 | 503 | 504 => Err(LlmError::Unavailable),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(LlmError::InvalidResponse(format!("status {status}: {body}")))
            }
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for GeminiClient {
    fn output_token_cap(&self) -> u64 {
        *self.output_cap.get_or_init(|| {
            let cap = model_output_cap(&self.model);
            tracing::debug!(model = self.model, cap, "Resolved model output cap");
            cap
        })
    }

    async fn generate(&self, prompt: &str) -> Result<GenerationResult, LlmError> {
        let response = self.send(self.endpoint("generateContent"), prompt).await?;
        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        payload.into_result()
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<GenerationResult, LlmError> {
        let mut url = self.endpoint("streamGenerateContent");
        url.query_pairs_mut().append_pair("alt", "sse");
        let response = self.send(url, prompt).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut finish_reason = FinishReason::Other;
        while let Some(part) = stream.next().await {
            let part = part.map_err(|e| LlmError::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&part));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let payload: GenerateResponse = match serde_json::from_str(data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Skipping malformed stream chunk: {e}");
                        continue;
                    }
                };
                if let Some(candidate) = payload.candidates.into_iter().next() {
                    if let Some(reason) = candidate.finish_reason.as_deref() {
                        finish_reason = FinishReason::from_api(reason);
                    }
                    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                        if let Some(delta) = part.text {
                            text.push_str(&delta);
                            on_delta(&delta);
                        }
                    }
                }
            }
        }
        if finish_reason == FinishReason::Other && !text.is_empty() {
            finish_reason = FinishReason::Stop;
        }
        Ok(GenerationResult {
            text,
            finish_reason,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn into_result(self) -> Result<GenerationResult, LlmError> {
        if let Some(feedback) = &self.prompt_feedback {
            if feedback.block_reason.is_some() {
                return Ok(GenerationResult {
                    text: String::new(),
                    finish_reason: FinishReason::Safety,
                });
            }
        }
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no candidates".to_string()))?;
        let finish_reason = candidate
            .finish_reason
            .as_deref()
            .map(FinishReason::from_api)
            .unwrap_or(FinishReason::Stop);
        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(GenerationResult {
            text,
            finish_reason,
        })
    }
}
