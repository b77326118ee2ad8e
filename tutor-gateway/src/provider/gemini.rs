//! Google Gemini provider.
//!
//! Blocking replies use `:generateContent`; streamed replies use
//! `:streamGenerateContent?alt=sse` and are read chunk by chunk.

use super::{ChatRequest, ChatResponse, FragmentStream, Provider, ProviderError, TokenUsage};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Public Gemini REST endpoint.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const PROVIDER: &str = "gemini";

/// Gemini REST client.
pub struct GeminiProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<i64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<i64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<i64>,
}

impl GenerateContentRequest {
    fn from_chat(request: &ChatRequest) -> Self {
        let contents = request
            .turns()
            .map(|turn| Content {
                role: turn.role.as_str(),
                parts: turn.parts.into_iter().map(|text| Part { text }).collect(),
            })
            .collect();

        let generation_config = (request.temperature.is_some() || request.max_tokens.is_some())
            .then(|| GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            });

        Self {
            contents,
            generation_config,
        }
    }
}

impl GenerateContentResponse {
    /// Text of the first candidate, all parts joined.
    fn text(&self) -> String {
        self.candidates
            .as_deref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// SSE DECODING
// ══════════════════════════════════════════════════════════════════════════════

/// Splits an SSE byte stream into event data payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk; returns the data of every event it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(data) = event_data(&event[..end]) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Data of a trailing event not followed by a blank line.
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        event_data(&rest)
    }
}

fn event_data(event: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(event);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();

    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Text carried by one streamed chunk; `Err` when the chunk reports an error.
fn chunk_text(payload: &str) -> Result<Option<String>, String> {
    let chunk: GenerateContentResponse =
        serde_json::from_str(payload).map_err(|e| format!("Failed to parse stream chunk: {e}"))?;

    if let Some(err) = &chunk.error {
        return Err(format!("API error: {}", err.message));
    }

    let text = chunk.text();
    Ok((!text.is_empty()).then_some(text))
}

impl GeminiProvider {
    /// Create a provider. Calls fail with a provider error while no key is set.
    pub fn new(api_key: Option<&str>, timeout_secs: u64) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()).map(String::from),
            base_url: GEMINI_API_BASE.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Point the client at another endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn api_key(&self, model: &str) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::new(
                PROVIDER,
                model,
                "Gemini API key not found. Set GOOGLE_API_KEY or GEMINI_API_KEY.",
            )
        })
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        let model_name = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        format!("{}/{model_name}:{method}", self.base_url)
    }

    async fn send(
        &self,
        request: &ChatRequest,
        url: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.api_key(&request.model)?;

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&GenerateContentRequest::from_chat(request))
            .send()
            .await
            .map_err(|e| ProviderError::new(PROVIDER, &request.model, format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                PROVIDER,
                &request.model,
                format!("API error ({}): {}", status.as_u16(), error_text),
            )
            .with_status(status.as_u16()));
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let url = self.endpoint(&request.model, "generateContent");
        let response = self.send(&request, &url).await?;

        let result: GenerateContentResponse = response.json().await.map_err(|e| {
            ProviderError::new(PROVIDER, &request.model, format!("Failed to parse response: {e}"))
        })?;

        if let Some(err) = result.error.as_ref() {
            return Err(ProviderError::new(
                PROVIDER,
                &request.model,
                format!("API error: {}", err.message),
            ));
        }

        let finish_reason = result
            .candidates
            .as_deref()
            .and_then(|c| c.first())
            .ok_or_else(|| ProviderError::new(PROVIDER, &request.model, "No response from Gemini"))?
            .finish_reason
            .clone();

        let content = result.text();

        let usage = result.usage_metadata.map_or(TokenUsage::default(), |u| TokenUsage {
            input_tokens: u.prompt_token_count.unwrap_or(0),
            output_tokens: u.candidates_token_count.unwrap_or(0),
            total_tokens: u.total_token_count.unwrap_or(0),
        });

        tracing::debug!(
            model = %request.model,
            output_tokens = usage.output_tokens,
            latency_ms = start.elapsed().as_millis() as u64,
            "Gemini reply received"
        );

        Ok(ChatResponse {
            provider: PROVIDER.into(),
            model: request.model,
            content,
            usage,
            finish_reason,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, ProviderError> {
        let url = format!(
            "{}?alt=sse",
            self.endpoint(&request.model, "streamGenerateContent")
        );
        let response = self.send(&request, &url).await?;

        let (tx, rx) = mpsc::channel::<Result<String, ProviderError>>(32);
        let model = request.model;

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(model = %model, "Gemini stream cancelled");
                        return;
                    }
                    _ = tx.closed() => {
                        tracing::debug!(model = %model, "Gemini stream receiver dropped");
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };

                let (payloads, finished) = match chunk {
                    Some(Ok(chunk)) => (decoder.push(&chunk), false),
                    Some(Err(e)) => {
                        let err = ProviderError::new(PROVIDER, &model, format!("Stream failed: {e}"));
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    None => (decoder.finish().into_iter().collect(), true),
                };

                for payload in payloads {
                    match chunk_text(&payload) {
                        Ok(Some(text)) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(message) => {
                            let _ = tx.send(Err(ProviderError::new(PROVIDER, &model, message))).await;
                            return;
                        }
                    }
                }

                if finished {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Turn;

    fn request() -> ChatRequest {
        ChatRequest::new(
            "gemini-2.0-flash",
            vec![Turn::user("Teach Java"), Turn::model("Understood.")],
            "What is a loop?",
        )
    }

    #[test]
    fn provider_name_is_gemini() {
        let provider = GeminiProvider::new(Some("key"), 30);
        assert_eq!(provider.name(), "gemini");
        assert!(provider.has_api_key());
        assert!(!GeminiProvider::new(Some(""), 30).has_api_key());
    }

    #[test]
    fn endpoint_prefixes_model() {
        let provider = GeminiProvider::new(Some("key"), 30).with_base_url("http://localhost:9999/");
        assert_eq!(
            provider.endpoint("gemini-2.0-flash", "generateContent"),
            "http://localhost:9999/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            provider.endpoint("models/gemini-pro", "streamGenerateContent"),
            "http://localhost:9999/models/gemini-pro:streamGenerateContent"
        );
    }

    #[test]
    fn request_body_carries_history_then_message() {
        let mut req = request();
        req.temperature = Some(0.2);

        let body = serde_json::to_value(GenerateContentRequest::from_chat(&req)).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "What is a loop?");
        assert_eq!(body["generationConfig"]["temperature"], 0.2);
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
    }

    #[test]
    fn request_body_omits_empty_generation_config() {
        let body = serde_json::to_value(GenerateContentRequest::from_chat(&request())).unwrap();
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn response_text_joins_parts() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello, "},{"text":"student"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(response.text(), "Hello, student");
    }

    #[test]
    fn sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert_eq!(decoder.push(b"1}\r\n\r\ndata: two\n\n"), vec!["{\"a\":1}", "two"]);
        assert!(decoder.push(b": comment\n\n").is_empty());
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn chunk_text_extracts_or_reports() {
        assert_eq!(
            chunk_text(r#"{"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#).unwrap(),
            Some("Hi".to_string())
        );
        assert_eq!(chunk_text(r#"{"candidates":[{"finishReason":"STOP"}]}"#).unwrap(), None);
        assert!(chunk_text(r#"{"error":{"message":"quota"}}"#).is_err());
        assert!(chunk_text("not json").is_err());
    }

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        let provider = GeminiProvider::new(None, 30).with_base_url("http://127.0.0.1:1");
        let err = provider.chat(request()).await.unwrap_err();
        assert!(err.message.contains("API key"));

        let err = provider
            .chat_stream(request(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.message.contains("API key"));
    }
}
