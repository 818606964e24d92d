//! Anthropic Messages API adapter (spec.md §4.7, REDESIGN FLAG #1).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::types::{AiResponse, ChatCompletionRequest, Choice, Message, Provider, StreamChunk, TokenUsage};

use super::adapter::ProviderAdapter;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicShapeAdapter {
    provider: Provider,
    client: Client,
}

impl AnthropicShapeAdapter {
    pub fn new(provider: Provider, client: Client) -> Self {
        Self { provider, client }
    }

    fn request_builder(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.provider.base_url.trim_end_matches('/'));
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = &self.provider.api_key {
            req = req.header("x-api-key", key);
        }
        for (name, value) in &self.provider.headers {
            req = req.header(name, value);
        }
        req
    }

    fn payload(&self, request: &ChatCompletionRequest, upstream_model: &str, stream: bool) -> serde_json::Value {
        // Anthropic splits a leading "system" message out of the messages
        // array; everything else maps straight across.
        let system: Option<&str> = request
            .messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str());
        let messages: Vec<_> = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        serde_json::json!({
            "model": upstream_model,
            "system": system,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "temperature": request.temperature,
            "stream": stream,
        })
    }

    fn map_status_error(status: reqwest::StatusCode, body: String) -> GatewayError {
        match status {
            reqwest::StatusCode::TOO_MANY_REQUESTS => GatewayError::UpstreamFailure("rate limited by upstream".into()),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                GatewayError::UpstreamFailure("upstream rejected credentials".into())
            }
            _ => GatewayError::UpstreamFailure(format!("status {status}: {body}")),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicShapeAdapter {
    fn provider(&self) -> &Provider {
        &self.provider
    }

    async fn chat(&self, request: &ChatCompletionRequest, upstream_model: &str) -> Result<AiResponse> {
        let response = self
            .request_builder("/v1/messages")
            .timeout(Duration::from_secs(self.provider.timeout_seconds))
            .json(&self.payload(request, upstream_model, false))
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status_error(status, body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(format!("invalid response body: {e}")))?;

        parse_message_response(&body, upstream_model)
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
        sender: mpsc::Sender<Result<StreamChunk>>,
    ) -> Result<()> {
        let response = self
            .request_builder("/v1/messages")
            .timeout(Duration::from_secs(self.provider.timeout_seconds))
            .json(&self.payload(request, upstream_model, true))
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status_error(status, body));
        }

        super::sse::relay_anthropic_sse(response, upstream_model.to_string(), sender).await;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        // Anthropic has no unauthenticated /models probe; a minimal
        // messages call with max_tokens=1 is the cheapest live check.
        let probe = serde_json::json!({
            "model": "claude-3-haiku-20240307",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let response = self
            .request_builder("/v1/messages")
            .timeout(Duration::from_secs(5))
            .json(&probe)
            .send()
            .await;
        Ok(matches!(response, Ok(r) if r.status().is_success()))
    }
}

fn parse_message_response(body: &serde_json::Value, fallback_model: &str) -> Result<AiResponse> {
    let content = body["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or_else(|| GatewayError::UpstreamFailure("response missing text content".into()))?
        .to_string();

    let usage = TokenUsage {
        prompt_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: (body["usage"]["input_tokens"].as_u64().unwrap_or(0)
            + body["usage"]["output_tokens"].as_u64().unwrap_or(0)) as u32,
    };

    Ok(AiResponse {
        id: body["id"].as_str().unwrap_or_default().to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: body["model"].as_str().unwrap_or(fallback_model).to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: body["stop_reason"].as_str().unwrap_or("stop").to_string(),
        }],
        usage,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_response_extracts_text_and_usage() {
        let body = serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-opus",
            "stop_reason": "end_turn",
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 10, "output_tokens": 3},
        });
        let parsed = parse_message_response(&body, "claude-3-opus").unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
        assert_eq!(parsed.usage.total_tokens, 13);
    }

    #[test]
    fn test_parse_message_response_missing_content_errors() {
        let body = serde_json::json!({"id": "msg_1"});
        assert!(parse_message_response(&body, "claude-3-opus").is_err());
    }
}
