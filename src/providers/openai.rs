//! OpenAI-wire-compatible adapter: OpenAI, Azure OpenAI, Groq, Together, and
//! any other provider speaking the same `/chat/completions` shape (spec.md
//! §4.7, REDESIGN FLAG #1).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::types::{AiResponse, ChatCompletionRequest, Choice, Message, Provider, StreamChunk, TokenUsage};

use super::adapter::ProviderAdapter;

pub struct OpenAiShapeAdapter {
    provider: Provider,
    client: Client,
}

impl OpenAiShapeAdapter {
    pub fn new(provider: Provider, client: Client) -> Self {
        Self { provider, client }
    }

    fn request_builder(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.provider.base_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).header("Content-Type", "application/json");
        if let Some(key) = &self.provider.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        for (name, value) in &self.provider.headers {
            req = req.header(name, value);
        }
        req
    }

    fn payload(&self, request: &ChatCompletionRequest, upstream_model: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": upstream_model,
            "messages": request.messages.iter().map(|m| serde_json::json!({
                "role": m.role,
                "content": m.content,
            })).collect::<Vec<_>>(),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
            "stream_options": if stream { serde_json::json!({"include_usage": true}) } else { serde_json::Value::Null },
            "tools": request.tools,
            "tool_choice": request.tool_choice,
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
impl ProviderAdapter for OpenAiShapeAdapter {
    fn provider(&self) -> &Provider {
        &self.provider
    }

    async fn chat(&self, request: &ChatCompletionRequest, upstream_model: &str) -> Result<AiResponse> {
        let response = self
            .request_builder("/chat/completions")
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

        parse_chat_response(&body, upstream_model)
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
        sender: mpsc::Sender<Result<StreamChunk>>,
    ) -> Result<()> {
        let response = self
            .request_builder("/chat/completions")
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

        super::sse::relay_openai_sse(response, upstream_model.to_string(), sender).await;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .request_builder("/models")
            .timeout(Duration::from_secs(5))
            .body("")
            .send()
            .await;
        Ok(matches!(response, Ok(r) if r.status().is_success() || r.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED))
    }
}

fn parse_chat_response(body: &serde_json::Value, fallback_model: &str) -> Result<AiResponse> {
    let choices_json = body["choices"]
        .as_array()
        .ok_or_else(|| GatewayError::UpstreamFailure("response missing choices array".into()))?;

    let choices = choices_json
        .iter()
        .enumerate()
        .map(|(i, choice)| Choice {
            index: i,
            message: Message {
                role: choice["message"]["role"].as_str().unwrap_or("assistant").to_string(),
                content: choice["message"]["content"].as_str().unwrap_or("").to_string(),
            },
            finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
        })
        .collect();

    let usage = TokenUsage {
        prompt_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(AiResponse {
        id: body["id"].as_str().unwrap_or_default().to_string(),
        object: "chat.completion".to_string(),
        created: body["created"].as_i64().unwrap_or_else(|| chrono::Utc::now().timestamp()),
        model: body["model"].as_str().unwrap_or(fallback_model).to_string(),
        choices,
        usage,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response_extracts_usage_and_choice() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "created": 1234,
            "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
        });
        let parsed = parse_chat_response(&body, "gpt-4o").unwrap();
        assert_eq!(parsed.usage.total_tokens, 7);
        assert_eq!(parsed.choices[0].message.content, "hi");
    }

    #[test]
    fn test_parse_chat_response_missing_choices_errors() {
        let body = serde_json::json!({"id": "x"});
        assert!(parse_chat_response(&body, "gpt-4o").is_err());
    }
}
