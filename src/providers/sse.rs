//! SSE relay helpers shared by the shape adapters (spec.md §4.7/§4.8).
//!
//! Buffers upstream bytes line-by-line, strips the `data: ` prefix, and
//! translates each frame into a [`StreamChunk`] pushed onto the caller's
//! channel. Modeled on the shadow-stream / line-buffer relay pattern used
//! by LLM proxy implementations in the wild: tee upstream bytes through a
//! buffer, parse out `usage` as it arrives, and never block the client on
//! parse failures — a malformed frame is skipped, not fatal.

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::types::{StreamChunk, TokenUsage};

pub async fn relay_openai_sse(
    response: reqwest::Response,
    model: String,
    sender: mpsc::Sender<Result<StreamChunk>>,
) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = sender.send(Err(GatewayError::UpstreamFailure(e.to_string()))).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            if data == "[DONE]" {
                return;
            }
            if let Some(parsed) = parse_openai_frame(data, &model) {
                if sender.send(Ok(parsed)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn parse_openai_frame(data: &str, model: &str) -> Option<StreamChunk> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    let delta = &value["choices"][0]["delta"];
    let content = delta["content"].as_str().unwrap_or_default().to_string();
    let finish_reason = value["choices"][0]["finish_reason"].as_str().map(str::to_string);
    let usage = value.get("usage").and_then(|u| {
        Some(TokenUsage {
            prompt_tokens: u["prompt_tokens"].as_u64()? as u32,
            completion_tokens: u["completion_tokens"].as_u64()? as u32,
            total_tokens: u["total_tokens"].as_u64()? as u32,
        })
    });

    Some(StreamChunk {
        id: value["id"].as_str().unwrap_or_default().to_string(),
        object: "chat.completion.chunk".to_string(),
        created: value["created"].as_i64().unwrap_or_else(|| chrono::Utc::now().timestamp()),
        model: value["model"].as_str().unwrap_or(model).to_string(),
        content,
        finish_reason,
        usage,
    })
}

/// Anthropic's Messages API streams typed events (`message_start`,
/// `content_block_delta`, `message_delta` carrying cumulative usage,
/// `message_stop`) rather than OpenAI's flat delta frames.
pub async fn relay_anthropic_sse(
    response: reqwest::Response,
    model: String,
    sender: mpsc::Sender<Result<StreamChunk>>,
) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut message_id = String::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = sender.send(Err(GatewayError::UpstreamFailure(e.to_string()))).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else { continue };

            match value["type"].as_str() {
                Some("message_start") => {
                    message_id = value["message"]["id"].as_str().unwrap_or_default().to_string();
                }
                Some("content_block_delta") => {
                    let content = value["delta"]["text"].as_str().unwrap_or_default().to_string();
                    let frame = StreamChunk {
                        id: message_id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created: chrono::Utc::now().timestamp(),
                        model: model.clone(),
                        content,
                        finish_reason: None,
                        usage: None,
                    };
                    if sender.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Some("message_delta") => {
                    let finish_reason = value["delta"]["stop_reason"].as_str().map(str::to_string);
                    let usage = value.get("usage").and_then(|u| {
                        let completion_tokens = u["output_tokens"].as_u64()? as u32;
                        Some(TokenUsage {
                            prompt_tokens: 0,
                            completion_tokens,
                            total_tokens: completion_tokens,
                        })
                    });
                    let frame = StreamChunk {
                        id: message_id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created: chrono::Utc::now().timestamp(),
                        model: model.clone(),
                        content: String::new(),
                        finish_reason,
                        usage,
                    };
                    if sender.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Some("message_stop") => return,
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_frame_extracts_content() {
        let data = r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#;
        let frame = parse_openai_frame(data, "gpt-4o").unwrap();
        assert_eq!(frame.content, "hi");
        assert!(frame.usage.is_none());
    }

    #[test]
    fn test_parse_openai_frame_with_terminal_usage() {
        let data = r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        let frame = parse_openai_frame(data, "gpt-4o").unwrap();
        assert_eq!(frame.finish_reason.as_deref(), Some("stop"));
        assert_eq!(frame.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_parse_openai_frame_malformed_json_is_skipped() {
        assert!(parse_openai_frame("not json", "gpt-4o").is_none());
    }
}
