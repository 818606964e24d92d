//! Upstream client trait and the canonical request/response shapes adapters
//! translate to and from (spec.md §4.7, C7).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{AiResponse, ChatCompletionRequest, Provider, StreamChunk};

/// One upstream call. Implementors translate `ChatCompletionRequest` into
/// the provider's wire format and translate the reply back into the
/// gateway's canonical [`AiResponse`]/[`StreamChunk`] shapes.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> &Provider;

    async fn chat(&self, request: &ChatCompletionRequest, upstream_model: &str) -> Result<AiResponse>;

    /// Streams response chunks onto `sender`. The sender is closed when the
    /// upstream stream ends or errors; the caller observes completion by
    /// the channel closing, not a return value.
    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
        sender: mpsc::Sender<Result<StreamChunk>>,
    ) -> Result<()>;

    async fn health_check(&self) -> Result<bool>;

    fn name(&self) -> &str {
        &self.provider().name
    }

    /// Fallback estimate when upstream never reports usage (spec.md §9):
    /// whitespace word count times a configurable fudge factor.
    fn estimate_tokens(&self, text: &str, fudge_factor: f64) -> u32 {
        let words = text.split_whitespace().count() as f64;
        (words * fudge_factor).ceil() as u32
    }
}
