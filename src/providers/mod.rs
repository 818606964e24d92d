//! Upstream provider adapters (spec.md §4.7, C7).

pub mod adapter;
pub mod anthropic;
pub mod openai;
pub mod sse;

use std::sync::Arc;

use reqwest::Client;

use crate::types::{Provider, ProviderShape};

pub use adapter::ProviderAdapter;

/// Build the adapter matching a provider's declared wire shape
/// (REDESIGN FLAG #1: one adapter per shape, not one per vendor).
pub fn create_adapter(provider: Provider, client: Client) -> Arc<dyn ProviderAdapter> {
    match provider.shape {
        ProviderShape::OpenAi => Arc::new(openai::OpenAiShapeAdapter::new(provider, client)),
        ProviderShape::Anthropic => Arc::new(anthropic::AnthropicShapeAdapter::new(provider, client)),
    }
}
