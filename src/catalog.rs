//! Provider catalog & model-support resolution (spec.md §4.5, C5).

use std::sync::Arc;

use crate::cache::{keys, ttl, Cache};
use crate::db::{ModelRepository, ModelSupportRepository, ProviderRepository};
use crate::error::{GatewayError, Result};
use crate::types::{Model, Provider};

/// One candidate the load balancer can route a request to: an active
/// provider and the upstream model name it should be addressed with.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub provider: Provider,
    pub upstream_model_name: String,
}

pub struct Catalog {
    providers: Arc<ProviderRepository>,
    models: Arc<ModelRepository>,
    support: Arc<ModelSupportRepository>,
    cache: Arc<Cache>,
}

impl Catalog {
    pub fn new(
        providers: Arc<ProviderRepository>,
        models: Arc<ModelRepository>,
        support: Arc<ModelSupportRepository>,
        cache: Arc<Cache>,
    ) -> Self {
        Catalog {
            providers,
            models,
            support,
            cache,
        }
    }

    pub async fn find_model(&self, slug: &str) -> Result<Model> {
        self.models
            .find_by_slug(slug)
            .await?
            .ok_or_else(|| GatewayError::NoProviderForModel(slug.to_string()))
    }

    /// Every enabled, active, non-unhealthy provider that can serve
    /// `model_slug`, ordered by routing priority (`IsAvailable()`, spec.md
    /// §4.6). Providers whose own status isn't active, or whose health
    /// check has marked them unhealthy, are filtered out even if the
    /// support row is still enabled.
    pub async fn resolve(&self, model_slug: &str) -> Result<Vec<RouteCandidate>> {
        let supports = self.support.find_for_model(model_slug).await?;
        if supports.is_empty() {
            return Err(GatewayError::NoProviderForModel(model_slug.to_string()));
        }

        let active_providers = self.active_providers().await?;
        let mut candidates = Vec::new();
        for support in supports {
            if let Some(provider) = active_providers.iter().find(|p| p.id == support.provider_id) {
                if provider.is_usable() {
                    candidates.push(RouteCandidate {
                        provider: provider.clone(),
                        upstream_model_name: support
                            .upstream_model_name
                            .clone()
                            .unwrap_or_else(|| model_slug.to_string()),
                    });
                }
            }
        }

        if candidates.is_empty() {
            return Err(GatewayError::NoProviderForModel(model_slug.to_string()));
        }
        Ok(candidates)
    }

    async fn active_providers(&self) -> Result<Vec<Provider>> {
        let cache_key = keys::providers_active();
        if let Some(providers) = self.cache.get(&cache_key).await {
            return Ok(providers);
        }
        let providers = self.providers.list_active().await?;
        self.cache.set(&cache_key, &providers, ttl::PROVIDERS_ACTIVE).await;
        Ok(providers)
    }

    pub async fn list_available_models(&self) -> Result<Vec<Model>> {
        let cache_key = keys::models_available();
        if let Some(models) = self.cache.get(&cache_key).await {
            return Ok(models);
        }
        let models = self.models.list_available().await?;
        self.cache.set(&cache_key, &models, ttl::MODELS_AVAILABLE).await;
        Ok(models)
    }

    pub async fn invalidate(&self) {
        self.cache
            .delete(&[keys::providers_active(), keys::models_available()])
            .await;
    }
}
