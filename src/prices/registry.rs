//! Registry of price sources keyed by [`Exchange`].
//!
//! Built once at startup from configured exchange names; unknown names fail
//! construction instead of surfacing per request.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Exchange, PriceSource, SourceError};

#[derive(Clone, Default)]
pub struct PriceSourceRegistry {
    sources: HashMap<Exchange, Arc<dyn PriceSource>>,
}

impl PriceSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, exchange: Exchange, source: Arc<dyn PriceSource>) {
        self.sources.insert(exchange, source);
    }

    /// Route every configured exchange to one shared source.
    pub fn from_names(names: &[String], source: Arc<dyn PriceSource>) -> Result<Self, SourceError> {
        let mut registry = Self::new();
        for name in names {
            let exchange: Exchange = name.parse()?;
            registry.register(exchange, source.clone());
        }
        Ok(registry)
    }

    /// Resolve a path segment to a registered source.
    pub fn resolve(&self, name: &str) -> Result<(Exchange, Arc<dyn PriceSource>), SourceError> {
        let exchange: Exchange = name.parse()?;
        self.sources
            .get(&exchange)
            .map(|s| (exchange, s.clone()))
            .ok_or_else(|| SourceError::UnsupportedExchange(name.to_string()))
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        let mut list: Vec<Exchange> = self.sources.keys().copied().collect();
        list.sort_by_key(|e| e.as_str());
        list
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Probe every registered source; `Ok` only when all of them answer.
    pub async fn health(&self) -> Result<(), SourceError> {
        for (exchange, source) in &self.sources {
            if let Err(e) = source.health().await {
                tracing::warn!(%exchange, "price source health check failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}
