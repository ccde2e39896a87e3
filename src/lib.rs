pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod index;
pub mod ingest;
pub mod model;
pub mod parser;
pub mod search;
pub mod server;
pub mod storage;

use std::fmt;
use std::sync::Arc;

use crate::cache::{CacheLayer, NoopCache};
use crate::config::Config;
use crate::filter::ContentFilter;
use crate::index::{ElasticGeoIndex, GeoIndex};
use crate::ingest::IngestionPipeline;
use crate::search::ProximitySearch;
use crate::storage::{AssetStore, GcsAssetStore};

pub use crate::error::{Error, Result};

/// Everything a request handler needs, built once at startup.
///
/// The two paths share the geo index and nothing else; neither touches
/// the other's cache entries.
pub struct Around {
    pub ingest: IngestionPipeline,
    pub search: ProximitySearch,
    index: Arc<dyn GeoIndex>,
}

impl fmt::Debug for Around {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Around").finish_non_exhaustive()
    }
}

impl Around {
    pub fn new(
        config: &Config,
        assets: Arc<dyn AssetStore>,
        index: Arc<dyn GeoIndex>,
        cache: CacheLayer,
    ) -> Self {
        let ingest = IngestionPipeline::new(assets, index.clone(), config.assets.bucket.clone());
        let filter = ContentFilter::new(config.banned_words.iter().cloned());
        let search = ProximitySearch::new(index.clone(), cache, filter, config.default_radius_km);
        Self { ingest, search, index }
    }

    /// Wires the production backends: Cloud Storage, Elasticsearch, Redis.
    pub fn from_config(config: &Config) -> Self {
        let http = reqwest::Client::new();
        let assets = Arc::new(GcsAssetStore::with_client(http.clone(), &config.assets));
        let index = Arc::new(ElasticGeoIndex::with_client(http, &config.index));

        let cache = CacheLayer::from_config(&config.cache).unwrap_or_else(|e| {
            tracing::warn!("cache disabled: {}", e);
            CacheLayer::new(Arc::new(NoopCache), config.cache.ttl, config.cache.op_timeout)
        });

        Self::new(config, assets, index, cache)
    }

    /// Makes sure the geo index exists. Must complete before serving.
    pub async fn bootstrap(&self) -> Result<()> {
        self.index.ensure_schema().await
    }
}
