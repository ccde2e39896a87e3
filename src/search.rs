use std::sync::Arc;

use crate::cache::{self, CacheLayer};
use crate::error::{Error, Result};
use crate::filter::ContentFilter;
use crate::index::GeoIndex;
use crate::model::{self, Location, Record};

pub const DEFAULT_RADIUS_KM: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchQuery {
    pub lat: f64,
    pub lon: f64,
    /// Kilometres; the service default applies when absent.
    pub radius_km: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Cache,
    Index,
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub records: Vec<Record>,
    /// JSON array exactly as served and cached.
    pub body: Vec<u8>,
    pub source: ResultSource,
}

/// Read path: cache, then geo index, then content filter, then cache fill.
#[derive(Clone)]
pub struct ProximitySearch {
    index: Arc<dyn GeoIndex>,
    cache: CacheLayer,
    filter: ContentFilter,
    default_radius_km: f64,
}

impl ProximitySearch {
    pub fn new(index: Arc<dyn GeoIndex>, cache: CacheLayer, filter: ContentFilter, default_radius_km: f64) -> Self {
        Self { index, cache, filter, default_radius_km }
    }

    pub async fn search(&self, query: SearchQuery) -> Result<SearchResults> {
        let radius_km = query.radius_km.unwrap_or(self.default_radius_km);
        let center = Location::new(query.lat, query.lon)?;
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(Error::InvalidInput(format!("radius {} must be a positive number of km", radius_km)));
        }
        if radius_km < cache::RADIUS_RESOLUTION_KM {
            return Err(Error::InvalidInput(format!(
                "radius {} km is below the {} km resolution",
                radius_km,
                cache::RADIUS_RESOLUTION_KM
            )));
        }

        let key = cache::build_key(center.lat, center.lon, radius_km);
        if let Some(body) = self.cache.get(&key).await {
            match model::decode_records(&body) {
                Ok(records) => {
                    tracing::info!(%key, hits = records.len(), "served from cache");
                    return Ok(SearchResults { records, body, source: ResultSource::Cache });
                }
                Err(e) => tracing::warn!(%key, "ignoring undecodable cache entry: {}", e),
            }
        }

        tracing::info!(lat = center.lat, lon = center.lon, radius_km, "querying geo index");
        let found = self
            .index
            .query_radius(&center, radius_km)
            .await
            .map_err(|e| Error::SearchUnavailable(e.to_string()))?;
        let total = found.len();

        let records: Vec<Record> = found.into_iter().filter(|r| !self.filter.is_filtered(&r.text)).collect();
        tracing::info!(total, kept = records.len(), "filtered search results");

        let body = model::encode_records(&records)?;
        self.cache.set(&key, body.clone()).await;

        Ok(SearchResults { records, body, source: ResultSource::Index })
    }
}
