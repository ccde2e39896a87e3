use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::model::{Location, Record};

/// Mean earth radius in kilometres, as used by Elasticsearch's arc distance.
pub const EARTH_RADIUS_KM: f64 = 6371.0087714;

/// Great-circle distance between two points in kilometres (haversine).
pub fn distance_km(a: &Location, b: &Location) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// The external search engine holding every committed record.
///
/// Failures map to `Error::Index`; callers decide how to surface them.
#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Creates the index with a geo-point `location` field unless it already exists.
    /// Safe to race: losing the create to another caller is success.
    async fn ensure_schema(&self) -> Result<()>;

    /// Writes the record under `id`. Once this returns, queries observe it.
    async fn upsert(&self, id: &str, record: &Record) -> Result<()>;

    /// Every record within `radius_km` of `center`. Order is unspecified.
    async fn query_radius(&self, center: &Location, radius_km: f64) -> Result<Vec<Record>>;
}

// --- ELASTICSEARCH ---

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    took: u64,
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
}

/// Mapping sent when the index is first created.
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "location": { "type": "geo_point" }
            }
        }
    })
}

/// Geo-distance filter over the `location` field.
pub fn radius_query(center: &Location, radius_km: f64, size: usize) -> Value {
    json!({
        "size": size,
        "query": {
            "bool": {
                "filter": {
                    "geo_distance": {
                        "distance": format!("{}km", radius_km),
                        "location": { "lat": center.lat, "lon": center.lon }
                    }
                }
            }
        }
    })
}

/// Geo index backed by an Elasticsearch cluster over its REST API.
#[derive(Clone)]
pub struct ElasticGeoIndex {
    http: reqwest::Client,
    base_url: String,
    index: String,
    max_hits: usize,
}

impl ElasticGeoIndex {
    pub fn new(config: &IndexConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: &IndexConfig) -> Self {
        Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            max_hits: config.max_hits,
        }
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.base_url, self.index)
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    format!("{}: {}", status, body)
}

#[async_trait]
impl GeoIndex for ElasticGeoIndex {
    async fn ensure_schema(&self) -> Result<()> {
        let url = self.index_url();

        let exists = self
            .http
            .head(&url)
            .send()
            .await
            .map_err(|e| Error::Index(format!("index existence check failed: {}", e)))?;
        match exists.status() {
            s if s.is_success() => return Ok(()),
            reqwest::StatusCode::NOT_FOUND => {}
            s => return Err(Error::Index(format!("index existence check returned {}", s))),
        }

        let resp = self
            .http
            .put(&url)
            .json(&index_mapping())
            .send()
            .await
            .map_err(|e| Error::Index(format!("index creation failed: {}", e)))?;
        if resp.status().is_success() {
            tracing::info!(index = %self.index, "created geo index");
            return Ok(());
        }

        let body = error_body(resp).await;
        if body.contains("resource_already_exists_exception") {
            tracing::debug!(index = %self.index, "geo index created concurrently");
            return Ok(());
        }
        Err(Error::Index(format!("index creation returned {}", body)))
    }

    async fn upsert(&self, id: &str, record: &Record) -> Result<()> {
        let url = format!("{}/_doc/{}", self.index_url(), id);
        let resp = self
            .http
            .put(&url)
            .query(&[("refresh", "true")])
            .json(record)
            .send()
            .await
            .map_err(|e| Error::Index(format!("upsert of {} failed: {}", id, e)))?;

        if !resp.status().is_success() {
            return Err(Error::Index(format!("upsert of {} returned {}", id, error_body(resp).await)));
        }
        tracing::info!(id, message = %record.text, "record saved to index");
        Ok(())
    }

    async fn query_radius(&self, center: &Location, radius_km: f64) -> Result<Vec<Record>> {
        let url = format!("{}/_search", self.index_url());
        let resp = self
            .http
            .post(&url)
            .json(&radius_query(center, radius_km, self.max_hits))
            .send()
            .await
            .map_err(|e| Error::Index(format!("geo query failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::Index(format!("geo query returned {}", error_body(resp).await)));
        }
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Index(format!("unreadable search response: {}", e)))?;

        let mut records = Vec::with_capacity(parsed.hits.hits.len());
        for hit in parsed.hits.hits {
            match serde_json::from_value::<Record>(hit.source) {
                Ok(mut record) => {
                    record.id = hit.id;
                    records.push(record);
                }
                // Foreign documents in the index are skipped, not fatal
                Err(e) => tracing::warn!(id = %hit.id, "skipping malformed document: {}", e),
            }
        }
        tracing::debug!(took_ms = parsed.took, hits = records.len(), "geo query complete");
        Ok(records)
    }
}

// --- IN-MEMORY ---

#[derive(Default)]
struct MemoryState {
    created: bool,
    order: Vec<String>,
    docs: HashMap<String, Record>,
}

/// Process-local geo index with immediate visibility. Scans linearly.
///
/// Returns records in first-insert order and counts calls so tests can
/// observe whether a search reached the index.
#[derive(Default)]
pub struct MemoryGeoIndex {
    state: RwLock<MemoryState>,
    queries: AtomicUsize,
    upserts: AtomicUsize,
    fail_upserts: AtomicBool,
    fail_queries: AtomicBool,
}

impl MemoryGeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_calls(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn set_failing_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_failing_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GeoIndex for MemoryGeoIndex {
    async fn ensure_schema(&self) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Error::Index("Poisoned Lock".into()))?;
        state.created = true;
        Ok(())
    }

    async fn upsert(&self, id: &str, record: &Record) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Error::Index("index unavailable".into()));
        }

        let mut state = self.state.write().map_err(|_| Error::Index("Poisoned Lock".into()))?;
        if !state.created {
            return Err(Error::Index("index does not exist".into()));
        }
        let mut stored = record.clone();
        stored.id = id.to_string();
        if state.docs.insert(id.to_string(), stored).is_none() {
            state.order.push(id.to_string());
        }
        Ok(())
    }

    async fn query_radius(&self, center: &Location, radius_km: f64) -> Result<Vec<Record>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Error::Index("index unavailable".into()));
        }

        let state = self.state.read().map_err(|_| Error::Index("Poisoned Lock".into()))?;
        if !state.created {
            return Err(Error::Index("index does not exist".into()));
        }
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.docs.get(id))
            .filter(|r| distance_km(center, &r.location) <= radius_km)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(text: &str, lat: f64, lon: f64) -> Record {
        Record::new(Uuid::new_v4(), "tester", text, Location { lat, lon })
    }

    #[test]
    fn haversine_known_distances() {
        let sf = Location { lat: 37.7749, lon: -122.4194 };
        let la = Location { lat: 34.0522, lon: -118.2437 };

        let d = distance_km(&sf, &la);
        assert!((d - 559.0).abs() < 2.0, "got {}", d);
        assert_eq!(distance_km(&sf, &sf), 0.0);

        // One degree of latitude is ~111.2 km everywhere
        let a = Location { lat: 10.0, lon: 50.0 };
        let b = Location { lat: 11.0, lon: 50.0 };
        assert!((distance_km(&a, &b) - 111.19).abs() < 0.1);
    }

    #[test]
    fn radius_query_shape() {
        let q = radius_query(&Location { lat: 37.0, lon: -122.0 }, 5.0, 100);
        let geo = &q["query"]["bool"]["filter"]["geo_distance"];

        assert_eq!(q["size"], 100);
        assert_eq!(geo["distance"], "5km");
        assert_eq!(geo["location"]["lat"], 37.0);
        assert_eq!(geo["location"]["lon"], -122.0);
        assert_eq!(index_mapping()["mappings"]["properties"]["location"]["type"], "geo_point");
    }

    #[tokio::test]
    async fn memory_index_requires_schema() {
        let index = MemoryGeoIndex::new();
        let rec = record("hi", 0.0, 0.0);

        assert!(matches!(index.upsert("a", &rec).await, Err(Error::Index(_))));
        index.ensure_schema().await.unwrap();
        index.ensure_schema().await.unwrap();
        index.upsert("a", &rec).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn memory_index_radius_and_upsert_by_id() {
        let index = MemoryGeoIndex::new();
        index.ensure_schema().await.unwrap();
        index.upsert("near", &record("near", 37.01, -122.0)).await.unwrap();
        index.upsert("far", &record("far", 40.0, -100.0)).await.unwrap();
        index.upsert("near", &record("near again", 37.01, -122.0)).await.unwrap();

        let found = index.query_radius(&Location { lat: 37.0, lon: -122.0 }, 5.0).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "near");
        assert_eq!(found[0].text, "near again");
        assert_eq!(index.query_calls(), 1);
        assert_eq!(index.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn memory_index_failure_switches() {
        let index = MemoryGeoIndex::new();
        index.ensure_schema().await.unwrap();
        index.set_failing_queries(true);
        index.set_failing_upserts(true);

        assert!(matches!(index.upsert("a", &record("x", 0.0, 0.0)).await, Err(Error::Index(_))));
        assert!(matches!(
            index.query_radius(&Location { lat: 0.0, lon: 0.0 }, 1.0).await,
            Err(Error::Index(_))
        ));
        assert!(index.is_empty());
    }
}
