use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::config::AssetConfig;
use crate::error::{Error, Result};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// An uploaded binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub bytes: Bytes,
    pub content_type: String,
}

impl Asset {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into(), content_type: DEFAULT_CONTENT_TYPE.to_string() }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Durable blob storage returning a publicly resolvable reference.
///
/// Implementations grant public read as part of the write, never overwrite
/// an existing object under the same id, and leave nothing readable when the
/// write fails.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn store(&self, asset: &Asset, bucket: &str, object_id: &str) -> Result<String>;
}

// --- GOOGLE CLOUD STORAGE ---

#[derive(Deserialize)]
struct ObjectResource {
    #[serde(rename = "mediaLink")]
    media_link: Option<String>,
}

/// Asset store backed by the Cloud Storage JSON API.
#[derive(Clone)]
pub struct GcsAssetStore {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GcsAssetStore {
    pub fn new(config: &AssetConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: &AssetConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check_bucket(&self, bucket: &str) -> Result<()> {
        let url = format!("{}/storage/v1/b/{}", self.base_url, bucket);
        let resp = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| Error::AssetStore(format!("bucket lookup failed: {}", e)))?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(Error::AssetStore(format!("bucket {} does not exist", bucket))),
            s => Err(Error::AssetStore(format!("bucket lookup for {} returned {}", bucket, s))),
        }
    }
}

#[async_trait]
impl AssetStore for GcsAssetStore {
    async fn store(&self, asset: &Asset, bucket: &str, object_id: &str) -> Result<String> {
        if asset.is_empty() {
            return Err(Error::InvalidInput("asset payload is empty".into()));
        }
        self.check_bucket(bucket).await?;

        // Single media upload: the public-read ACL and the no-overwrite
        // precondition apply atomically with the write.
        let url = format!("{}/upload/storage/v1/b/{}/o", self.base_url, bucket);
        let resp = self
            .authorize(self.http.post(&url))
            .query(&[
                ("uploadType", "media"),
                ("name", object_id),
                ("predefinedAcl", "publicRead"),
                ("ifGenerationMatch", "0"),
            ])
            .header(reqwest::header::CONTENT_TYPE, asset.content_type.as_str())
            .body(asset.bytes.clone())
            .send()
            .await
            .map_err(|e| Error::AssetStore(format!("upload of {} failed: {}", object_id, e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(Error::AssetStore(format!("object {} already exists in {}", object_id, bucket)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::AssetStore(format!("upload of {} returned {}: {}", object_id, status, body)));
        }

        let object: ObjectResource = resp
            .json()
            .await
            .map_err(|e| Error::AssetStore(format!("unreadable upload response: {}", e)))?;

        let link = object
            .media_link
            .unwrap_or_else(|| format!("{}/{}/{}", self.base_url, bucket, object_id));
        tracing::info!(object = object_id, url = %link, "asset saved");
        Ok(link)
    }
}

// --- IN-MEMORY ---

/// Process-local asset store for development and tests.
///
/// Only buckets registered up front exist. Counts every `store` call so
/// tests can assert that rejected requests never reached it.
pub struct MemoryAssetStore {
    buckets: HashSet<String>,
    objects: Mutex<HashMap<(String, String), Asset>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryAssetStore {
    pub fn new<I, S>(buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            buckets: buckets.into_iter().map(Into::into).collect(),
            objects: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every following write fail as if the backend were unreachable.
    pub fn set_failing(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a reference previously returned by `store`.
    pub fn resolve(&self, asset_ref: &str) -> Option<Asset> {
        let path = asset_ref.strip_prefix("memory://")?;
        let (bucket, object) = path.split_once('/')?;
        let objects = self.objects.lock().ok()?;
        objects.get(&(bucket.to_string(), object.to_string())).cloned()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn store(&self, asset: &Asset, bucket: &str, object_id: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::AssetStore("asset store unavailable".into()));
        }
        if asset.is_empty() {
            return Err(Error::InvalidInput("asset payload is empty".into()));
        }
        if !self.buckets.contains(bucket) {
            return Err(Error::AssetStore(format!("bucket {} does not exist", bucket)));
        }

        let mut objects = self.objects.lock().map_err(|_| Error::AssetStore("Poisoned Lock".into()))?;
        let key = (bucket.to_string(), object_id.to_string());
        if objects.contains_key(&key) {
            return Err(Error::AssetStore(format!("object {} already exists in {}", object_id, bucket)));
        }
        objects.insert(key, asset.clone());

        Ok(format!("memory://{}/{}", bucket, object_id))
    }
}
