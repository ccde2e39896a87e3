use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::index::GeoIndex;
use crate::model::{Location, Record};
use crate::storage::{Asset, AssetStore};

/// A post as handed over by the HTTP layer, identity already validated.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub author: String,
    pub text: String,
    pub location: Location,
    pub asset: Asset,
}

/// Write path: asset store, then record assembly, then geo index.
///
/// Each step is a commit point. Nothing is retried or compensated: a failed
/// index write after a successful upload leaves the asset orphaned.
#[derive(Clone)]
pub struct IngestionPipeline {
    assets: Arc<dyn AssetStore>,
    index: Arc<dyn GeoIndex>,
    bucket: String,
}

impl IngestionPipeline {
    pub fn new(assets: Arc<dyn AssetStore>, index: Arc<dyn GeoIndex>, bucket: impl Into<String>) -> Self {
        Self { assets, index, bucket: bucket.into() }
    }

    pub async fn ingest(&self, post: NewPost) -> Result<Record> {
        // 1. Reject before any side effect
        post.location.validate()?;
        if post.author.is_empty() {
            return Err(Error::InvalidInput("missing caller identity".into()));
        }
        if post.asset.is_empty() {
            return Err(Error::InvalidInput("image payload is empty".into()));
        }

        // 2. Fresh id, doubling as the object name
        let id = Uuid::new_v4();
        tracing::info!(%id, author = %post.author, message = %post.text, "received post");

        // 3. Persist the asset
        let object_id = id.to_string();
        let asset_ref = self
            .assets
            .store(&post.asset, &self.bucket, &object_id)
            .await
            .map_err(|e| {
                tracing::error!(%id, "asset upload failed: {}", e);
                match e {
                    Error::InvalidInput(_) | Error::AssetStore(_) => e,
                    other => Error::AssetStore(other.to_string()),
                }
            })?;

        // 4. Assemble
        let record = Record::new(id, post.author, post.text, post.location).with_asset(asset_ref);

        // 5. Commit to the index
        if let Err(e) = self.index.upsert(&record.id, &record).await {
            tracing::error!(%id, asset = %record.asset_ref, "index write failed, asset orphaned: {}", e);
            return Err(match e {
                Error::Index(_) => e,
                other => Error::Index(other.to_string()),
            });
        }

        tracing::info!(%id, "post committed");
        Ok(record)
    }
}
