use chrono::{DateTime, Utc};
use meterline_common::format_timestamp;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, UsageError};
use crate::storage::volume_types::VolumeTypeCatalog;

/// Catalog entry describing a kind of block storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeType {
    pub id: String,
    pub name: String,
    /// Default size in GB, when the catalog defines one
    pub size: Option<u32>,
}

/// Resolves volume-type ids to catalog entries through a TTL cache.
///
/// Only hits are cached; an unknown id is asked of the catalog again on the
/// next call so that newly published types become visible immediately.
pub struct VolumeTypeResolver {
    catalog: Arc<dyn VolumeTypeCatalog>,
    cache: Cache<String, VolumeType>,
}

impl VolumeTypeResolver {
    pub fn new(catalog: Arc<dyn VolumeTypeCatalog>, ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        Self { catalog, cache }
    }

    pub async fn resolve(&self, volume_type_id: &str, at: DateTime<Utc>) -> Result<VolumeType> {
        if let Some(cached) = self.cache.get(volume_type_id).await {
            return Ok(cached);
        }

        debug!(
            "Volume type {} not cached, querying catalog (event at {})",
            volume_type_id,
            format_timestamp(&at)
        );
        let volume_type = self
            .catalog
            .lookup(volume_type_id)
            .await?
            .ok_or_else(|| UsageError::VolumeTypeNotFound {
                volume_type_id: volume_type_id.to_string(),
            })?;

        self.cache
            .insert(volume_type_id.to_string(), volume_type.clone())
            .await;
        Ok(volume_type)
    }

    pub async fn invalidate(&self, volume_type_id: &str) {
        self.cache.invalidate(volume_type_id).await;
    }
}
