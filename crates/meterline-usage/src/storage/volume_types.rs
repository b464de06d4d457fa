use crate::domain::volume_types::VolumeType;
use crate::error::{Result, UsageError};
use crate::storage::connection::DatabaseConnection;
use async_trait::async_trait;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Read-only catalog of volume types, consulted by the resolver on cache miss.
#[async_trait]
pub trait VolumeTypeCatalog: Send + Sync {
    async fn lookup(&self, volume_type_id: &str) -> Result<Option<VolumeType>>;
    async fn list(&self) -> Result<Vec<VolumeType>>;
}

#[derive(Clone, Default)]
pub struct MemoryVolumeTypeCatalog {
    types: Arc<RwLock<HashMap<String, VolumeType>>>,
}

impl MemoryVolumeTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(types: impl IntoIterator<Item = VolumeType>) -> Self {
        let types = types.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            types: Arc::new(RwLock::new(types)),
        }
    }

    pub async fn upsert(&self, volume_type: VolumeType) {
        self.types
            .write()
            .await
            .insert(volume_type.id.clone(), volume_type);
    }

    pub async fn remove(&self, volume_type_id: &str) -> bool {
        self.types.write().await.remove(volume_type_id).is_some()
    }
}

#[async_trait]
impl VolumeTypeCatalog for MemoryVolumeTypeCatalog {
    async fn lookup(&self, volume_type_id: &str) -> Result<Option<VolumeType>> {
        Ok(self.types.read().await.get(volume_type_id).cloned())
    }

    async fn list(&self) -> Result<Vec<VolumeType>> {
        let mut types: Vec<VolumeType> = self.types.read().await.values().cloned().collect();
        types.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(types)
    }
}

pub struct SqlVolumeTypeCatalog {
    connection: Arc<DatabaseConnection>,
}

impl SqlVolumeTypeCatalog {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    fn volume_type_from_row(row: &sqlx::postgres::PgRow) -> Result<VolumeType> {
        let size = row
            .get::<Option<i32>, _>("size_gb")
            .map(|size| {
                u32::try_from(size).map_err(|_| UsageError::InvalidAttribute {
                    field: "size".to_string(),
                    message: format!("negative catalog size {}", size),
                })
            })
            .transpose()?;

        Ok(VolumeType {
            id: row.get("volume_type_id"),
            name: row.get("name"),
            size,
        })
    }

    pub async fn upsert(&self, volume_type: &VolumeType) -> Result<()> {
        let size = volume_type
            .size
            .map(|size| {
                i32::try_from(size).map_err(|_| UsageError::InvalidAttribute {
                    field: "size".to_string(),
                    message: format!("size {} out of range", size),
                })
            })
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO usage.volume_types (volume_type_id, name, size_gb)
            VALUES ($1, $2, $3)
            ON CONFLICT (volume_type_id)
            DO UPDATE SET name = EXCLUDED.name, size_gb = EXCLUDED.size_gb, updated_at = NOW()
            "#,
        )
        .bind(&volume_type.id)
        .bind(&volume_type.name)
        .bind(size)
        .execute(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("upsert_volume_type", e))?;

        debug!("Upserted volume type {}", volume_type.id);
        Ok(())
    }

    pub async fn delete(&self, volume_type_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM usage.volume_types WHERE volume_type_id = $1")
            .bind(volume_type_id)
            .execute(self.connection.pool())
            .await
            .map_err(|e| UsageError::database("delete_volume_type", e))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl VolumeTypeCatalog for SqlVolumeTypeCatalog {
    async fn lookup(&self, volume_type_id: &str) -> Result<Option<VolumeType>> {
        let row = sqlx::query(
            "SELECT volume_type_id, name, size_gb FROM usage.volume_types WHERE volume_type_id = $1",
        )
        .bind(volume_type_id)
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("lookup_volume_type", e))?;

        row.as_ref().map(Self::volume_type_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<VolumeType>> {
        let rows = sqlx::query(
            "SELECT volume_type_id, name, size_gb FROM usage.volume_types ORDER BY volume_type_id",
        )
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("list_volume_types", e))?;

        rows.iter().map(Self::volume_type_from_row).collect()
    }
}
