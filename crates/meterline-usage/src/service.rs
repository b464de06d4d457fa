use crate::config::{StorageBackend, UsageConfig};
use crate::domain::controller::EntityController;
use crate::domain::query::{Clock, QueryService, SystemClock};
use crate::domain::volume_types::VolumeTypeResolver;
use crate::error::Result;
use crate::storage::{
    DatabaseConnection, EntityStore, MemoryEntityStore, MemoryVolumeTypeCatalog,
    SqlEntityStore, SqlVolumeTypeCatalog, VolumeTypeCatalog,
};
use std::sync::Arc;
use tracing::info;

/// The controller and query service wired to one storage backend.
pub struct UsageService {
    pub controller: EntityController,
    pub queries: QueryService,
    database: Option<Arc<DatabaseConnection>>,
}

impl UsageService {
    pub async fn from_config(config: &UsageConfig) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Memory => {
                info!("Using in-memory entity store");
                let catalog = MemoryVolumeTypeCatalog::with_types(config.volume_types.types.clone());
                Self::assemble(
                    config,
                    Arc::new(MemoryEntityStore::new()),
                    Arc::new(catalog),
                    Arc::new(SystemClock),
                    None,
                )
            }
            StorageBackend::Postgres => {
                info!("Using postgres entity store");
                let connection = Arc::new(DatabaseConnection::connect(&config.database).await?);
                Self::assemble(
                    config,
                    Arc::new(SqlEntityStore::new(connection.clone())),
                    Arc::new(SqlVolumeTypeCatalog::new(connection.clone())),
                    Arc::new(SystemClock),
                    Some(connection),
                )
            }
        }
    }

    /// Wire explicit collaborators, as tests and embedding callers do.
    pub fn with_parts(
        config: &UsageConfig,
        store: Arc<dyn EntityStore>,
        catalog: Arc<dyn VolumeTypeCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::assemble(config, store, catalog, clock, None)
    }

    fn assemble(
        config: &UsageConfig,
        store: Arc<dyn EntityStore>,
        catalog: Arc<dyn VolumeTypeCatalog>,
        clock: Arc<dyn Clock>,
        database: Option<Arc<DatabaseConnection>>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = Arc::new(VolumeTypeResolver::new(
            catalog,
            config.volume_types.cache_ttl(),
            config.volume_types.cache_max_capacity,
        ));
        let controller = EntityController::new(store.clone(), resolver)
            .with_volume_existence_threshold(config.entities.volume_existence_threshold()?);
        let queries = QueryService::new(store, clock);

        Ok(Self {
            controller,
            queries,
            database,
        })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        match &self.database {
            Some(connection) => connection.run_migrations().await,
            None => {
                info!("In-memory backend has no schema to migrate");
                Ok(())
            }
        }
    }
}
