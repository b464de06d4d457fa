use crate::config::DatabaseConfig;
use crate::error::{Result, UsageError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info};

/// Postgres pool shared by the SQL-backed stores.
pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            "Connecting to database (max_connections={}, min_connections={})",
            config.max_connections, config.min_connections
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_seconds)))
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime_seconds)))
            .connect(&config.url);

        let pool = tokio::time::timeout(Duration::from_secs(config.connect_timeout_seconds), pool)
            .await
            .map_err(|_| {
                UsageError::Configuration(format!(
                    "timed out connecting to database after {}s",
                    config.connect_timeout_seconds
                ))
            })?
            .map_err(|e| UsageError::database("connect", e))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        match sqlx::migrate!("./migrations").run(&self.pool).await {
            Ok(()) => {
                info!("Database migrations completed successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to run database migrations: {}", e);
                Err(UsageError::database("migrate", e))
            }
        }
    }
}
