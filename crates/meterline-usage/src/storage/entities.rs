use crate::domain::period::{Attributes, UsagePeriod};
use crate::domain::types::{EntityId, EntityType, LastEvent, PeriodKey, TenantId};
use crate::error::{Result, UsageError};
use crate::storage::connection::DatabaseConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;
use tracing::debug;

/// Persistence of usage periods keyed by `(entity_id, start)`.
///
/// Every mutation of an open record is a compare-and-set on its key, so two
/// transitions that observed the same open record cannot both apply.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_open(&self, entity_id: &EntityId) -> Result<Option<UsagePeriod>>;

    /// All records of one entity, ordered by `start` ascending.
    async fn find_all(&self, entity_id: &EntityId) -> Result<Vec<UsagePeriod>>;

    /// Records whose `[start, end_or_now)` intersects `[range_start, range_end)`.
    async fn find_active_in_range(
        &self,
        tenant_id: &TenantId,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        entity_type: Option<EntityType>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsagePeriod>>;

    async fn insert(&self, record: &UsagePeriod) -> Result<()>;

    /// Close the record identified by `key` at `end`, provided it is still open.
    async fn close(&self, key: &PeriodKey, end: DateTime<Utc>) -> Result<()>;

    /// Undo a `close` at `closed_at`.
    async fn reopen(&self, key: &PeriodKey, closed_at: DateTime<Utc>) -> Result<()>;

    /// Overwrite the attributes and `last_event` of the record `key`, provided
    /// it is still open and still carries `expected`.
    async fn replace_open(
        &self,
        key: &PeriodKey,
        expected: &Attributes,
        attributes: &Attributes,
        last_event: LastEvent,
    ) -> Result<()>;

    /// Drop the still-open record `key`.
    async fn remove_open(&self, key: &PeriodKey) -> Result<()>;

    async fn entity_exists(&self, entity_id: &EntityId) -> Result<bool>;
}

pub(crate) fn conflict(key: &PeriodKey, message: &str) -> UsageError {
    UsageError::Conflict {
        entity_id: key.entity_id.to_string(),
        message: format!("{} ({})", message, key),
    }
}

pub struct SqlEntityStore {
    connection: Arc<DatabaseConnection>,
}

impl SqlEntityStore {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    fn period_from_row(row: &sqlx::postgres::PgRow) -> Result<UsagePeriod> {
        let entity_type: String = row.get("entity_type");
        let last_event: String = row.get("last_event");
        let period = UsagePeriod {
            entity_id: EntityId::new(row.get::<String, _>("entity_id")),
            tenant_id: TenantId::new(row.get::<String, _>("tenant_id")),
            entity_type: entity_type.parse()?,
            start: row.get("start_time"),
            end: row.get("end_time"),
            attributes: serde_json::from_value(row.get("attributes"))?,
            last_event: last_event.parse()?,
        };
        Ok(period)
    }

    /// Explain why a compare-and-set on `key` matched no row.
    async fn diagnose_miss(&self, key: &PeriodKey, operation: &str) -> UsageError {
        let existing = sqlx::query(
            r#"
            SELECT end_time FROM usage.entity_periods
            WHERE entity_id = $1 AND start_time = $2
            "#,
        )
        .bind(key.entity_id.as_str())
        .bind(key.start)
        .fetch_optional(self.connection.pool())
        .await;

        match existing {
            Ok(Some(_)) => conflict(key, "record changed since it was read"),
            Ok(None) => UsageError::EntityNotFound {
                entity_id: key.entity_id.to_string(),
            },
            Err(e) => UsageError::database(operation, e),
        }
    }
}

const PERIOD_COLUMNS: &str =
    "entity_id, tenant_id, entity_type, start_time, end_time, attributes, last_event";

#[async_trait]
impl EntityStore for SqlEntityStore {
    async fn find_open(&self, entity_id: &EntityId) -> Result<Option<UsagePeriod>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM usage.entity_periods WHERE entity_id = $1 AND end_time IS NULL",
            PERIOD_COLUMNS
        ))
        .bind(entity_id.as_str())
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("find_open", e))?;

        row.as_ref().map(Self::period_from_row).transpose()
    }

    async fn find_all(&self, entity_id: &EntityId) -> Result<Vec<UsagePeriod>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM usage.entity_periods WHERE entity_id = $1 ORDER BY start_time ASC",
            PERIOD_COLUMNS
        ))
        .bind(entity_id.as_str())
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("find_all", e))?;

        rows.iter().map(Self::period_from_row).collect()
    }

    async fn find_active_in_range(
        &self,
        tenant_id: &TenantId,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        entity_type: Option<EntityType>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsagePeriod>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM usage.entity_periods
            WHERE tenant_id = $1
              AND start_time < $3
              AND COALESCE(end_time, $4) > $2
              AND COALESCE(end_time, $4) > start_time
              AND ($5::text IS NULL OR entity_type = $5)
            ORDER BY start_time ASC, entity_id ASC
            "#,
            PERIOD_COLUMNS
        ))
        .bind(tenant_id.as_str())
        .bind(range_start)
        .bind(range_end)
        .bind(now)
        .bind(entity_type.map(|t| t.as_str()))
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("find_active_in_range", e))?;

        rows.iter().map(Self::period_from_row).collect()
    }

    async fn insert(&self, record: &UsagePeriod) -> Result<()> {
        record.validate()?;
        let attributes = serde_json::to_value(&record.attributes)?;

        let result = sqlx::query(
            r#"
            INSERT INTO usage.entity_periods
            (entity_id, tenant_id, entity_type, start_time, end_time, attributes, last_event)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.entity_id.as_str())
        .bind(record.tenant_id.as_str())
        .bind(record.entity_type.as_str())
        .bind(record.start)
        .bind(record.end)
        .bind(attributes)
        .bind(record.last_event.as_str())
        .execute(self.connection.pool())
        .await;

        match result {
            Ok(_) => {
                debug!("Inserted period {}", record.key());
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(conflict(&record.key(), "a conflicting record already exists"))
            }
            Err(e) => Err(UsageError::database("insert", e)),
        }
    }

    async fn close(&self, key: &PeriodKey, end: DateTime<Utc>) -> Result<()> {
        if end <= key.start {
            return Err(UsageError::InvalidInterval {
                entity_id: key.entity_id.to_string(),
                start: key.start,
                end,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE usage.entity_periods
            SET end_time = $3
            WHERE entity_id = $1 AND start_time = $2 AND end_time IS NULL
            "#,
        )
        .bind(key.entity_id.as_str())
        .bind(key.start)
        .bind(end)
        .execute(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("close", e))?;

        if result.rows_affected() == 0 {
            return Err(self.diagnose_miss(key, "close").await);
        }
        debug!("Closed period {}", key);
        Ok(())
    }

    async fn reopen(&self, key: &PeriodKey, closed_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE usage.entity_periods
            SET end_time = NULL
            WHERE entity_id = $1 AND start_time = $2 AND end_time = $3
            "#,
        )
        .bind(key.entity_id.as_str())
        .bind(key.start)
        .bind(closed_at)
        .execute(self.connection.pool())
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(self.diagnose_miss(key, "reopen").await),
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(conflict(key, "another record was opened meanwhile"))
            }
            Err(e) => Err(UsageError::database("reopen", e)),
        }
    }

    async fn replace_open(
        &self,
        key: &PeriodKey,
        expected: &Attributes,
        attributes: &Attributes,
        last_event: LastEvent,
    ) -> Result<()> {
        let expected = serde_json::to_value(expected)?;
        let attributes = serde_json::to_value(attributes)?;

        let result = sqlx::query(
            r#"
            UPDATE usage.entity_periods
            SET attributes = $3, last_event = $4
            WHERE entity_id = $1 AND start_time = $2 AND end_time IS NULL
              AND attributes = $5
            "#,
        )
        .bind(key.entity_id.as_str())
        .bind(key.start)
        .bind(attributes)
        .bind(last_event.as_str())
        .bind(expected)
        .execute(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("replace_open", e))?;

        if result.rows_affected() == 0 {
            return Err(self.diagnose_miss(key, "replace_open").await);
        }
        Ok(())
    }

    async fn remove_open(&self, key: &PeriodKey) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM usage.entity_periods
            WHERE entity_id = $1 AND start_time = $2 AND end_time IS NULL
            "#,
        )
        .bind(key.entity_id.as_str())
        .bind(key.start)
        .execute(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("remove_open", e))?;

        if result.rows_affected() == 0 {
            return Err(self.diagnose_miss(key, "remove_open").await);
        }
        Ok(())
    }

    async fn entity_exists(&self, entity_id: &EntityId) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM usage.entity_periods WHERE entity_id = $1)",
        )
        .bind(entity_id.as_str())
        .fetch_one(self.connection.pool())
        .await
        .map_err(|e| UsageError::database("entity_exists", e))
    }
}
