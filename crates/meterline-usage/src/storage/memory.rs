use crate::domain::period::{Attributes, UsagePeriod};
use crate::domain::types::{EntityId, EntityType, LastEvent, PeriodKey, TenantId};
use crate::error::{Result, UsageError};
use crate::storage::entities::{conflict, EntityStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-local entity store.
///
/// Each entity's records are kept sorted by `start`; every operation runs
/// under a single write lock, which makes the compare-and-set semantics
/// trivially atomic.
#[derive(Clone, Default)]
pub struct MemoryEntityStore {
    records: Arc<RwLock<HashMap<EntityId, Vec<UsagePeriod>>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all entities.
    pub async fn len(&self) -> usize {
        self.records.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn locate<'a>(
        records: &'a mut HashMap<EntityId, Vec<UsagePeriod>>,
        key: &PeriodKey,
    ) -> Result<&'a mut UsagePeriod> {
        records
            .get_mut(&key.entity_id)
            .and_then(|periods| periods.iter_mut().find(|p| p.start == key.start))
            .ok_or_else(|| UsageError::EntityNotFound {
                entity_id: key.entity_id.to_string(),
            })
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_open(&self, entity_id: &EntityId) -> Result<Option<UsagePeriod>> {
        let records = self.records.read().await;
        Ok(records
            .get(entity_id)
            .and_then(|periods| periods.iter().find(|p| p.is_open()))
            .cloned())
    }

    async fn find_all(&self, entity_id: &EntityId) -> Result<Vec<UsagePeriod>> {
        let records = self.records.read().await;
        Ok(records.get(entity_id).cloned().unwrap_or_default())
    }

    async fn find_active_in_range(
        &self,
        tenant_id: &TenantId,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        entity_type: Option<EntityType>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsagePeriod>> {
        let records = self.records.read().await;
        let mut found: Vec<UsagePeriod> = records
            .values()
            .flatten()
            .filter(|p| p.tenant_id == *tenant_id)
            .filter(|p| entity_type.map_or(true, |t| p.entity_type == t))
            .filter(|p| p.intersects(range_start, range_end, now))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.entity_id.cmp(&b.entity_id)));
        Ok(found)
    }

    async fn insert(&self, record: &UsagePeriod) -> Result<()> {
        record.validate()?;
        let mut records = self.records.write().await;
        let periods = records.entry(record.entity_id.clone()).or_default();

        if periods.iter().any(|p| p.start == record.start) {
            return Err(conflict(&record.key(), "a record with this start already exists"));
        }
        if record.is_open() && periods.iter().any(|p| p.is_open()) {
            return Err(conflict(&record.key(), "the entity already has an open record"));
        }

        let position = periods.partition_point(|p| p.start < record.start);
        periods.insert(position, record.clone());
        Ok(())
    }

    async fn close(&self, key: &PeriodKey, end: DateTime<Utc>) -> Result<()> {
        if end <= key.start {
            return Err(UsageError::InvalidInterval {
                entity_id: key.entity_id.to_string(),
                start: key.start,
                end,
            });
        }

        let mut records = self.records.write().await;
        let period = Self::locate(&mut records, key)?;
        if !period.is_open() {
            return Err(conflict(key, "record is no longer open"));
        }
        period.end = Some(end);
        Ok(())
    }

    async fn reopen(&self, key: &PeriodKey, closed_at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.write().await;
        let has_open = records
            .get(&key.entity_id)
            .is_some_and(|periods| periods.iter().any(|p| p.is_open()));
        if has_open {
            return Err(conflict(key, "another record was opened meanwhile"));
        }

        let period = Self::locate(&mut records, key)?;
        if period.end != Some(closed_at) {
            return Err(conflict(key, "record was modified after being closed"));
        }
        period.end = None;
        Ok(())
    }

    async fn replace_open(
        &self,
        key: &PeriodKey,
        expected: &Attributes,
        attributes: &Attributes,
        last_event: LastEvent,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let period = Self::locate(&mut records, key)?;
        if !period.is_open() || period.attributes != *expected {
            return Err(conflict(key, "record changed since it was read"));
        }
        period.attributes = attributes.clone();
        period.last_event = last_event;
        Ok(())
    }

    async fn remove_open(&self, key: &PeriodKey) -> Result<()> {
        let mut records = self.records.write().await;
        if !Self::locate(&mut records, key)?.is_open() {
            return Err(conflict(key, "record is no longer open"));
        }

        if let Some(periods) = records.get_mut(&key.entity_id) {
            periods.retain(|p| p.start != key.start);
            if periods.is_empty() {
                records.remove(&key.entity_id);
            }
        }
        Ok(())
    }

    async fn entity_exists(&self, entity_id: &EntityId) -> Result<bool> {
        Ok(self.records.read().await.contains_key(entity_id))
    }
}
