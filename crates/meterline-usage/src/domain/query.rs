use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::domain::period::UsagePeriod;
use crate::domain::types::{EntityType, TenantId};
use crate::error::{Result, UsageError};
use crate::storage::entities::EntityStore;

/// Source of "now" for open records
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to an instant until moved explicitly.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A stored period as seen from one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivePeriod {
    pub period: UsagePeriod,
    /// `end`, or the query time while the period is open
    pub effective_end: DateTime<Utc>,
    pub visible_start: DateTime<Utc>,
    pub visible_end: DateTime<Utc>,
}

impl ActivePeriod {
    /// Duration of the part of the period inside the queried range.
    pub fn visible_duration(&self) -> Duration {
        self.visible_end - self.visible_start
    }

    /// Visible duration in hours, at millisecond precision.
    pub fn billable_hours(&self) -> Decimal {
        let millis = Decimal::from(self.visible_duration().num_milliseconds());
        (millis / Decimal::from(3_600_000)).round_dp(6)
    }
}

/// Read-only view over the entity store answering range queries.
pub struct QueryService {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
}

impl QueryService {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Periods of `tenant_id` active in `[range_start, range_end)`, ordered by
    /// start then entity id.
    pub async fn list_periods(
        &self,
        tenant_id: &TenantId,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<ActivePeriod>> {
        if range_start >= range_end {
            return Err(UsageError::InvalidInterval {
                entity_id: tenant_id.to_string(),
                start: range_start,
                end: range_end,
            });
        }

        let now = self.clock.now();
        let records = self
            .store
            .find_active_in_range(tenant_id, range_start, range_end, entity_type, now)
            .await?;

        let mut periods: Vec<ActivePeriod> = records
            .into_iter()
            .filter_map(|period| {
                let effective_end = period.effective_end(now);
                let visible_start = period.start.max(range_start);
                let visible_end = effective_end.min(range_end);
                (visible_start < visible_end).then_some(ActivePeriod {
                    period,
                    effective_end,
                    visible_start,
                    visible_end,
                })
            })
            .collect();

        periods.sort_by(|a, b| {
            a.period
                .start
                .cmp(&b.period.start)
                .then_with(|| a.period.entity_id.cmp(&b.period.entity_id))
        });

        debug!(
            "Found {} periods for tenant {} in range",
            periods.len(),
            tenant_id
        );
        Ok(periods)
    }

    pub async fn list_instances(
        &self,
        tenant_id: &TenantId,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<ActivePeriod>> {
        self.list_periods(tenant_id, range_start, range_end, Some(EntityType::Instance))
            .await
    }

    pub async fn list_volumes(
        &self,
        tenant_id: &TenantId,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<ActivePeriod>> {
        self.list_periods(tenant_id, range_start, range_end, Some(EntityType::Volume))
            .await
    }
}
