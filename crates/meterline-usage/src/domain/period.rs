use chrono::{DateTime, Duration, Utc};
use meterline_common::time::{format_timestamp, iso8601};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::types::{EntityId, EntityType, LastEvent, PeriodKey, TenantId};
use crate::error::{Result, UsageError};

/// Operating system an instance was (re)built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsAttributes {
    pub os_type: String,
    pub distro: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAttributes {
    pub name: String,
    pub flavor: String,
    pub os: OsAttributes,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttributes {
    pub name: String,
    pub volume_type_id: String,
    /// Display name resolved from the volume-type catalog
    pub volume_type: String,
    /// Size in GB
    pub size: u32,
    #[serde(default)]
    pub attached_to: Vec<String>,
}

impl VolumeAttributes {
    /// Returns false when the instance was already attached.
    pub fn attach(&mut self, instance_id: &str) -> bool {
        if self.attached_to.iter().any(|id| id == instance_id) {
            return false;
        }
        self.attached_to.push(instance_id.to_string());
        true
    }

    /// Returns false when the instance was not attached.
    pub fn detach(&mut self, instance_id: &str) -> bool {
        let before = self.attached_to.len();
        self.attached_to.retain(|id| id != instance_id);
        before != self.attached_to.len()
    }
}

/// Billable attribute snapshot, one variant per entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attributes {
    Instance(InstanceAttributes),
    Volume(VolumeAttributes),
}

impl Attributes {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Attributes::Instance(_) => EntityType::Instance,
            Attributes::Volume(_) => EntityType::Volume,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceAttributes> {
        match self {
            Attributes::Instance(attrs) => Some(attrs),
            Attributes::Volume(_) => None,
        }
    }

    pub fn as_volume(&self) -> Option<&VolumeAttributes> {
        match self {
            Attributes::Volume(attrs) => Some(attrs),
            Attributes::Instance(_) => None,
        }
    }
}

/// One interval during which a resource had a fixed set of billable attributes.
///
/// `start` is inclusive, `end` exclusive; an absent `end` marks the open
/// record currently in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub entity_id: EntityId,
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    #[serde(with = "iso8601")]
    pub start: DateTime<Utc>,
    #[serde(with = "iso8601::option", default)]
    pub end: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub last_event: LastEvent,
}

impl UsagePeriod {
    pub fn open(
        entity_id: EntityId,
        tenant_id: TenantId,
        start: DateTime<Utc>,
        attributes: Attributes,
        last_event: LastEvent,
    ) -> Self {
        Self {
            entity_id,
            tenant_id,
            entity_type: attributes.entity_type(),
            start,
            end: None,
            attributes,
            last_event,
        }
    }

    /// The open record that takes over from this one at `at`.
    pub fn successor(&self, at: DateTime<Utc>, attributes: Attributes, last_event: LastEvent) -> Self {
        Self::open(
            self.entity_id.clone(),
            self.tenant_id.clone(),
            at,
            attributes,
            last_event,
        )
    }

    pub fn key(&self) -> PeriodKey {
        PeriodKey::new(self.entity_id.clone(), self.start)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// `end`, or `now` while the record is open.
    pub fn effective_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end.unwrap_or(now)
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.effective_end(now) - self.start
    }

    /// Whether `[start, end_or_now)` intersects `[range_start, range_end)`.
    pub fn intersects(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let end = self.effective_end(now);
        self.start < end && self.start < range_end && end > range_start
    }

    pub fn validate(&self) -> Result<()> {
        if self.entity_type != self.attributes.entity_type() {
            return Err(UsageError::EntityTypeMismatch {
                entity_id: self.entity_id.to_string(),
                expected: self.entity_type,
                actual: self.attributes.entity_type(),
            });
        }
        if let Some(end) = self.end {
            if end <= self.start {
                return Err(UsageError::InvalidInterval {
                    entity_id: self.entity_id.to_string(),
                    start: self.start,
                    end,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SequenceViolation {
    #[error("records belong to more than one entity ({0} and {1})")]
    MixedEntities(String, String),

    #[error("record starting {} is not strictly after its predecessor", format_timestamp(.0))]
    Unordered(DateTime<Utc>),

    #[error("record starting {} has no positive duration", format_timestamp(.0))]
    EmptyInterval(DateTime<Utc>),

    #[error("open record starting {} is followed by another record", format_timestamp(.0))]
    OpenNotLast(DateTime<Utc>),

    #[error("record ends {} but the next one starts {}", format_timestamp(.end), format_timestamp(.next_start))]
    Discontinuity {
        end: DateTime<Utc>,
        next_start: DateTime<Utc>,
    },
}

/// Check the records of one entity, ordered by `start`, against the period
/// invariants and report the first violation.
pub fn validate_sequence(records: &[UsagePeriod]) -> std::result::Result<(), SequenceViolation> {
    for (i, record) in records.iter().enumerate() {
        if let Some(end) = record.end {
            if end <= record.start {
                return Err(SequenceViolation::EmptyInterval(record.start));
            }
        }

        let Some(next) = records.get(i + 1) else {
            continue;
        };

        if next.entity_id != record.entity_id {
            return Err(SequenceViolation::MixedEntities(
                record.entity_id.to_string(),
                next.entity_id.to_string(),
            ));
        }
        if next.start <= record.start {
            return Err(SequenceViolation::Unordered(next.start));
        }
        match record.end {
            None => return Err(SequenceViolation::OpenNotLast(record.start)),
            Some(end) if end != next.start => {
                return Err(SequenceViolation::Discontinuity {
                    end,
                    next_start: next.start,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}
