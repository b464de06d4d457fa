use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::UsageError;

/// Stable identifier of a billable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Tenant (project) owning a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Instance,
    Volume,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Instance => "instance",
            EntityType::Volume => "volume",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(EntityType::Instance),
            "volume" => Ok(EntityType::Volume),
            other => Err(UsageError::InvalidAttribute {
                field: "entity_type".to_string(),
                message: format!("unknown entity type '{}'", other),
            }),
        }
    }
}

/// Lifecycle event that last shaped a record, kept for audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastEvent {
    Create,
    Resize,
    Rebuild,
    Rename,
    Attach,
    Detach,
    Delete,
}

impl LastEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastEvent::Create => "create",
            LastEvent::Resize => "resize",
            LastEvent::Rebuild => "rebuild",
            LastEvent::Rename => "rename",
            LastEvent::Attach => "attach",
            LastEvent::Detach => "detach",
            LastEvent::Delete => "delete",
        }
    }
}

impl fmt::Display for LastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LastEvent {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(LastEvent::Create),
            "resize" => Ok(LastEvent::Resize),
            "rebuild" => Ok(LastEvent::Rebuild),
            "rename" => Ok(LastEvent::Rename),
            "attach" => Ok(LastEvent::Attach),
            "detach" => Ok(LastEvent::Detach),
            "delete" => Ok(LastEvent::Delete),
            other => Err(UsageError::InvalidAttribute {
                field: "last_event".to_string(),
                message: format!("unknown lifecycle event '{}'", other),
            }),
        }
    }
}

/// Identity of one record: an entity never starts two periods at the same instant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeriodKey {
    pub entity_id: EntityId,
    pub start: DateTime<Utc>,
}

impl PeriodKey {
    pub fn new(entity_id: EntityId, start: DateTime<Utc>) -> Self {
        Self { entity_id, start }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.entity_id,
            meterline_common::format_timestamp(&self.start)
        )
    }
}
