//! Lifecycle events and their boundary validation.
//!
//! Raw payloads are loosely typed JSON objects. They are checked here, once,
//! and turned into [`LifecycleEvent`] values the controller can apply without
//! further validation.

use chrono::{DateTime, Utc};
use meterline_common::parse_timestamp;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::domain::period::{InstanceAttributes, OsAttributes};
use crate::domain::types::{EntityId, EntityType, LastEvent, TenantId};
use crate::error::{Result, UsageError};

/// Volume creation payload; the type id is resolved against the catalog
/// before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub volume_type_id: String,
    pub size: Option<u32>,
    pub attached_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    CreateInstance {
        entity_id: EntityId,
        tenant_id: TenantId,
        at: DateTime<Utc>,
        attributes: InstanceAttributes,
    },
    ResizeInstance {
        entity_id: EntityId,
        at: DateTime<Utc>,
        flavor: String,
    },
    RebuildInstance {
        entity_id: EntityId,
        at: DateTime<Utc>,
        os: OsAttributes,
    },
    DeleteInstance {
        entity_id: EntityId,
        at: DateTime<Utc>,
    },
    CreateVolume {
        entity_id: EntityId,
        tenant_id: TenantId,
        at: DateTime<Utc>,
        spec: VolumeSpec,
    },
    ResizeVolume {
        entity_id: EntityId,
        at: DateTime<Utc>,
        size: u32,
    },
    RenameVolume {
        entity_id: EntityId,
        at: DateTime<Utc>,
        name: String,
    },
    AttachVolume {
        entity_id: EntityId,
        instance_id: String,
        at: DateTime<Utc>,
    },
    DetachVolume {
        entity_id: EntityId,
        instance_id: String,
        at: DateTime<Utc>,
    },
    DeleteVolume {
        entity_id: EntityId,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            LifecycleEvent::CreateInstance { entity_id, .. }
            | LifecycleEvent::ResizeInstance { entity_id, .. }
            | LifecycleEvent::RebuildInstance { entity_id, .. }
            | LifecycleEvent::DeleteInstance { entity_id, .. }
            | LifecycleEvent::CreateVolume { entity_id, .. }
            | LifecycleEvent::ResizeVolume { entity_id, .. }
            | LifecycleEvent::RenameVolume { entity_id, .. }
            | LifecycleEvent::AttachVolume { entity_id, .. }
            | LifecycleEvent::DetachVolume { entity_id, .. }
            | LifecycleEvent::DeleteVolume { entity_id, .. } => entity_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::CreateInstance { at, .. }
            | LifecycleEvent::ResizeInstance { at, .. }
            | LifecycleEvent::RebuildInstance { at, .. }
            | LifecycleEvent::DeleteInstance { at, .. }
            | LifecycleEvent::CreateVolume { at, .. }
            | LifecycleEvent::ResizeVolume { at, .. }
            | LifecycleEvent::RenameVolume { at, .. }
            | LifecycleEvent::AttachVolume { at, .. }
            | LifecycleEvent::DetachVolume { at, .. }
            | LifecycleEvent::DeleteVolume { at, .. } => *at,
        }
    }

    pub fn kind(&self) -> LastEvent {
        match self {
            LifecycleEvent::CreateInstance { .. } | LifecycleEvent::CreateVolume { .. } => {
                LastEvent::Create
            }
            LifecycleEvent::ResizeInstance { .. } | LifecycleEvent::ResizeVolume { .. } => {
                LastEvent::Resize
            }
            LifecycleEvent::RebuildInstance { .. } => LastEvent::Rebuild,
            LifecycleEvent::RenameVolume { .. } => LastEvent::Rename,
            LifecycleEvent::AttachVolume { .. } => LastEvent::Attach,
            LifecycleEvent::DetachVolume { .. } => LastEvent::Detach,
            LifecycleEvent::DeleteInstance { .. } | LifecycleEvent::DeleteVolume { .. } => {
                LastEvent::Delete
            }
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            LifecycleEvent::CreateInstance { .. }
            | LifecycleEvent::ResizeInstance { .. }
            | LifecycleEvent::RebuildInstance { .. }
            | LifecycleEvent::DeleteInstance { .. } => EntityType::Instance,
            _ => EntityType::Volume,
        }
    }

    /// Parse one JSON-encoded event, as found in a replay file.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_json(&value)
    }

    /// Validate a raw payload.
    ///
    /// The payload is an object with an `event` discriminator
    /// (`instance.create`, `volume.attach`, ...), the `entity_id`, an event
    /// `date`, and the fields the event kind requires. The older `id`,
    /// `created_at`, `rebuild_date`, `distro` and `version` names are accepted
    /// in place of their current counterparts.
    pub fn from_json(value: &Value) -> Result<Self> {
        let payload = Payload::new(value)?;
        let event = payload.required_str("event")?;
        let entity_id = EntityId::new(payload.required_str_of(&["entity_id", "id"])?);

        match event.as_str() {
            "instance.create" => Ok(LifecycleEvent::CreateInstance {
                entity_id,
                tenant_id: TenantId::new(payload.required_str("tenant_id")?),
                at: payload.required_date_of(&["date", "created_at"])?,
                attributes: InstanceAttributes {
                    name: payload.required_str("name")?,
                    flavor: payload.required_str("flavor")?,
                    os: payload.os_attributes()?,
                    metadata: payload.string_map("metadata")?,
                },
            }),
            "instance.resize" => Ok(LifecycleEvent::ResizeInstance {
                entity_id,
                at: payload.required_date("date")?,
                flavor: payload.required_str("flavor")?,
            }),
            "instance.rebuild" => Ok(LifecycleEvent::RebuildInstance {
                entity_id,
                at: payload.required_date_of(&["date", "rebuild_date"])?,
                os: payload.os_attributes()?,
            }),
            "instance.delete" => Ok(LifecycleEvent::DeleteInstance {
                entity_id,
                at: payload.required_date("date")?,
            }),
            "volume.create" => Ok(LifecycleEvent::CreateVolume {
                entity_id,
                tenant_id: TenantId::new(payload.required_str("tenant_id")?),
                at: payload.required_date_of(&["date", "created_at"])?,
                spec: VolumeSpec {
                    name: payload.required_str("name")?,
                    volume_type_id: payload.required_str("volume_type")?,
                    size: payload.optional_u32("size")?,
                    attached_to: payload.string_list("attached_to")?,
                },
            }),
            "volume.resize" => Ok(LifecycleEvent::ResizeVolume {
                entity_id,
                at: payload.required_date("date")?,
                size: payload
                    .optional_u32("size")?
                    .ok_or_else(|| UsageError::missing_param("size"))?,
            }),
            "volume.rename" => Ok(LifecycleEvent::RenameVolume {
                entity_id,
                at: payload.required_date("date")?,
                name: payload.required_str("name")?,
            }),
            "volume.attach" => Ok(LifecycleEvent::AttachVolume {
                entity_id,
                instance_id: payload.required_str("instance_id")?,
                at: payload.required_date("date")?,
            }),
            "volume.detach" => Ok(LifecycleEvent::DetachVolume {
                entity_id,
                instance_id: payload.required_str("instance_id")?,
                at: payload.required_date("date")?,
            }),
            "volume.delete" => Ok(LifecycleEvent::DeleteVolume {
                entity_id,
                at: payload.required_date("date")?,
            }),
            other => Err(UsageError::InvalidAttribute {
                field: "event".to_string(),
                message: format!("unknown lifecycle event '{}'", other),
            }),
        }
    }
}

struct Payload<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Payload<'a> {
    fn new(value: &'a Value) -> Result<Self> {
        value
            .as_object()
            .map(|fields| Self { fields })
            .ok_or_else(|| UsageError::InvalidAttribute {
                field: "payload".to_string(),
                message: "Invalid parameter or payload".to_string(),
            })
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    fn required_str(&self, field: &str) -> Result<String> {
        match self.get(field) {
            None => Err(UsageError::missing_param(field)),
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(Value::String(_)) => Err(UsageError::missing_param(field)),
            Some(_) => Err(UsageError::InvalidAttribute {
                field: field.to_string(),
                message: "expected a string".to_string(),
            }),
        }
    }

    fn required_date(&self, field: &str) -> Result<DateTime<Utc>> {
        let raw = self.required_str(field)?;
        Ok(parse_timestamp(&raw)?)
    }

    /// The first of `fields` present in the payload; a missing value is
    /// reported under the first name.
    fn required_str_of(&self, fields: &[&str]) -> Result<String> {
        let field = fields
            .iter()
            .copied()
            .find(|field| self.get(field).is_some())
            .or_else(|| fields.first().copied())
            .unwrap_or_default();
        self.required_str(field)
    }

    fn required_date_of(&self, fields: &[&str]) -> Result<DateTime<Utc>> {
        let raw = self.required_str_of(fields)?;
        Ok(parse_timestamp(&raw)?)
    }

    fn optional_u32(&self, field: &str) -> Result<Option<u32>> {
        let Some(value) = self.get(field) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| UsageError::InvalidAttribute {
                field: field.to_string(),
                message: format!("expected a non-negative integer, got {}", value),
            })
    }

    fn string_list(&self, field: &str) -> Result<Vec<String>> {
        let Some(value) = self.get(field) else {
            return Ok(Vec::new());
        };
        let invalid = || UsageError::InvalidAttribute {
            field: field.to_string(),
            message: "expected a list of strings".to_string(),
        };
        value
            .as_array()
            .ok_or_else(invalid)?
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect()
    }

    fn string_map(&self, field: &str) -> Result<BTreeMap<String, String>> {
        let Some(value) = self.get(field) else {
            return Ok(BTreeMap::new());
        };
        let object = value
            .as_object()
            .ok_or_else(|| UsageError::InvalidAttribute {
                field: field.to_string(),
                message: "expected an object".to_string(),
            })?;
        Ok(object
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect())
    }

    fn os_attributes(&self) -> Result<OsAttributes> {
        Ok(OsAttributes {
            os_type: self.required_str("os_type")?,
            distro: self.required_str_of(&["os_distro", "distro"])?,
            version: self.required_str_of(&["os_version", "version"])?,
        })
    }
}
