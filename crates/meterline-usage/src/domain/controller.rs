use chrono::{DateTime, Duration, Utc};
use meterline_common::format_timestamp;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::domain::events::{LifecycleEvent, VolumeSpec};
use crate::domain::period::{
    validate_sequence, Attributes, InstanceAttributes, OsAttributes, UsagePeriod,
    VolumeAttributes,
};
use crate::domain::types::{EntityId, EntityType, LastEvent, TenantId};
use crate::domain::volume_types::VolumeTypeResolver;
use crate::error::{Result, UsageError};
use crate::storage::entities::EntityStore;

/// What a lifecycle event did to the records of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A new entity was opened.
    Created(UsagePeriod),
    /// The open record was closed and a successor opened at the same instant.
    Superseded {
        closed: UsagePeriod,
        opened: UsagePeriod,
    },
    /// The event landed exactly on the open record's start and rewrote it.
    UpdatedInPlace(UsagePeriod),
    /// The event did not change any billable attribute.
    Unchanged(UsagePeriod),
    Closed(UsagePeriod),
    /// The open record was dropped instead of closed, leaving no zero-length
    /// or below-threshold trace.
    Removed(UsagePeriod),
}

impl Transition {
    /// The record reflecting the entity's state after the event.
    pub fn record(&self) -> &UsagePeriod {
        match self {
            Transition::Created(record)
            | Transition::UpdatedInPlace(record)
            | Transition::Unchanged(record)
            | Transition::Closed(record)
            | Transition::Removed(record) => record,
            Transition::Superseded { opened, .. } => opened,
        }
    }

    pub fn into_record(self) -> UsagePeriod {
        match self {
            Transition::Created(record)
            | Transition::UpdatedInPlace(record)
            | Transition::Unchanged(record)
            | Transition::Closed(record)
            | Transition::Removed(record) => record,
            Transition::Superseded { opened, .. } => opened,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::Created(_) => "created",
            Transition::Superseded { .. } => "superseded",
            Transition::UpdatedInPlace(_) => "updated_in_place",
            Transition::Unchanged(_) => "unchanged",
            Transition::Closed(_) => "closed",
            Transition::Removed(_) => "removed",
        }
    }
}

/// Applies lifecycle events to the entity store.
///
/// Every transition reads the open record once and then writes through the
/// store's compare-and-set operations; a concurrent writer that got there
/// first surfaces as [`UsageError::Conflict`].
pub struct EntityController {
    store: Arc<dyn EntityStore>,
    volume_types: Arc<VolumeTypeResolver>,
    volume_existence_threshold: Option<Duration>,
}

impl EntityController {
    pub fn new(store: Arc<dyn EntityStore>, volume_types: Arc<VolumeTypeResolver>) -> Self {
        Self {
            store,
            volume_types,
            volume_existence_threshold: None,
        }
    }

    /// Volumes deleted less than `threshold` after creation, without any
    /// intermediate change, are removed instead of closed.
    pub fn with_volume_existence_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.volume_existence_threshold = threshold;
        self
    }

    pub async fn apply(&self, event: LifecycleEvent) -> Result<Transition> {
        debug!(
            "Applying {} {} event for {}",
            event.entity_type(),
            event.kind(),
            event.entity_id()
        );

        match event {
            LifecycleEvent::CreateInstance {
                entity_id,
                tenant_id,
                at,
                attributes,
            } => self.create_instance(entity_id, tenant_id, at, attributes).await,
            LifecycleEvent::ResizeInstance {
                entity_id,
                at,
                flavor,
            } => self.resize_instance(&entity_id, at, flavor).await,
            LifecycleEvent::RebuildInstance { entity_id, at, os } => {
                self.rebuild_instance(&entity_id, at, os).await
            }
            LifecycleEvent::DeleteInstance { entity_id, at } => {
                self.delete_entity(&entity_id, at, Some(EntityType::Instance))
                    .await
            }
            LifecycleEvent::CreateVolume {
                entity_id,
                tenant_id,
                at,
                spec,
            } => self.create_volume(entity_id, tenant_id, at, spec).await,
            LifecycleEvent::ResizeVolume {
                entity_id,
                at,
                size,
            } => self.resize_volume(&entity_id, at, size).await,
            LifecycleEvent::RenameVolume {
                entity_id,
                at,
                name,
            } => self.rename_volume(&entity_id, at, name).await,
            LifecycleEvent::AttachVolume {
                entity_id,
                instance_id,
                at,
            } => self.attach_volume(&entity_id, &instance_id, at).await,
            LifecycleEvent::DetachVolume {
                entity_id,
                instance_id,
                at,
            } => self.detach_volume(&entity_id, &instance_id, at).await,
            LifecycleEvent::DeleteVolume { entity_id, at } => {
                self.delete_entity(&entity_id, at, Some(EntityType::Volume))
                    .await
            }
        }
    }

    pub async fn create_instance(
        &self,
        entity_id: EntityId,
        tenant_id: TenantId,
        at: DateTime<Utc>,
        attributes: InstanceAttributes,
    ) -> Result<Transition> {
        self.create(entity_id, tenant_id, at, Attributes::Instance(attributes))
            .await
    }

    /// Open a volume after resolving its type; an unknown type writes nothing.
    pub async fn create_volume(
        &self,
        entity_id: EntityId,
        tenant_id: TenantId,
        at: DateTime<Utc>,
        spec: VolumeSpec,
    ) -> Result<Transition> {
        self.ensure_absent(&entity_id).await?;

        let volume_type = self.volume_types.resolve(&spec.volume_type_id, at).await?;
        let size = spec
            .size
            .or(volume_type.size)
            .ok_or_else(|| UsageError::missing_param("size"))?;
        ensure_positive_size(size)?;

        let attributes = Attributes::Volume(VolumeAttributes {
            name: spec.name,
            volume_type_id: volume_type.id,
            volume_type: volume_type.name,
            size,
            attached_to: spec.attached_to,
        });
        self.create(entity_id, tenant_id, at, attributes).await
    }

    pub async fn resize_instance(
        &self,
        entity_id: &EntityId,
        at: DateTime<Utc>,
        flavor: String,
    ) -> Result<Transition> {
        self.transition(entity_id, at, EntityType::Instance, LastEvent::Resize, |attrs| {
            let Attributes::Instance(instance) = attrs else {
                return false;
            };
            if instance.flavor == flavor {
                return false;
            }
            instance.flavor = flavor;
            true
        })
        .await
    }

    pub async fn rebuild_instance(
        &self,
        entity_id: &EntityId,
        at: DateTime<Utc>,
        os: OsAttributes,
    ) -> Result<Transition> {
        self.transition(entity_id, at, EntityType::Instance, LastEvent::Rebuild, |attrs| {
            let Attributes::Instance(instance) = attrs else {
                return false;
            };
            if instance.os == os {
                return false;
            }
            instance.os = os;
            true
        })
        .await
    }

    pub async fn resize_volume(
        &self,
        entity_id: &EntityId,
        at: DateTime<Utc>,
        size: u32,
    ) -> Result<Transition> {
        ensure_positive_size(size)?;
        self.transition(entity_id, at, EntityType::Volume, LastEvent::Resize, |attrs| {
            let Attributes::Volume(volume) = attrs else {
                return false;
            };
            if volume.size == size {
                return false;
            }
            volume.size = size;
            true
        })
        .await
    }

    pub async fn rename_volume(
        &self,
        entity_id: &EntityId,
        at: DateTime<Utc>,
        name: String,
    ) -> Result<Transition> {
        self.transition(entity_id, at, EntityType::Volume, LastEvent::Rename, |attrs| {
            let Attributes::Volume(volume) = attrs else {
                return false;
            };
            if volume.name == name {
                return false;
            }
            volume.name = name;
            true
        })
        .await
    }

    pub async fn attach_volume(
        &self,
        volume_id: &EntityId,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        self.transition(volume_id, at, EntityType::Volume, LastEvent::Attach, |attrs| {
            match attrs {
                Attributes::Volume(volume) => volume.attach(instance_id),
                Attributes::Instance(_) => false,
            }
        })
        .await
    }

    pub async fn detach_volume(
        &self,
        volume_id: &EntityId,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        self.transition(volume_id, at, EntityType::Volume, LastEvent::Detach, |attrs| {
            match attrs {
                Attributes::Volume(volume) => volume.detach(instance_id),
                Attributes::Instance(_) => false,
            }
        })
        .await
    }

    /// Close the open record of any entity type at `at`.
    pub async fn delete(&self, entity_id: &EntityId, at: DateTime<Utc>) -> Result<Transition> {
        self.delete_entity(entity_id, at, None).await
    }

    /// Every record of `entity_id`, ordered by start.
    pub async fn history(&self, entity_id: &EntityId) -> Result<Vec<UsagePeriod>> {
        let records = self.store.find_all(entity_id).await?;
        if records.is_empty() {
            return Err(UsageError::EntityNotFound {
                entity_id: entity_id.to_string(),
            });
        }
        if let Err(violation) = validate_sequence(&records) {
            warn!("Stored history of {} is inconsistent: {}", entity_id, violation);
        }
        Ok(records)
    }

    pub async fn entity_exists(&self, entity_id: &EntityId) -> Result<bool> {
        self.store.entity_exists(entity_id).await
    }

    async fn ensure_absent(&self, entity_id: &EntityId) -> Result<()> {
        if self.store.find_open(entity_id).await?.is_some() {
            warn!("Rejected create for {}: entity is already active", entity_id);
            return Err(UsageError::EntityAlreadyExists {
                entity_id: entity_id.to_string(),
            });
        }
        Ok(())
    }

    async fn create(
        &self,
        entity_id: EntityId,
        tenant_id: TenantId,
        at: DateTime<Utc>,
        attributes: Attributes,
    ) -> Result<Transition> {
        self.ensure_absent(&entity_id).await?;

        // A recreated entity may not reach back into its previous lifetime.
        if let Some(last_end) = self
            .store
            .find_all(&entity_id)
            .await?
            .last()
            .and_then(|previous| previous.end)
        {
            if at < last_end {
                warn!(
                    "Rejected create for {} at {}: previous lifetime ended {}",
                    entity_id,
                    format_timestamp(&at),
                    format_timestamp(&last_end)
                );
                return Err(UsageError::OutOfOrderEvent {
                    entity_id: entity_id.to_string(),
                    event_time: at,
                    period_start: last_end,
                });
            }
        }

        let record = UsagePeriod::open(entity_id, tenant_id, at, attributes, LastEvent::Create);
        self.store.insert(&record).await?;

        info!(
            "Created {} {} for tenant {} at {}",
            record.entity_type,
            record.entity_id,
            record.tenant_id,
            format_timestamp(&at)
        );
        Ok(Transition::Created(record))
    }

    /// Read the open record of `entity_id` and check it may accept an event
    /// of `expected` type at `at`.
    async fn open_record_for(
        &self,
        entity_id: &EntityId,
        at: DateTime<Utc>,
        expected: Option<EntityType>,
        event: LastEvent,
    ) -> Result<UsagePeriod> {
        let open = self
            .store
            .find_open(entity_id)
            .await?
            .ok_or_else(|| UsageError::EntityNotFound {
                entity_id: entity_id.to_string(),
            })?;

        if let Some(expected) = expected {
            if open.entity_type != expected {
                warn!(
                    "Rejected {} for {}: entity is a {}, not a {}",
                    event, entity_id, open.entity_type, expected
                );
                return Err(UsageError::EntityTypeMismatch {
                    entity_id: entity_id.to_string(),
                    expected,
                    actual: open.entity_type,
                });
            }
        }

        if at < open.start {
            warn!(
                "Rejected {} for {} at {}: open period started {}",
                event,
                entity_id,
                format_timestamp(&at),
                format_timestamp(&open.start)
            );
            return Err(UsageError::OutOfOrderEvent {
                entity_id: entity_id.to_string(),
                event_time: at,
                period_start: open.start,
            });
        }

        Ok(open)
    }

    async fn transition<F>(
        &self,
        entity_id: &EntityId,
        at: DateTime<Utc>,
        expected: EntityType,
        event: LastEvent,
        change: F,
    ) -> Result<Transition>
    where
        F: FnOnce(&mut Attributes) -> bool,
    {
        let open = self
            .open_record_for(entity_id, at, Some(expected), event)
            .await?;

        let mut attributes = open.attributes.clone();
        if !change(&mut attributes) {
            debug!("{} for {} changes nothing", event, entity_id);
            return Ok(Transition::Unchanged(open));
        }

        let key = open.key();
        if at == open.start {
            self.store
                .replace_open(&key, &open.attributes, &attributes, event)
                .await?;
            info!("Applied {} to {} in place at {}", event, key, format_timestamp(&at));

            let mut updated = open;
            updated.attributes = attributes;
            updated.last_event = event;
            return Ok(Transition::UpdatedInPlace(updated));
        }

        self.store.close(&key, at).await?;
        let opened = open.successor(at, attributes, event);

        if let Err(insert_error) = self.store.insert(&opened).await {
            warn!(
                "Insert of successor for {} failed ({}), reopening closed period",
                key, insert_error
            );
            if let Err(reopen_error) = self.store.reopen(&key, at).await {
                error!(
                    "Failed to reopen {} after aborted {}: {}",
                    key, event, reopen_error
                );
            }
            return Err(insert_error);
        }

        info!(
            "Applied {} to {} at {}",
            event,
            entity_id,
            format_timestamp(&at)
        );

        let mut closed = open;
        closed.end = Some(at);
        Ok(Transition::Superseded { closed, opened })
    }

    async fn delete_entity(
        &self,
        entity_id: &EntityId,
        at: DateTime<Utc>,
        expected: Option<EntityType>,
    ) -> Result<Transition> {
        let open = self
            .open_record_for(entity_id, at, expected, LastEvent::Delete)
            .await?;
        let key = open.key();

        if at == open.start || self.below_existence_threshold(&open, at).await? {
            self.store.remove_open(&key).await?;
            info!("Removed {} {} deleted at {}", open.entity_type, key, format_timestamp(&at));
            return Ok(Transition::Removed(open));
        }

        self.store.close(&key, at).await?;
        info!(
            "Deleted {} {} at {}",
            open.entity_type,
            entity_id,
            format_timestamp(&at)
        );

        let mut closed = open;
        closed.end = Some(at);
        Ok(Transition::Closed(closed))
    }

    async fn below_existence_threshold(&self, open: &UsagePeriod, at: DateTime<Utc>) -> Result<bool> {
        let Some(threshold) = self.volume_existence_threshold else {
            return Ok(false);
        };
        if open.entity_type != EntityType::Volume || at - open.start >= threshold {
            return Ok(false);
        }
        if open.last_event == LastEvent::Create {
            return Ok(true);
        }
        // An in-place rewrite at the creation instant keeps the record first
        // in its lifetime; a predecessor ending at its start does not.
        let records = self.store.find_all(&open.entity_id).await?;
        Ok(!records.iter().any(|p| p.end == Some(open.start)))
    }
}

fn ensure_positive_size(size: u32) -> Result<()> {
    if size == 0 {
        return Err(UsageError::InvalidAttribute {
            field: "size".to_string(),
            message: "volume size must be at least 1 GB".to_string(),
        });
    }
    Ok(())
}
