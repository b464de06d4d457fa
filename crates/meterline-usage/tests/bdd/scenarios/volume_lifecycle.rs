use crate::{at, TestContext, TENANT};
use meterline_usage::config::UsageConfig;
use meterline_usage::domain::{
    validate_sequence, EntityId, EntityType, LastEvent, TenantId, Transition, VolumeSpec,
    VolumeType,
};
use meterline_usage::UsageError;
use pretty_assertions::assert_eq;

fn spec(volume_type_id: &str, size: Option<u32>) -> VolumeSpec {
    VolumeSpec {
        name: "data".to_string(),
        volume_type_id: volume_type_id.to_string(),
        size,
        attached_to: vec![],
    }
}

#[tokio::test]
async fn test_unknown_volume_type_writes_nothing() {
    let context = TestContext::new();

    let err = context
        .controller
        .create_volume(
            EntityId::new("vol-x"),
            TenantId::new(TENANT),
            at(1, 0),
            spec("nvme", Some(10)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UsageError::VolumeTypeNotFound { .. }));
    assert_eq!(err.to_string(), "Unable to find volume_type id 'nvme'");
    assert!(context.store.is_empty().await);
}

#[tokio::test]
async fn test_type_published_after_a_miss_is_found() {
    let context = TestContext::new();
    let create = || {
        context.controller.create_volume(
            EntityId::new("vol-new-type"),
            TenantId::new(TENANT),
            at(1, 0),
            spec("nvme", Some(10)),
        )
    };
    assert!(create().await.is_err());

    context
        .catalog
        .upsert(VolumeType {
            id: "nvme".to_string(),
            name: "NVMe".to_string(),
            size: None,
        })
        .await;

    let created = create().await.unwrap().into_record();
    assert_eq!(created.attributes.as_volume().unwrap().volume_type, "NVMe");
}

#[tokio::test]
async fn test_volume_without_size_needs_catalog_default() {
    let context = TestContext::new();
    let err = context
        .controller
        .create_volume(
            EntityId::new("vol-hdd"),
            TenantId::new(TENANT),
            at(1, 0),
            spec("hdd", None),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UsageError::InvalidAttribute { ref field, .. } if field == "size"));
    assert!(context.store.is_empty().await);
}

#[tokio::test]
async fn test_attach_and_detach_open_new_periods() {
    let context = TestContext::new();
    let volume = EntityId::new("vol-attach");
    context.create_volume("vol-attach", at(1, 0), 50).await;

    context
        .controller
        .attach_volume(&volume, "vm-1", at(2, 0))
        .await
        .unwrap();
    context
        .controller
        .attach_volume(&volume, "vm-2", at(3, 0))
        .await
        .unwrap();
    context
        .controller
        .detach_volume(&volume, "vm-1", at(4, 0))
        .await
        .unwrap();

    let history = context.history("vol-attach").await;
    let attachments: Vec<Vec<String>> = history
        .iter()
        .map(|p| p.attributes.as_volume().unwrap().attached_to.clone())
        .collect();
    assert_eq!(
        attachments,
        vec![
            vec![],
            vec!["vm-1".to_string()],
            vec!["vm-1".to_string(), "vm-2".to_string()],
            vec!["vm-2".to_string()],
        ]
    );
    assert_eq!(history[3].last_event, LastEvent::Detach);
    assert!(validate_sequence(&history).is_ok());
}

#[tokio::test]
async fn test_attach_at_creation_instant_updates_in_place() {
    let context = TestContext::new();
    let volume = EntityId::new("vol-boot");
    context.create_volume("vol-boot", at(1, 0), 10).await;

    let transition = context
        .controller
        .attach_volume(&volume, "vm-boot", at(1, 0))
        .await
        .unwrap();

    assert!(matches!(transition, Transition::UpdatedInPlace(_)));
    let history = context.history("vol-boot").await;
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].attributes.as_volume().unwrap().attached_to,
        vec!["vm-boot".to_string()]
    );
    assert_eq!(history[0].last_event, LastEvent::Attach);
}

#[tokio::test]
async fn test_detach_of_unattached_instance_is_no_op() {
    let context = TestContext::new();
    context.create_volume("vol-idle", at(1, 0), 10).await;

    let transition = context
        .controller
        .detach_volume(&EntityId::new("vol-idle"), "vm-9", at(2, 0))
        .await
        .unwrap();

    assert!(matches!(transition, Transition::Unchanged(_)));
    assert_eq!(context.history("vol-idle").await.len(), 1);
}

#[tokio::test]
async fn test_resize_and_rename_volume() {
    let context = TestContext::new();
    let volume = EntityId::new("vol-grow");
    context.create_volume("vol-grow", at(1, 0), 10).await;

    context
        .controller
        .resize_volume(&volume, at(2, 0), 40)
        .await
        .unwrap();
    let renamed = context
        .controller
        .rename_volume(&volume, at(3, 0), "archive".to_string())
        .await
        .unwrap()
        .into_record();

    let attributes = renamed.attributes.as_volume().unwrap();
    assert_eq!(attributes.size, 40);
    assert_eq!(attributes.name, "archive");
    assert_eq!(renamed.last_event, LastEvent::Rename);

    let err = context
        .controller
        .resize_volume(&volume, at(4, 0), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, UsageError::InvalidAttribute { .. }));
}

#[tokio::test]
async fn test_volume_operation_on_instance_is_type_mismatch() {
    let context = TestContext::new();
    context.create_instance("vm-not-volume", at(1, 0)).await;

    let err = context
        .controller
        .attach_volume(&EntityId::new("vm-not-volume"), "vm-2", at(2, 0))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UsageError::EntityTypeMismatch {
            expected: EntityType::Volume,
            actual: EntityType::Instance,
            ..
        }
    ));
}

#[tokio::test]
async fn test_existence_threshold_applies_only_to_untouched_volumes() {
    let mut config = UsageConfig::default();
    config.entities.volume_existence_threshold_seconds = Some(3600);
    let context = TestContext::with_config(config);

    context.create_volume("vol-brief", at(1, 0), 10).await;
    let removed = context
        .controller
        .delete(&EntityId::new("vol-brief"), at(1, 30))
        .await
        .unwrap();
    assert!(matches!(removed, Transition::Removed(_)));
    assert!(context.history("vol-brief").await.is_empty());

    let resized = EntityId::new("vol-resized");
    context.create_volume("vol-resized", at(1, 0), 10).await;
    context
        .controller
        .resize_volume(&resized, at(1, 10), 20)
        .await
        .unwrap();
    let closed = context
        .controller
        .delete(&resized, at(1, 30))
        .await
        .unwrap();
    assert!(matches!(closed, Transition::Closed(_)));
    assert_eq!(context.history("vol-resized").await.len(), 2);

    context.create_instance("vm-brief", at(1, 0)).await;
    let instance = context
        .controller
        .delete(&EntityId::new("vm-brief"), at(1, 30))
        .await
        .unwrap();
    assert!(matches!(instance, Transition::Closed(_)));
}

#[tokio::test]
async fn test_existence_threshold_applies_to_each_lifetime() {
    let mut config = UsageConfig::default();
    config.entities.volume_existence_threshold_seconds = Some(3600);
    let context = TestContext::with_config(config);
    let volume = EntityId::new("vol-1");

    context.create_volume("vol-1", at(1, 0), 10).await;
    let first = context.controller.delete(&volume, at(5, 0)).await.unwrap();
    assert!(matches!(first, Transition::Closed(_)));

    context.create_volume("vol-1", at(6, 0), 10).await;
    let second = context.controller.delete(&volume, at(6, 10)).await.unwrap();
    assert!(matches!(second, Transition::Removed(_)));

    let history = context.history("vol-1").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].end, Some(at(5, 0)));
}

#[tokio::test]
async fn test_existence_threshold_ignores_attach_at_creation_instant() {
    let mut config = UsageConfig::default();
    config.entities.volume_existence_threshold_seconds = Some(3600);
    let context = TestContext::with_config(config);
    let volume = EntityId::new("vol-boot");

    context.create_volume("vol-boot", at(1, 0), 10).await;
    context
        .controller
        .attach_volume(&volume, "vm-boot", at(1, 0))
        .await
        .unwrap();

    let deleted = context.controller.delete(&volume, at(1, 20)).await.unwrap();
    assert!(matches!(deleted, Transition::Removed(_)));
    assert!(context.history("vol-boot").await.is_empty());
}
