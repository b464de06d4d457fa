use crate::{at, instance, TestContext, TENANT};
use meterline_usage::domain::{
    validate_sequence, EntityId, LastEvent, LifecycleEvent, OsAttributes, TenantId, Transition,
};
use meterline_usage::UsageError;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_create_resize_delete_round_trip() {
    let context = TestContext::new();
    let vm = EntityId::new("vm-round-trip");

    context.create_instance("vm-round-trip", at(1, 0)).await;
    context
        .controller
        .resize_instance(&vm, at(3, 0), "m1.large".to_string())
        .await
        .expect("Failed to resize");
    context
        .controller
        .delete(&vm, at(5, 0))
        .await
        .expect("Failed to delete");

    let history = context.history("vm-round-trip").await;
    assert_eq!(history.len(), 2);
    assert_eq!((history[0].start, history[0].end), (at(1, 0), Some(at(3, 0))));
    assert_eq!((history[1].start, history[1].end), (at(3, 0), Some(at(5, 0))));
    assert_eq!(history[0].last_event, LastEvent::Create);
    assert_eq!(history[1].last_event, LastEvent::Resize);
    assert_eq!(
        history[1].attributes.as_instance().unwrap().flavor,
        "m1.large"
    );
    assert!(validate_sequence(&history).is_ok());
}

#[tokio::test]
async fn test_rebuild_keeps_flavor_and_changes_os() {
    let context = TestContext::new();
    let vm = EntityId::new("vm-rebuild");
    context.create_instance("vm-rebuild", at(1, 0)).await;

    let rebuilt = context
        .controller
        .rebuild_instance(
            &vm,
            at(2, 0),
            OsAttributes {
                os_type: "windows".to_string(),
                distro: "server".to_string(),
                version: "2022".to_string(),
            },
        )
        .await
        .expect("Failed to rebuild")
        .into_record();

    let attributes = rebuilt.attributes.as_instance().unwrap();
    assert_eq!(attributes.flavor, "m1.small");
    assert_eq!(attributes.os.os_type, "windows");
    assert_eq!(attributes.metadata.get("team").map(String::as_str), Some("search"));
    assert_eq!(rebuilt.last_event, LastEvent::Rebuild);
}

#[tokio::test]
async fn test_second_create_is_rejected_while_active() {
    let context = TestContext::new();
    context.create_instance("vm-dup", at(1, 0)).await;

    let err = context
        .controller
        .create_instance(
            EntityId::new("vm-dup"),
            TenantId::new(TENANT),
            at(2, 0),
            instance("vm-dup"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UsageError::EntityAlreadyExists { .. }));
    assert_eq!(context.history("vm-dup").await.len(), 1);
}

#[tokio::test]
async fn test_entity_can_be_recreated_after_delete() {
    let context = TestContext::new();
    let vm = EntityId::new("vm-again");
    context.create_instance("vm-again", at(1, 0)).await;
    context.controller.delete(&vm, at(2, 0)).await.unwrap();

    context.create_instance("vm-again", at(4, 0)).await;

    let history = context.history("vm-again").await;
    assert_eq!(history.len(), 2);
    assert!(history[1].is_open());
}

#[tokio::test]
async fn test_transition_on_unknown_entity_is_not_found() {
    let context = TestContext::new();
    let err = context
        .controller
        .resize_instance(&EntityId::new("ghost"), at(1, 0), "m1.large".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, UsageError::EntityNotFound { .. }));

    let err = context
        .controller
        .history(&EntityId::new("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, UsageError::EntityNotFound { .. }));
}

#[tokio::test]
async fn test_out_of_order_delete_keeps_record_open() {
    let context = TestContext::new();
    context.create_instance("vm-late", at(4, 0)).await;

    let err = context
        .controller
        .delete(&EntityId::new("vm-late"), at(3, 59))
        .await
        .unwrap_err();

    assert!(matches!(err, UsageError::OutOfOrderEvent { .. }));
    assert_eq!(err.error_code(), "METERLINE_OUT_OF_ORDER_EVENT");
    assert!(context.history("vm-late").await[0].is_open());
}

#[tokio::test]
async fn test_unchanged_resize_after_ordering_check() {
    let context = TestContext::new();
    let vm = EntityId::new("vm-same");
    context.create_instance("vm-same", at(2, 0)).await;

    let err = context
        .controller
        .resize_instance(&vm, at(1, 0), "m1.small".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, UsageError::OutOfOrderEvent { .. }));

    let transition = context
        .controller
        .resize_instance(&vm, at(3, 0), "m1.small".to_string())
        .await
        .unwrap();
    assert!(matches!(transition, Transition::Unchanged(_)));
}

#[tokio::test]
async fn test_apply_validated_payload() {
    let context = TestContext::new();
    let event = LifecycleEvent::from_json(&serde_json::json!({
        "event": "instance.create",
        "entity_id": "vm-json",
        "tenant_id": TENANT,
        "date": "2024-05-01T06:00:00.000Z",
        "name": "json-vm",
        "flavor": "m1.medium",
        "os_type": "linux",
        "os_distro": "debian",
        "os_version": "12"
    }))
    .expect("payload should validate");

    let created = context.controller.apply(event).await.unwrap().into_record();
    assert_eq!(created.start, at(6, 0));
    assert_eq!(created.attributes.as_instance().unwrap().flavor, "m1.medium");
    assert!(context
        .controller
        .entity_exists(&EntityId::new("vm-json"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_recreate_cannot_overlap_previous_lifetime() {
    let context = TestContext::new();
    let vm = EntityId::new("vm-overlap");
    context.create_instance("vm-overlap", at(1, 0)).await;
    context.controller.delete(&vm, at(4, 0)).await.unwrap();

    let err = context
        .controller
        .create_instance(vm.clone(), TenantId::new(TENANT), at(3, 0), instance("vm-overlap"))
        .await
        .unwrap_err();

    assert!(matches!(err, UsageError::OutOfOrderEvent { .. }));
    assert_eq!(context.history("vm-overlap").await.len(), 1);
}
