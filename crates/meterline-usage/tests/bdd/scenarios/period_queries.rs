use crate::{at, instance, TestContext, TENANT};
use chrono::Duration;
use meterline_usage::domain::{EntityId, EntityType, TenantId};
use meterline_usage::UsageError;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;

async fn seeded() -> TestContext {
    let context = TestContext::new();
    context.create_instance("vm-a", at(1, 0)).await;
    context
        .controller
        .resize_instance(&EntityId::new("vm-a"), at(3, 0), "m1.large".to_string())
        .await
        .unwrap();
    context
        .controller
        .delete(&EntityId::new("vm-a"), at(5, 0))
        .await
        .unwrap();

    context.create_volume("vol-a", at(2, 0), 30).await;

    context
        .controller
        .create_instance(
            EntityId::new("vm-other"),
            TenantId::new("someone-else"),
            at(1, 0),
            instance("vm-other"),
        )
        .await
        .unwrap();

    context.clock.set(at(8, 0));
    context
}

fn summary(periods: &[meterline_usage::domain::ActivePeriod]) -> Vec<(String, u32)> {
    periods
        .iter()
        .map(|p| {
            (
                p.period.entity_id.to_string(),
                chrono::Timelike::hour(&p.period.start),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_range_returns_overlapping_periods_in_start_order() {
    let context = seeded().await;

    let periods = context
        .queries
        .list_periods(&TenantId::new(TENANT), at(0, 0), at(12, 0), None)
        .await
        .unwrap();

    assert_eq!(
        summary(&periods),
        vec![
            ("vm-a".to_string(), 1),
            ("vol-a".to_string(), 2),
            ("vm-a".to_string(), 3),
        ]
    );
}

#[tokio::test]
async fn test_range_boundaries_are_half_open() {
    let context = seeded().await;

    let periods = context
        .queries
        .list_instances(&TenantId::new(TENANT), at(3, 0), at(5, 0))
        .await
        .unwrap();
    assert_eq!(summary(&periods), vec![("vm-a".to_string(), 3)]);

    let periods = context
        .queries
        .list_instances(&TenantId::new(TENANT), at(5, 0), at(6, 0))
        .await
        .unwrap();
    assert!(periods.is_empty());
}

#[tokio::test]
async fn test_open_volume_is_measured_up_to_now() {
    let context = seeded().await;

    let volumes = context
        .queries
        .list_volumes(&TenantId::new(TENANT), at(0, 0), at(12, 0))
        .await
        .unwrap();

    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].effective_end, at(8, 0));
    assert_eq!(volumes[0].billable_hours(), Decimal::from(6));
    assert!(volumes[0].period.is_open());
    assert!(context.history("vol-a").await[0].is_open());

    context.clock.advance(Duration::minutes(30));
    let volumes = context
        .queries
        .list_periods(
            &TenantId::new(TENANT),
            at(0, 0),
            at(12, 0),
            Some(EntityType::Volume),
        )
        .await
        .unwrap();
    assert_eq!(volumes[0].billable_hours(), Decimal::new(65, 1));
}

#[tokio::test]
async fn test_visible_duration_is_clipped_to_range() {
    let context = seeded().await;

    let periods = context
        .queries
        .list_instances(&TenantId::new(TENANT), at(2, 0), at(4, 0))
        .await
        .unwrap();

    let hours: Vec<Decimal> = periods.iter().map(|p| p.billable_hours()).collect();
    assert_eq!(hours, vec![Decimal::from(1), Decimal::from(1)]);
}

#[tokio::test]
async fn test_other_tenants_are_not_visible() {
    let context = seeded().await;

    let periods = context
        .queries
        .list_periods(&TenantId::new("someone-else"), at(0, 0), at(12, 0), None)
        .await
        .unwrap();
    assert_eq!(summary(&periods), vec![("vm-other".to_string(), 1)]);
}

#[tokio::test]
async fn test_inverted_range_is_invalid() {
    let context = seeded().await;
    let err = context
        .queries
        .list_periods(&TenantId::new(TENANT), at(6, 0), at(2, 0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UsageError::InvalidInterval { .. }));
}
