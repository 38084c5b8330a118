use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tenancy_engine::{
    FixedUsageSource, GovernanceEngine, LimitDecision, ResourceCaps, ResourceKind,
    TracingAuditSink, UsageSnapshot,
};
use uuid::Uuid;

// key: limits-tests -> lazy defaults, admin overrides, cached denials

const BYTES_PER_MB: i64 = 1024 * 1024;

async fn seed_plans(pool: &PgPool) {
    for (name, sort_order, threshold, monthly_cents) in [
        ("basic", 1, 100, 4_900_i64),
        ("standard", 2, 300, 14_900),
    ] {
        sqlx::query(
            "INSERT INTO subscription_plans (id, name, sort_order, student_threshold, overage_unit_price_cents, monthly_price_cents) VALUES ($1, $2, $3, $4, 50, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(sort_order)
        .bind(threshold)
        .bind(monthly_cents)
        .execute(pool)
        .await
        .unwrap();
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn limits_initialize_lazily_from_the_tenant_plan(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_plans(&pool).await;

    let engine = GovernanceEngine::new(
        pool.clone(),
        Arc::new(FixedUsageSource::default()),
        Arc::new(TracingAuditSink),
    );
    let tenant_id = Uuid::new_v4();

    let row = engine.get_resource_limits(tenant_id).await.unwrap();
    // Basic plan, threshold 100: 50 MB per seat, one user per four seats.
    assert_eq!(row.max_storage_mb, 5_000);
    assert_eq!(row.max_users, 25);
    assert_eq!(row.max_students, None);
    assert!(row.usage_refreshed_at.is_none(), "no snapshot cached yet");

    // First check decides on zeroes and admits.
    let decision = engine
        .check_and_reserve(tenant_id, ResourceKind::Storage, 100)
        .await
        .unwrap();
    assert_eq!(decision, LimitDecision::Allow);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn denial_reports_the_cached_values_behind_it(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_plans(&pool).await;

    let snapshot = UsageSnapshot {
        student_count: 80,
        user_count: 10,
        storage_bytes: 950 * BYTES_PER_MB,
        api_calls_last_minute: 5,
        api_calls_last_hour: 50,
        database_size_bytes: 100 * BYTES_PER_MB,
    };
    let engine = GovernanceEngine::new(
        pool.clone(),
        Arc::new(FixedUsageSource { snapshot }),
        Arc::new(TracingAuditSink),
    );
    let tenant_id = Uuid::new_v4();

    engine
        .update_resource_limits(
            tenant_id,
            ResourceCaps {
                max_storage_mb: 1_000,
                max_users: 25,
                max_students: None,
                api_rate_limit_per_minute: 120,
                api_rate_limit_per_hour: 2_400,
                max_database_size_mb: 500,
            },
        )
        .await
        .unwrap();
    engine.get_subscription(tenant_id).await.unwrap();

    // The monitor refreshes the cache; the hot path then reads it.
    let report = engine.check_all_tenants_health(Utc::now()).await.unwrap();
    assert!(report.failed.is_empty());

    let decision = engine
        .check_and_reserve(tenant_id, ResourceKind::Storage, 100)
        .await
        .unwrap();
    assert_eq!(
        decision,
        LimitDecision::Deny {
            kind: ResourceKind::Storage,
            current: 950,
            limit: 1_000,
        }
    );

    // A smaller reservation still fits under the cap.
    let decision = engine
        .check_and_reserve(tenant_id, ResourceKind::Storage, 50)
        .await
        .unwrap();
    assert_eq!(decision, LimitDecision::Allow);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refresh_replaces_every_cached_column_at_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_plans(&pool).await;

    let snapshot = UsageSnapshot {
        student_count: 42,
        user_count: 7,
        storage_bytes: 10 * BYTES_PER_MB,
        api_calls_last_minute: 3,
        api_calls_last_hour: 33,
        database_size_bytes: 5 * BYTES_PER_MB,
    };
    let engine = GovernanceEngine::new(
        pool.clone(),
        Arc::new(FixedUsageSource { snapshot }),
        Arc::new(TracingAuditSink),
    );
    let tenant_id = Uuid::new_v4();
    engine.get_subscription(tenant_id).await.unwrap();

    engine.check_all_tenants_health(Utc::now()).await.unwrap();

    let row = engine.get_resource_limits(tenant_id).await.unwrap();
    assert_eq!(row.current_student_count, 42);
    assert_eq!(row.current_user_count, 7);
    assert_eq!(row.current_storage_bytes, 10 * BYTES_PER_MB);
    assert_eq!(row.current_api_calls_minute, 3);
    assert_eq!(row.current_api_calls_hour, 33);
    assert_eq!(row.current_database_size_bytes, 5 * BYTES_PER_MB);
    assert!(row.usage_refreshed_at.is_some());
}
