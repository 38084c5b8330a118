use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tenancy_engine::{
    AlertKind, ApiWindow, GovernanceEngine, MonitorOptions, TracingAuditSink, UsageDataSource,
    UsageSnapshot,
};
use uuid::Uuid;

// key: health-tests -> fail-isolated sweep, alert lifecycle

const BYTES_PER_MB: i64 = 1024 * 1024;

/// Usage source with per-tenant behavior: healthy tenants answer, hanging
/// tenants never answer in time, failing tenants error outright.
struct SweepSource {
    snapshot: UsageSnapshot,
    hanging: HashSet<Uuid>,
    failing: HashSet<Uuid>,
}

impl SweepSource {
    async fn gate(&self, tenant_id: Uuid) -> anyhow::Result<()> {
        if self.hanging.contains(&tenant_id) {
            tokio::time::sleep(StdDuration::from_secs(5)).await;
        }
        if self.failing.contains(&tenant_id) {
            return Err(anyhow!("collaborator unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageDataSource for SweepSource {
    async fn student_count(&self, tenant_id: Uuid) -> anyhow::Result<i64> {
        self.gate(tenant_id).await?;
        Ok(self.snapshot.student_count)
    }

    async fn user_count(&self, tenant_id: Uuid) -> anyhow::Result<i64> {
        self.gate(tenant_id).await?;
        Ok(self.snapshot.user_count)
    }

    async fn storage_usage_bytes(&self, tenant_id: Uuid) -> anyhow::Result<i64> {
        self.gate(tenant_id).await?;
        Ok(self.snapshot.storage_bytes)
    }

    async fn api_call_count(&self, tenant_id: Uuid, window: ApiWindow) -> anyhow::Result<i64> {
        self.gate(tenant_id).await?;
        Ok(match window {
            ApiWindow::LastMinute => self.snapshot.api_calls_last_minute,
            ApiWindow::LastHour => self.snapshot.api_calls_last_hour,
        })
    }

    async fn database_size_bytes(&self, tenant_id: Uuid) -> anyhow::Result<i64> {
        self.gate(tenant_id).await?;
        Ok(self.snapshot.database_size_bytes)
    }
}

async fn seed_plans(pool: &PgPool) {
    sqlx::query(
        "INSERT INTO subscription_plans (id, name, sort_order, student_threshold, overage_unit_price_cents, monthly_price_cents) VALUES ($1, 'basic', 1, 100, 50, 4900)",
    )
    .bind(Uuid::new_v4())
    .execute(pool)
    .await
    .unwrap();
}

fn sweep_options() -> MonitorOptions {
    MonitorOptions {
        check_timeout: StdDuration::from_millis(250),
        concurrency: 4,
        renewal_warning_window: Duration::days(0),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn sweep_isolates_the_tenant_whose_meter_hangs(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_plans(&pool).await;

    let healthy_1 = Uuid::new_v4();
    let stuck = Uuid::new_v4();
    let healthy_2 = Uuid::new_v4();

    let source = SweepSource {
        snapshot: UsageSnapshot {
            student_count: 20,
            user_count: 4,
            storage_bytes: 100 * BYTES_PER_MB,
            api_calls_last_minute: 2,
            api_calls_last_hour: 40,
            database_size_bytes: 10 * BYTES_PER_MB,
        },
        hanging: HashSet::from([stuck]),
        failing: HashSet::new(),
    };
    let engine = GovernanceEngine::new(pool.clone(), Arc::new(source), Arc::new(TracingAuditSink))
        .with_monitor_options(sweep_options());

    for tenant_id in [healthy_1, stuck, healthy_2] {
        engine.get_subscription(tenant_id).await.unwrap();
        engine.get_resource_limits(tenant_id).await.unwrap();
    }

    // Give the stuck tenant a distinctive cached snapshot beforehand.
    sqlx::query(
        "UPDATE tenant_resource_limits SET current_storage_bytes = $2, usage_refreshed_at = $3 WHERE tenant_id = $1",
    )
    .bind(stuck)
    .bind(777 * BYTES_PER_MB)
    .bind(Utc::now() - Duration::hours(6))
    .execute(&pool)
    .await
    .unwrap();

    let report = engine.check_all_tenants_health(Utc::now()).await.unwrap();

    assert_eq!(report.processed.len(), 2);
    assert!(report.processed.contains(&healthy_1));
    assert!(report.processed.contains(&healthy_2));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].tenant_id, stuck);

    // The timed-out tenant's cached usage is untouched.
    let row = engine.get_resource_limits(stuck).await.unwrap();
    assert_eq!(row.current_storage_bytes, 777 * BYTES_PER_MB);

    // The healthy tenants were refreshed wholesale.
    let row = engine.get_resource_limits(healthy_1).await.unwrap();
    assert_eq!(row.current_storage_bytes, 100 * BYTES_PER_MB);

    // The failure left an error marker on the health row.
    let health = engine.get_health_status(stuck).await.unwrap().unwrap();
    assert!(health.last_error.is_some());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn over_capacity_usage_raises_alerts_until_cleared(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_plans(&pool).await;

    let tenant_id = Uuid::new_v4();
    // Basic plan defaults allow 25 users; 30 is over capacity.
    let source = SweepSource {
        snapshot: UsageSnapshot {
            student_count: 20,
            user_count: 30,
            storage_bytes: 100 * BYTES_PER_MB,
            api_calls_last_minute: 2,
            api_calls_last_hour: 40,
            database_size_bytes: 10 * BYTES_PER_MB,
        },
        hanging: HashSet::new(),
        failing: HashSet::new(),
    };
    let engine = GovernanceEngine::new(pool.clone(), Arc::new(source), Arc::new(TracingAuditSink))
        .with_monitor_options(sweep_options());
    engine.get_subscription(tenant_id).await.unwrap();

    engine.check_all_tenants_health(Utc::now()).await.unwrap();

    let health = engine.get_health_status(tenant_id).await.unwrap().unwrap();
    assert!(health.last_error.is_none());
    assert_eq!(health.user_count, 30);
    let alerts = health.alerts();
    assert!(alerts
        .iter()
        .any(|alert| alert.kind == AlertKind::UserLimitExceeded));

    // Alerts accumulate across sweeps until an operator clears them.
    engine.check_all_tenants_health(Utc::now()).await.unwrap();
    let health = engine.get_health_status(tenant_id).await.unwrap().unwrap();
    assert!(health.alerts().len() > alerts.len());

    engine.clear_alerts(tenant_id).await.unwrap();
    let health = engine.get_health_status(tenant_id).await.unwrap().unwrap();
    assert!(health.alerts().is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unreachable_source_defers_and_reports_the_tenant(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_plans(&pool).await;

    let tenant_id = Uuid::new_v4();
    let source = SweepSource {
        snapshot: UsageSnapshot::default(),
        hanging: HashSet::new(),
        failing: HashSet::from([tenant_id]),
    };
    let engine = GovernanceEngine::new(pool.clone(), Arc::new(source), Arc::new(TracingAuditSink))
        .with_monitor_options(sweep_options());
    engine.get_subscription(tenant_id).await.unwrap();

    let report = engine.check_all_tenants_health(Utc::now()).await.unwrap();
    assert!(report.processed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].reason.contains("unavailable"));
}
