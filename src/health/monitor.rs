use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;
use crate::error::{EngineError, EngineResult};
use crate::limits::{
    decide, default_caps_for_plan, LimitDecision, ResourceKind, ResourceLimitService,
    TenantResourceLimit, UsageRefresh,
};
use crate::plans::PlanCatalog;
use crate::subscription::{SubscriptionService, SubscriptionStatus, TenantLocks, TenantSubscription};
use crate::usage::{UsageDataSource, UsageMeter};

use super::models::{
    AlertKind, HealthAlert, SweepFailure, SweepReport, TenantHealthMonitoring, MAX_ALERTS,
};

const BYTES_PER_MB: i64 = 1024 * 1024;

/// Sweep knobs. Defaults come from the environment; tests pin their own.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub check_timeout: StdDuration,
    pub concurrency: usize,
    pub renewal_warning_window: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            check_timeout: StdDuration::from_secs(*config::HEALTH_CHECK_TIMEOUT_SECS),
            concurrency: *config::HEALTH_SWEEP_CONCURRENCY,
            renewal_warning_window: Duration::days(*config::RENEWAL_WARNING_WINDOW_DAYS),
        }
    }
}

/// key: health-monitor -> periodic usage + limit + schedule review
pub struct HealthMonitor {
    pool: PgPool,
    sources: Arc<dyn UsageDataSource>,
    locks: Arc<TenantLocks>,
    opts: MonitorOptions,
}

impl HealthMonitor {
    pub fn new(
        pool: PgPool,
        sources: Arc<dyn UsageDataSource>,
        locks: Arc<TenantLocks>,
        opts: MonitorOptions,
    ) -> Self {
        Self {
            pool,
            sources,
            locks,
            opts,
        }
    }

    /// Sweep every non-cancelled tenant with a bounded worker pool. One
    /// tenant's failure is recorded and the sweep moves on.
    pub async fn check_all_tenants(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let catalog = PlanCatalog::load(&self.pool).await?;
        let tenants: Vec<Uuid> = sqlx::query_scalar(
            "SELECT tenant_id FROM tenant_subscriptions WHERE status <> 'cancelled' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let catalog_ref = &catalog;
        let results: Vec<(Uuid, EngineResult<()>)> = stream::iter(tenants.into_iter().map(
            |tenant_id| async move {
                (tenant_id, self.check_tenant(catalog_ref, tenant_id, now).await)
            },
        ))
        .buffer_unordered(self.opts.concurrency.max(1))
        .collect()
        .await;

        let mut report = SweepReport::default();
        for (tenant_id, outcome) in results {
            match outcome {
                Ok(()) => report.processed.push(tenant_id),
                Err(err) => {
                    tracing::warn!(%tenant_id, ?err, "tenant health check failed");
                    report.failed.push(SweepFailure {
                        tenant_id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            processed = report.processed.len(),
            failed = report.failed.len(),
            "tenant health sweep finished"
        );
        Ok(report)
    }

    /// One tenant: refresh cached usage (bounded by the check timeout,
    /// timeout handled exactly like an unreachable source), then compare
    /// caps and the billing schedule and store the resulting indicators.
    pub async fn check_tenant(
        &self,
        catalog: &PlanCatalog,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let subscriptions = SubscriptionService::new(self.pool.clone(), self.locks.clone());
        let (subscription, plan) = subscriptions.get_or_create(tenant_id, catalog).await?;

        let limits = ResourceLimitService::new(self.pool.clone());
        limits
            .ensure_with_caps(tenant_id, &default_caps_for_plan(&plan))
            .await?;

        let meter = UsageMeter::new(self.sources.clone());
        let refresh = tokio::time::timeout(
            self.opts.check_timeout,
            limits.refresh_usage(tenant_id, &meter),
        )
        .await;

        let outcome = match refresh {
            Ok(result) => result?,
            Err(_) => UsageRefresh::Deferred {
                reason: "usage meter timed out".to_string(),
            },
        };

        if let UsageRefresh::Deferred { reason } = outcome {
            self.record_failure(tenant_id, &reason, now).await?;
            return Err(EngineError::DataUnavailable(reason));
        }

        let row = limits
            .find(tenant_id)
            .await?
            .ok_or(EngineError::Database(sqlx::Error::RowNotFound))?;

        let alerts = evaluate_alerts(&row, &subscription, self.opts.renewal_warning_window, now);
        self.store_indicators(&row, alerts, now).await?;
        Ok(())
    }

    /// Operator action; alerts never clear themselves.
    pub async fn clear_alerts(&self, tenant_id: Uuid) -> EngineResult<()> {
        sqlx::query(
            "UPDATE tenant_health_monitoring SET alerts = '[]'::jsonb, updated_at = NOW() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        tracing::info!(%tenant_id, "health alerts cleared");
        Ok(())
    }

    pub async fn health_status(
        &self,
        tenant_id: Uuid,
    ) -> EngineResult<Option<TenantHealthMonitoring>> {
        let row = sqlx::query_as::<_, TenantHealthMonitoring>(
            "SELECT * FROM tenant_health_monitoring WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn store_indicators(
        &self,
        row: &TenantResourceLimit,
        new_alerts: Vec<HealthAlert>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let existing = self.health_status(row.tenant_id).await?;
        let mut alerts = existing.map(|h| h.alerts()).unwrap_or_default();
        alerts.extend(new_alerts);
        if alerts.len() > MAX_ALERTS {
            alerts.drain(..alerts.len() - MAX_ALERTS);
        }
        let alerts =
            serde_json::to_value(&alerts).unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));

        let storage_percent = storage_usage_percent(row);
        sqlx::query(
            r#"
            INSERT INTO tenant_health_monitoring (
                tenant_id,
                storage_usage_percent,
                student_count,
                student_limit,
                user_count,
                user_limit,
                last_error,
                alerts,
                last_checked_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8)
            ON CONFLICT (tenant_id)
            DO UPDATE SET
                storage_usage_percent = EXCLUDED.storage_usage_percent,
                student_count = EXCLUDED.student_count,
                student_limit = EXCLUDED.student_limit,
                user_count = EXCLUDED.user_count,
                user_limit = EXCLUDED.user_limit,
                last_error = NULL,
                alerts = EXCLUDED.alerts,
                last_checked_at = EXCLUDED.last_checked_at,
                updated_at = NOW()
            "#,
        )
        .bind(row.tenant_id)
        .bind(storage_percent)
        .bind(row.current_student_count)
        .bind(row.max_students)
        .bind(row.current_user_count)
        .bind(row.max_users)
        .bind(alerts)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A failed check leaves cached usage and alerts untouched; only the
    /// error marker and the check timestamp move.
    async fn record_failure(
        &self,
        tenant_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_health_monitoring (tenant_id, last_error, last_checked_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id)
            DO UPDATE SET
                last_error = EXCLUDED.last_error,
                last_checked_at = EXCLUDED.last_checked_at,
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn storage_usage_percent(row: &TenantResourceLimit) -> Option<f64> {
    if row.max_storage_mb <= 0 {
        return None;
    }
    let used_mb = row.current_storage_bytes as f64 / BYTES_PER_MB as f64;
    Some(used_mb / row.max_storage_mb as f64 * 100.0)
}

/// Compare the cached usage against every cap and the billing schedule.
pub(crate) fn evaluate_alerts(
    row: &TenantResourceLimit,
    subscription: &TenantSubscription,
    warning_window: Duration,
    now: DateTime<Utc>,
) -> Vec<HealthAlert> {
    let mut alerts = Vec::new();

    let cap_checks = [
        (ResourceKind::Storage, AlertKind::StorageCapExceeded),
        (ResourceKind::Users, AlertKind::UserLimitExceeded),
        (ResourceKind::Students, AlertKind::StudentLimitExceeded),
        (ResourceKind::ApiRatePerMinute, AlertKind::ApiRateExceeded),
        (ResourceKind::ApiRatePerHour, AlertKind::ApiRateExceeded),
        (ResourceKind::DatabaseSize, AlertKind::DatabaseSizeExceeded),
    ];
    for (resource, alert_kind) in cap_checks {
        if let LimitDecision::Deny {
            kind,
            current,
            limit,
        } = decide(row, resource, 0)
        {
            alerts.push(HealthAlert {
                kind: alert_kind,
                message: format!(
                    "{} over capacity: {current} of {limit}",
                    kind.as_str()
                ),
                raised_at: now,
            });
        }
    }

    if let Some(percent) = storage_usage_percent(row) {
        if percent >= 90.0 && percent <= 100.0 {
            alerts.push(HealthAlert {
                kind: AlertKind::StorageHighWatermark,
                message: format!("storage at {percent:.1}% of cap"),
                raised_at: now,
            });
        }
    }

    if subscription.status != SubscriptionStatus::Cancelled {
        if subscription.next_billing_date < now && !subscription.is_paid {
            // Expiry candidate; flagged only, never auto-expired.
            alerts.push(HealthAlert {
                kind: AlertKind::RenewalOverdue,
                message: format!(
                    "renewal overdue since {}; subscription is an expiry candidate",
                    subscription.next_billing_date.format("%Y-%m-%d")
                ),
                raised_at: now,
            });
        } else if subscription.next_billing_date - now <= warning_window {
            alerts.push(HealthAlert {
                kind: AlertKind::RenewalDue,
                message: format!(
                    "renewal due {}",
                    subscription.next_billing_date.format("%Y-%m-%d")
                ),
                raised_at: now,
            });
        }
    }

    alerts
}
