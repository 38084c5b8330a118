use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::config;
use crate::error::{EngineError, EngineResult};
use crate::plans::SubscriptionPlan;
use crate::usage::{UsageDataSource, UsageMeter, UsageSnapshot};

const BYTES_PER_MB: i64 = 1024 * 1024;

/// key: limits-kinds -> closed set of enforceable resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Storage,
    Users,
    Students,
    ApiRatePerMinute,
    ApiRatePerHour,
    DatabaseSize,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Storage => "storage",
            ResourceKind::Users => "users",
            ResourceKind::Students => "students",
            ResourceKind::ApiRatePerMinute => "api_rate_per_minute",
            ResourceKind::ApiRatePerHour => "api_rate_per_hour",
            ResourceKind::DatabaseSize => "database_size",
        }
    }
}

/// key: limits-model -> per-tenant hard caps + cached usage
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TenantResourceLimit {
    pub tenant_id: Uuid,
    pub max_storage_mb: i64,
    pub max_users: i32,
    pub max_students: Option<i32>,
    pub api_rate_limit_per_minute: i32,
    pub api_rate_limit_per_hour: i32,
    pub max_database_size_mb: i64,
    pub current_student_count: i64,
    pub current_user_count: i64,
    pub current_storage_bytes: i64,
    pub current_api_calls_minute: i64,
    pub current_api_calls_hour: i64,
    pub current_database_size_bytes: i64,
    pub usage_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cap columns only; the shape taken by administrative overrides and by
/// lazy initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub max_storage_mb: i64,
    pub max_users: i32,
    pub max_students: Option<i32>,
    pub api_rate_limit_per_minute: i32,
    pub api_rate_limit_per_hour: i32,
    pub max_database_size_mb: i64,
}

/// Default caps scale with the plan's included-student threshold. Student
/// count itself is governed by plan billing, so the hard student cap stays
/// unlimited unless an operator sets one.
pub fn default_caps_for_plan(plan: &SubscriptionPlan) -> ResourceCaps {
    let seats = i64::from(plan.student_threshold.max(1));
    let per_minute = seats.clamp(60, 10_000) as i32;
    ResourceCaps {
        max_storage_mb: seats * 50,
        max_users: (seats / 4).max(10) as i32,
        max_students: None,
        api_rate_limit_per_minute: per_minute,
        api_rate_limit_per_hour: per_minute * 20,
        max_database_size_mb: seats * 20,
    }
}

/// Outcome of a cap check. Denial is advisory: the enforcer never rolls
/// anything back, the caller must simply not perform the operation.
/// `current` and `limit` are reported in the cap's unit (MB for the storage
/// kinds, plain counts otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum LimitDecision {
    Allow,
    Deny {
        kind: ResourceKind,
        current: i64,
        limit: i64,
    },
}

/// Result of a cache refresh. `Deferred` means the meter was unreachable;
/// the previously cached values stay authoritative.
#[derive(Debug, Clone)]
pub enum UsageRefresh {
    Refreshed(UsageSnapshot),
    Deferred { reason: String },
}

/// key: limits-enforcer -> admit/deny on cached usage
#[derive(Clone)]
pub struct ResourceLimitService {
    pool: PgPool,
}

impl ResourceLimitService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, tenant_id: Uuid) -> EngineResult<Option<TenantResourceLimit>> {
        let row = sqlx::query_as::<_, TenantResourceLimit>(
            "SELECT * FROM tenant_resource_limits WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Create the row with the given caps unless it already exists.
    pub async fn ensure_with_caps(
        &self,
        tenant_id: Uuid,
        caps: &ResourceCaps,
    ) -> EngineResult<TenantResourceLimit> {
        sqlx::query(
            r#"
            INSERT INTO tenant_resource_limits (
                tenant_id,
                max_storage_mb,
                max_users,
                max_students,
                api_rate_limit_per_minute,
                api_rate_limit_per_hour,
                max_database_size_mb
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(caps.max_storage_mb)
        .bind(caps.max_users)
        .bind(caps.max_students)
        .bind(caps.api_rate_limit_per_minute)
        .bind(caps.api_rate_limit_per_hour)
        .bind(caps.max_database_size_mb)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, TenantResourceLimit>(
            "SELECT * FROM tenant_resource_limits WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Administrative cap override. Touches cap columns only; cached usage
    /// is the Health Monitor's to maintain.
    pub async fn update_caps(
        &self,
        tenant_id: Uuid,
        caps: &ResourceCaps,
    ) -> EngineResult<TenantResourceLimit> {
        let row = sqlx::query_as::<_, TenantResourceLimit>(
            r#"
            INSERT INTO tenant_resource_limits (
                tenant_id,
                max_storage_mb,
                max_users,
                max_students,
                api_rate_limit_per_minute,
                api_rate_limit_per_hour,
                max_database_size_mb
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id)
            DO UPDATE SET
                max_storage_mb = EXCLUDED.max_storage_mb,
                max_users = EXCLUDED.max_users,
                max_students = EXCLUDED.max_students,
                api_rate_limit_per_minute = EXCLUDED.api_rate_limit_per_minute,
                api_rate_limit_per_hour = EXCLUDED.api_rate_limit_per_hour,
                max_database_size_mb = EXCLUDED.max_database_size_mb,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(caps.max_storage_mb)
        .bind(caps.max_users)
        .bind(caps.max_students)
        .bind(caps.api_rate_limit_per_minute)
        .bind(caps.api_rate_limit_per_hour)
        .bind(caps.max_database_size_mb)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Replace every cached usage column in one statement. Wholesale, never
    /// per-field, so a partially applied snapshot can never be observed.
    pub async fn refresh_usage<S: UsageDataSource + ?Sized>(
        &self,
        tenant_id: Uuid,
        meter: &UsageMeter<S>,
    ) -> EngineResult<UsageRefresh> {
        let snapshot = match meter.compute_usage(tenant_id).await {
            Ok(snapshot) => snapshot,
            Err(EngineError::DataUnavailable(reason)) => {
                tracing::warn!(
                    %tenant_id,
                    %reason,
                    "usage refresh deferred; cached values remain authoritative"
                );
                return Ok(UsageRefresh::Deferred { reason });
            }
            Err(err) => return Err(err),
        };

        sqlx::query(
            r#"
            UPDATE tenant_resource_limits
            SET
                current_student_count = $2,
                current_user_count = $3,
                current_storage_bytes = $4,
                current_api_calls_minute = $5,
                current_api_calls_hour = $6,
                current_database_size_bytes = $7,
                usage_refreshed_at = NOW(),
                updated_at = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .bind(snapshot.student_count)
        .bind(snapshot.user_count)
        .bind(snapshot.storage_bytes)
        .bind(snapshot.api_calls_last_minute)
        .bind(snapshot.api_calls_last_hour)
        .bind(snapshot.database_size_bytes)
        .execute(&self.pool)
        .await?;

        Ok(UsageRefresh::Refreshed(snapshot))
    }
}

/// Decide admit/deny from the cached usage columns alone. The hot path
/// never recomputes usage; a stale cache is logged and still used, the
/// monitor owns bringing it forward.
pub fn decide(row: &TenantResourceLimit, kind: ResourceKind, requested_delta: i64) -> LimitDecision {
    let staleness = Duration::minutes(*config::USAGE_STALENESS_WINDOW_MINUTES);
    match row.usage_refreshed_at {
        Some(refreshed_at) if Utc::now() - refreshed_at > staleness => {
            tracing::debug!(
                tenant_id = %row.tenant_id,
                ?refreshed_at,
                "cached usage older than staleness window; deciding on it anyway"
            );
        }
        None => {
            tracing::debug!(
                tenant_id = %row.tenant_id,
                "no usage snapshot cached yet; deciding on zeroes"
            );
        }
        _ => {}
    }

    let (current, limit) = match kind {
        ResourceKind::Storage => (row.current_storage_bytes / BYTES_PER_MB, row.max_storage_mb),
        ResourceKind::DatabaseSize => (
            row.current_database_size_bytes / BYTES_PER_MB,
            row.max_database_size_mb,
        ),
        ResourceKind::Users => (row.current_user_count, i64::from(row.max_users)),
        ResourceKind::Students => match row.max_students {
            Some(max) => (row.current_student_count, i64::from(max)),
            None => return LimitDecision::Allow,
        },
        ResourceKind::ApiRatePerMinute => (
            row.current_api_calls_minute,
            i64::from(row.api_rate_limit_per_minute),
        ),
        ResourceKind::ApiRatePerHour => (
            row.current_api_calls_hour,
            i64::from(row.api_rate_limit_per_hour),
        ),
    };

    if current + requested_delta > limit {
        LimitDecision::Deny {
            kind,
            current,
            limit,
        }
    } else {
        LimitDecision::Allow
    }
}
