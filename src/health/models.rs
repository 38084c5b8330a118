use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Alerts kept per tenant before the oldest fall off the front.
pub const MAX_ALERTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StorageCapExceeded,
    StorageHighWatermark,
    UserLimitExceeded,
    StudentLimitExceeded,
    ApiRateExceeded,
    DatabaseSizeExceeded,
    RenewalDue,
    RenewalOverdue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// key: health-model -> last-computed indicators + bounded alert list
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TenantHealthMonitoring {
    pub tenant_id: Uuid,
    pub storage_usage_percent: Option<f64>,
    pub student_count: i64,
    pub student_limit: Option<i32>,
    pub user_count: i64,
    pub user_limit: Option<i32>,
    pub last_error: Option<String>,
    pub alerts: Value,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantHealthMonitoring {
    pub fn alerts(&self) -> Vec<HealthAlert> {
        serde_json::from_value(self.alerts.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub tenant_id: Uuid,
    pub reason: String,
}

/// Outcome of one full sweep. Failures are collected, never fatal to the
/// remaining tenants.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub processed: Vec<Uuid>,
    pub failed: Vec<SweepFailure>,
}
