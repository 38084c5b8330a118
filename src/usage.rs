use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiWindow {
    LastMinute,
    LastHour,
}

impl ApiWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiWindow::LastMinute => "last_minute",
            ApiWindow::LastHour => "last_hour",
        }
    }
}

/// key: usage-source -> collaborator boundary
///
/// Implemented by the surrounding application over whatever stores hold
/// student, storage and traffic data. Failures are arbitrary collaborator
/// errors; the meter folds them into `DataUnavailable`.
#[async_trait]
pub trait UsageDataSource: Send + Sync {
    async fn student_count(&self, tenant_id: Uuid) -> anyhow::Result<i64>;
    async fn user_count(&self, tenant_id: Uuid) -> anyhow::Result<i64>;
    async fn storage_usage_bytes(&self, tenant_id: Uuid) -> anyhow::Result<i64>;
    async fn api_call_count(&self, tenant_id: Uuid, window: ApiWindow) -> anyhow::Result<i64>;
    async fn database_size_bytes(&self, tenant_id: Uuid) -> anyhow::Result<i64>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub student_count: i64,
    pub user_count: i64,
    pub storage_bytes: i64,
    pub api_calls_last_minute: i64,
    pub api_calls_last_hour: i64,
    pub database_size_bytes: i64,
}

/// key: usage-meter -> pure consumption read
///
/// Computes a tenant's current consumption from collaborator sources.
/// Mutates nothing; a source failure means "skip this cycle", never
/// "usage is zero".
pub struct UsageMeter<S: UsageDataSource + ?Sized> {
    sources: std::sync::Arc<S>,
}

impl<S: UsageDataSource + ?Sized> UsageMeter<S> {
    pub fn new(sources: std::sync::Arc<S>) -> Self {
        Self { sources }
    }

    pub async fn compute_usage(&self, tenant_id: Uuid) -> EngineResult<UsageSnapshot> {
        let (
            student_count,
            user_count,
            storage_bytes,
            api_calls_last_minute,
            api_calls_last_hour,
            database_size_bytes,
        ) = tokio::try_join!(
            self.sources.student_count(tenant_id),
            self.sources.user_count(tenant_id),
            self.sources.storage_usage_bytes(tenant_id),
            self.sources.api_call_count(tenant_id, ApiWindow::LastMinute),
            self.sources.api_call_count(tenant_id, ApiWindow::LastHour),
            self.sources.database_size_bytes(tenant_id),
        )
        .map_err(|err| EngineError::DataUnavailable(err.to_string()))?;

        Ok(UsageSnapshot {
            student_count,
            user_count,
            storage_bytes,
            api_calls_last_minute,
            api_calls_last_hour,
            database_size_bytes,
        })
    }
}

/// key: usage-source-fixed -> stub implementation
///
/// Serves one fixed snapshot for every tenant. Test scaffolding and a
/// starting point for hosts that meter from a single table.
#[derive(Debug, Clone, Default)]
pub struct FixedUsageSource {
    pub snapshot: UsageSnapshot,
}

#[async_trait]
impl UsageDataSource for FixedUsageSource {
    async fn student_count(&self, _tenant_id: Uuid) -> anyhow::Result<i64> {
        Ok(self.snapshot.student_count)
    }

    async fn user_count(&self, _tenant_id: Uuid) -> anyhow::Result<i64> {
        Ok(self.snapshot.user_count)
    }

    async fn storage_usage_bytes(&self, _tenant_id: Uuid) -> anyhow::Result<i64> {
        Ok(self.snapshot.storage_bytes)
    }

    async fn api_call_count(&self, _tenant_id: Uuid, window: ApiWindow) -> anyhow::Result<i64> {
        Ok(match window {
            ApiWindow::LastMinute => self.snapshot.api_calls_last_minute,
            ApiWindow::LastHour => self.snapshot.api_calls_last_hour,
        })
    }

    async fn database_size_bytes(&self, _tenant_id: Uuid) -> anyhow::Result<i64> {
        Ok(self.snapshot.database_size_bytes)
    }
}
