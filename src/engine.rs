use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::error::EngineResult;
use crate::health::{HealthMonitor, MonitorOptions, SweepReport, TenantHealthMonitoring};
use crate::limits::{
    decide, default_caps_for_plan, LimitDecision, ResourceCaps, ResourceKind,
    ResourceLimitService, TenantResourceLimit,
};
use crate::plans::{PlanCatalog, SubscriptionPlan};
use crate::subscription::{
    ledger, CountUpdateOutcome, Pagination, SubscriptionBillingHistory, SubscriptionService,
    TenantLocks, TenantSubscription,
};
use crate::usage::UsageDataSource;

/// key: governance-engine -> in-process facade
///
/// The single entry point the surrounding admin application links against.
/// Every call takes an explicit tenant or entity id; the engine carries no
/// ambient tenant context.
#[derive(Clone)]
pub struct GovernanceEngine {
    pool: PgPool,
    sources: Arc<dyn UsageDataSource>,
    audit: Arc<dyn AuditSink>,
    locks: Arc<TenantLocks>,
    monitor_opts: MonitorOptions,
}

impl GovernanceEngine {
    pub fn new(
        pool: PgPool,
        sources: Arc<dyn UsageDataSource>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            pool,
            sources,
            audit,
            locks: Arc::new(TenantLocks::default()),
            monitor_opts: MonitorOptions::default(),
        }
    }

    pub fn with_monitor_options(mut self, opts: MonitorOptions) -> Self {
        self.monitor_opts = opts;
        self
    }

    fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(self.pool.clone(), self.locks.clone())
    }

    fn limits(&self) -> ResourceLimitService {
        ResourceLimitService::new(self.pool.clone())
    }

    fn monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.pool.clone(),
            self.sources.clone(),
            self.locks.clone(),
            self.monitor_opts.clone(),
        )
    }

    pub async fn get_subscription(
        &self,
        tenant_id: Uuid,
    ) -> EngineResult<(TenantSubscription, SubscriptionPlan)> {
        let catalog = PlanCatalog::load(&self.pool).await?;
        self.subscriptions().get_or_create(tenant_id, &catalog).await
    }

    pub async fn get_billing_history(
        &self,
        tenant_id: Uuid,
        pagination: Pagination,
    ) -> EngineResult<Vec<SubscriptionBillingHistory>> {
        let (subscription, _plan) = self.get_subscription(tenant_id).await?;
        ledger::list(&self.pool, subscription.id, pagination).await
    }

    pub async fn update_student_count(
        &self,
        tenant_id: Uuid,
        new_count: i64,
    ) -> EngineResult<CountUpdateOutcome> {
        let catalog = PlanCatalog::load(&self.pool).await?;
        let outcome = self
            .subscriptions()
            .update_student_count(tenant_id, new_count, &catalog)
            .await?;

        self.audit
            .record(
                "subscription.student_count_updated",
                json!({
                    "tenant_id": tenant_id,
                    "student_count": new_count,
                    "tier_changed": outcome.tier_changed,
                    "threshold_met": outcome.threshold_met,
                    "plan": outcome.new_plan.name,
                }),
            )
            .await;
        Ok(outcome)
    }

    pub async fn process_renewal(
        &self,
        subscription_id: Uuid,
    ) -> EngineResult<SubscriptionBillingHistory> {
        let entry = self.subscriptions().process_renewal(subscription_id).await?;
        self.audit
            .record(
                "subscription.renewed",
                json!({
                    "subscription_id": subscription_id,
                    "invoice_number": entry.invoice_number,
                    "amount_cents": entry.amount_cents,
                }),
            )
            .await;
        Ok(entry)
    }

    pub async fn mark_as_paid(
        &self,
        entry_id: Uuid,
        notes: Option<&str>,
    ) -> EngineResult<SubscriptionBillingHistory> {
        let entry = ledger::mark_paid(&self.pool, entry_id, notes).await?;
        self.audit
            .record(
                "ledger.marked_paid",
                json!({
                    "entry_id": entry_id,
                    "invoice_number": entry.invoice_number,
                }),
            )
            .await;
        Ok(entry)
    }

    /// Synchronous admit/deny against cached usage. The hot path does one
    /// SELECT plus a pure decision; lazy initialization only runs the first
    /// time a tenant shows up.
    pub async fn check_and_reserve(
        &self,
        tenant_id: Uuid,
        kind: ResourceKind,
        requested_delta: i64,
    ) -> EngineResult<LimitDecision> {
        let limits = self.limits();
        let row = match limits.find(tenant_id).await? {
            Some(row) => row,
            None => {
                let (_, plan) = self.get_subscription(tenant_id).await?;
                limits
                    .ensure_with_caps(tenant_id, &default_caps_for_plan(&plan))
                    .await?
            }
        };
        Ok(decide(&row, kind, requested_delta))
    }

    pub async fn get_resource_limits(&self, tenant_id: Uuid) -> EngineResult<TenantResourceLimit> {
        let limits = self.limits();
        match limits.find(tenant_id).await? {
            Some(row) => Ok(row),
            None => {
                let (_, plan) = self.get_subscription(tenant_id).await?;
                limits
                    .ensure_with_caps(tenant_id, &default_caps_for_plan(&plan))
                    .await
            }
        }
    }

    /// Administrative cap override.
    pub async fn update_resource_limits(
        &self,
        tenant_id: Uuid,
        caps: ResourceCaps,
    ) -> EngineResult<TenantResourceLimit> {
        let row = self.limits().update_caps(tenant_id, &caps).await?;
        self.audit
            .record(
                "limits.caps_updated",
                json!({ "tenant_id": tenant_id, "caps": caps }),
            )
            .await;
        Ok(row)
    }

    pub async fn get_health_status(
        &self,
        tenant_id: Uuid,
    ) -> EngineResult<Option<TenantHealthMonitoring>> {
        self.monitor().health_status(tenant_id).await
    }

    pub async fn clear_alerts(&self, tenant_id: Uuid) -> EngineResult<()> {
        self.monitor().clear_alerts(tenant_id).await?;
        self.audit
            .record("health.alerts_cleared", json!({ "tenant_id": tenant_id }))
            .await;
        Ok(())
    }

    pub async fn check_all_tenants_health(
        &self,
        now: DateTime<Utc>,
    ) -> EngineResult<SweepReport> {
        self.monitor().check_all_tenants(now).await
    }

    pub async fn suspend_subscription(&self, tenant_id: Uuid) -> EngineResult<TenantSubscription> {
        let subscription = self.subscriptions().suspend(tenant_id).await?;
        self.audit
            .record("subscription.suspended", json!({ "tenant_id": tenant_id }))
            .await;
        Ok(subscription)
    }

    pub async fn cancel_subscription(&self, tenant_id: Uuid) -> EngineResult<TenantSubscription> {
        let subscription = self.subscriptions().cancel(tenant_id).await?;
        self.audit
            .record("subscription.cancelled", json!({ "tenant_id": tenant_id }))
            .await;
        Ok(subscription)
    }

    /// The operator action behind the monitor's expiry-candidate flag.
    pub async fn mark_subscription_expired(
        &self,
        tenant_id: Uuid,
    ) -> EngineResult<TenantSubscription> {
        let subscription = self.subscriptions().mark_expired(tenant_id).await?;
        self.audit
            .record("subscription.expired", json!({ "tenant_id": tenant_id }))
            .await;
        Ok(subscription)
    }
}

impl std::fmt::Debug for GovernanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceEngine").finish_non_exhaustive()
    }
}
