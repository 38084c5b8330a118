use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use dashmap::DashMap;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::plans::{resolve_plan, PlanCatalog, SubscriptionPlan};

use super::ledger;
use super::models::{
    BillingReason, CountUpdateOutcome, SubscriptionBillingHistory, SubscriptionStatus,
    TenantSubscription,
};

/// key: tenant-locks -> per-tenant mutual exclusion
///
/// Every subscription-state mutation runs inside the owning tenant's lock,
/// so concurrent count updates for one tenant serialize instead of racing
/// to append conflicting ledger entries. Tenants never contend with each
/// other.
#[derive(Default)]
pub struct TenantLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl TenantLocks {
    pub fn lock_for(&self, tenant_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub(crate) enum CountAction {
    ChangePlan,
    ChargeOverage { units_over: i64 },
    Record,
}

/// Plan change supersedes a same-plan overage: the two branches are
/// mutually exclusive by construction. Overage fires on the crossing only
/// (previous count at or under the threshold, new count above), so
/// re-reporting an already-over count never re-charges.
pub(crate) fn resolve_count_update(
    current: &SubscriptionPlan,
    eligible: &SubscriptionPlan,
    previous_count: i64,
    new_count: i64,
) -> CountAction {
    if eligible.id != current.id {
        return CountAction::ChangePlan;
    }
    let threshold = i64::from(current.student_threshold);
    if previous_count <= threshold && new_count > threshold {
        CountAction::ChargeOverage {
            units_over: new_count - threshold,
        }
    } else {
        CountAction::Record
    }
}

/// Positive monthly price difference prorated over the days left in the
/// current period. Downgrades charge nothing; the ledger carries charges,
/// not credits.
pub(crate) fn prorated_plan_change_cents(
    current_price_cents: i64,
    new_price_cents: i64,
    now: DateTime<Utc>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> i64 {
    let diff = new_price_cents - current_price_cents;
    if diff <= 0 {
        return 0;
    }
    let total_days = (period_end - period_start).num_days().max(1);
    let remaining_days = (period_end - now).num_days().clamp(0, total_days);
    diff * remaining_days / total_days
}

/// Periods advance anchored at their own end, one month at a time, so a
/// renewal processed early keeps the billing calendar aligned.
pub(crate) fn next_period(
    period_end: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let new_end = period_end
        .checked_add_months(Months::new(1))
        .unwrap_or(period_end);
    (period_end, new_end)
}

/// key: subscription-service -> the state machine
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    locks: Arc<TenantLocks>,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, locks: Arc<TenantLocks>) -> Self {
        Self { pool, locks }
    }

    pub async fn find_by_tenant(
        &self,
        tenant_id: Uuid,
    ) -> EngineResult<Option<TenantSubscription>> {
        let row = sqlx::query_as::<_, TenantSubscription>(
            "SELECT * FROM tenant_subscriptions WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_id(&self, subscription_id: Uuid) -> EngineResult<TenantSubscription> {
        sqlx::query_as::<_, TenantSubscription>(
            "SELECT * FROM tenant_subscriptions WHERE id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::SubscriptionNotFound(subscription_id))
    }

    /// Fetch the tenant's subscription, provisioning it on first access:
    /// active, on the cheapest tier, period `[now, now + 1 month)`, unpaid.
    pub async fn get_or_create(
        &self,
        tenant_id: Uuid,
        catalog: &PlanCatalog,
    ) -> EngineResult<(TenantSubscription, SubscriptionPlan)> {
        if let Some(subscription) = self.find_by_tenant(tenant_id).await? {
            let plan = resolve_plan(&self.pool, subscription.plan_id).await?;
            return Ok((subscription, plan));
        }

        let lock = self.locks.lock_for(tenant_id);
        let _guard = lock.lock().await;
        self.get_or_create_locked(tenant_id, catalog).await
    }

    /// Provisioning body; the caller already holds the tenant's lock.
    async fn get_or_create_locked(
        &self,
        tenant_id: Uuid,
        catalog: &PlanCatalog,
    ) -> EngineResult<(TenantSubscription, SubscriptionPlan)> {
        // Re-check under the lock; another caller may have provisioned.
        if let Some(subscription) = self.find_by_tenant(tenant_id).await? {
            let plan = resolve_plan(&self.pool, subscription.plan_id).await?;
            return Ok((subscription, plan));
        }

        let plan = catalog.entry_plan()?.clone();
        let now = Utc::now();
        let period_end = now.checked_add_months(Months::new(1)).unwrap_or(now);

        sqlx::query(
            r#"
            INSERT INTO tenant_subscriptions (
                id,
                tenant_id,
                plan_id,
                status,
                current_period_start,
                current_period_end,
                current_billing_amount_cents,
                is_paid,
                next_billing_date
            ) VALUES ($1, $2, $3, 'active', $4, $5, $6, FALSE, $5)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(plan.id)
        .bind(now)
        .bind(period_end)
        .bind(plan.monthly_price_cents)
        .execute(&self.pool)
        .await?;

        tracing::info!(%tenant_id, plan = %plan.name, "provisioned subscription lazily");

        let subscription = self
            .find_by_tenant(tenant_id)
            .await?
            .ok_or(EngineError::SubscriptionNotFound(tenant_id))?;
        Ok((subscription, plan))
    }

    /// Re-tier a tenant after its student count moved. At most one ledger
    /// entry is appended: a prorated plan-change charge when the eligible
    /// tier differs, otherwise an overage charge when the count crossed the
    /// current plan's included threshold. State update and ledger append
    /// commit together.
    pub async fn update_student_count(
        &self,
        tenant_id: Uuid,
        new_count: i64,
        catalog: &PlanCatalog,
    ) -> EngineResult<CountUpdateOutcome> {
        let lock = self.locks.lock_for(tenant_id);
        let _guard = lock.lock().await;

        let (subscription, current_plan) = self.get_or_create_locked(tenant_id, catalog).await?;
        let eligible = catalog.plan_for_student_count(new_count)?;
        let previous_count = i64::from(subscription.student_count_at_last_check);
        let now = Utc::now();

        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        let outcome = match resolve_count_update(&current_plan, eligible, previous_count, new_count)
        {
            CountAction::ChangePlan => {
                let amount = prorated_plan_change_cents(
                    current_plan.monthly_price_cents,
                    eligible.monthly_price_cents,
                    now,
                    subscription.current_period_start,
                    subscription.current_period_end,
                );
                let entry =
                    ledger::append_entry(&mut tx, subscription.id, amount, BillingReason::PlanChange, now)
                        .await?;
                sqlx::query(
                    r#"
                    UPDATE tenant_subscriptions
                    SET plan_id = $2,
                        current_billing_amount_cents = current_billing_amount_cents + $3,
                        student_count_at_last_check = $4,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(subscription.id)
                .bind(eligible.id)
                .bind(amount)
                .bind(new_count as i32)
                .execute(&mut *tx)
                .await?;

                tracing::info!(
                    %tenant_id,
                    old_plan = %current_plan.name,
                    new_plan = %eligible.name,
                    %new_count,
                    "subscription re-tiered"
                );

                CountUpdateOutcome {
                    tier_changed: true,
                    threshold_met: false,
                    new_plan: eligible.clone(),
                    ledger_entry: Some(entry),
                }
            }
            CountAction::ChargeOverage { units_over } => {
                let amount = units_over * current_plan.overage_unit_price_cents;
                let entry =
                    ledger::append_entry(&mut tx, subscription.id, amount, BillingReason::Overage, now)
                        .await?;
                sqlx::query(
                    r#"
                    UPDATE tenant_subscriptions
                    SET current_billing_amount_cents = current_billing_amount_cents + $2,
                        student_count_at_last_check = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(subscription.id)
                .bind(amount)
                .bind(new_count as i32)
                .execute(&mut *tx)
                .await?;

                tracing::info!(
                    %tenant_id,
                    plan = %current_plan.name,
                    %units_over,
                    "included threshold crossed, overage charged"
                );

                CountUpdateOutcome {
                    tier_changed: false,
                    threshold_met: true,
                    new_plan: current_plan.clone(),
                    ledger_entry: Some(entry),
                }
            }
            CountAction::Record => {
                sqlx::query(
                    r#"
                    UPDATE tenant_subscriptions
                    SET student_count_at_last_check = $2, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(subscription.id)
                .bind(new_count as i32)
                .execute(&mut *tx)
                .await?;

                CountUpdateOutcome {
                    tier_changed: false,
                    threshold_met: false,
                    new_plan: current_plan.clone(),
                    ledger_entry: None,
                }
            }
        };
        tx.commit().await?;

        Ok(outcome)
    }

    /// Renew for one more month. Always appends a fresh renewal charge —
    /// renewal is deliberately not idempotent — but refuses when an unpaid
    /// renewal entry already sits inside the current period, which is the
    /// double-invocation signature after a late renewal.
    pub async fn process_renewal(
        &self,
        subscription_id: Uuid,
    ) -> EngineResult<SubscriptionBillingHistory> {
        let tenant_id = self.find_by_id(subscription_id).await?.tenant_id;
        let lock = self.locks.lock_for(tenant_id);
        let _guard = lock.lock().await;

        let subscription = self.find_by_id(subscription_id).await?;
        match subscription.status {
            SubscriptionStatus::Active | SubscriptionStatus::Expired => {}
            from => {
                return Err(EngineError::InvalidTransition {
                    from,
                    to: SubscriptionStatus::Active,
                })
            }
        }

        let plan = resolve_plan(&self.pool, subscription.plan_id).await?;
        let now = Utc::now();

        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        if ledger::unpaid_renewal_in_period(
            &mut tx,
            subscription.id,
            subscription.current_period_start,
            subscription.current_period_end,
        )
        .await?
        {
            return Err(EngineError::AlreadyRenewed);
        }

        let entry = ledger::append_entry(
            &mut tx,
            subscription.id,
            plan.monthly_price_cents,
            BillingReason::Renewal,
            now,
        )
        .await?;

        let (new_start, new_end) = next_period(subscription.current_period_end);
        sqlx::query(
            r#"
            UPDATE tenant_subscriptions
            SET status = 'active',
                current_period_start = $2,
                current_period_end = $3,
                next_billing_date = $3,
                current_billing_amount_cents = $4,
                is_paid = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(new_start)
        .bind(new_end)
        .bind(plan.monthly_price_cents)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            %tenant_id,
            subscription = %subscription.id,
            invoice = %entry.invoice_number,
            "subscription renewed"
        );

        Ok(entry)
    }

    pub async fn suspend(&self, tenant_id: Uuid) -> EngineResult<TenantSubscription> {
        self.transition(tenant_id, SubscriptionStatus::Suspended).await
    }

    pub async fn cancel(&self, tenant_id: Uuid) -> EngineResult<TenantSubscription> {
        self.transition(tenant_id, SubscriptionStatus::Cancelled).await
    }

    /// The explicit operator action behind the monitor's expiry flag; the
    /// engine never expires a subscription on its own.
    pub async fn mark_expired(&self, tenant_id: Uuid) -> EngineResult<TenantSubscription> {
        self.transition(tenant_id, SubscriptionStatus::Expired).await
    }

    async fn transition(
        &self,
        tenant_id: Uuid,
        to: SubscriptionStatus,
    ) -> EngineResult<TenantSubscription> {
        let lock = self.locks.lock_for(tenant_id);
        let _guard = lock.lock().await;

        let subscription = self
            .find_by_tenant(tenant_id)
            .await?
            .ok_or(EngineError::SubscriptionNotFound(tenant_id))?;

        if subscription.status.rank() >= to.rank() {
            return Err(EngineError::InvalidTransition {
                from: subscription.status,
                to,
            });
        }

        let updated = sqlx::query_as::<_, TenantSubscription>(
            r#"
            UPDATE tenant_subscriptions
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription.id)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            %tenant_id,
            from = %subscription.status,
            to = %to,
            "subscription status transition"
        );

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plan(id: Uuid, sort_order: i32, threshold: i32, monthly_cents: i64) -> SubscriptionPlan {
        SubscriptionPlan {
            id,
            name: format!("tier-{sort_order}"),
            sort_order,
            student_threshold: threshold,
            overage_unit_price_cents: 50,
            monthly_price_cents: monthly_cents,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn plan_change_supersedes_same_plan_overage() {
        let current = plan(Uuid::new_v4(), 1, 100, 4_900);
        let eligible = plan(Uuid::new_v4(), 2, 300, 14_900);
        // Count is over the current threshold AND the tier moved; only the
        // plan change may bill.
        assert!(matches!(
            resolve_count_update(&current, &eligible, 90, 150),
            CountAction::ChangePlan
        ));
    }

    #[test]
    fn overage_fires_on_crossing_only() {
        let ceiling = plan(Uuid::new_v4(), 3, 1_000, 39_900);
        match resolve_count_update(&ceiling, &ceiling, 990, 1_010) {
            CountAction::ChargeOverage { units_over } => assert_eq!(units_over, 10),
            _ => panic!("crossing should charge overage"),
        }
        // Already over: no re-charge on a steady-state report.
        assert!(matches!(
            resolve_count_update(&ceiling, &ceiling, 1_010, 1_020),
            CountAction::Record
        ));
    }

    #[test]
    fn unchanged_count_within_threshold_bills_nothing() {
        let current = plan(Uuid::new_v4(), 2, 300, 14_900);
        assert!(matches!(
            resolve_count_update(&current, &current, 150, 160),
            CountAction::Record
        ));
    }

    #[test]
    fn proration_scales_with_remaining_days() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).single().unwrap();
        let mid = Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).single().unwrap();

        assert_eq!(prorated_plan_change_cents(4_900, 14_900, start, start, end), 10_000);
        assert_eq!(prorated_plan_change_cents(4_900, 14_900, mid, start, end), 5_000);
        assert_eq!(prorated_plan_change_cents(4_900, 14_900, end, start, end), 0);
    }

    #[test]
    fn downgrades_never_credit() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).single().unwrap();
        assert_eq!(prorated_plan_change_cents(14_900, 4_900, start, start, end), 0);
    }

    #[test]
    fn periods_advance_anchored_at_their_end() {
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).single().unwrap();
        let (new_start, new_end) = next_period(end);
        assert_eq!(new_start, end);
        assert_eq!(
            new_end,
            Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).single().unwrap()
        );
    }
}
