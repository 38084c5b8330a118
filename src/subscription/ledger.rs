use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::models::{BillingReason, Pagination, SubscriptionBillingHistory};

/// Invoice numbers combine the subscription, a date component and the
/// per-subscription sequence: `INV-xxxxxxxx-YYYYMMDD-NNNNNN`. The sequence
/// comes from `tenant_subscriptions.invoice_seq`, bumped inside the same
/// transaction as the insert, so concurrent appends for one tenant
/// serialize on the subscription row instead of any global lock.
pub(crate) fn invoice_number(subscription_id: Uuid, date: DateTime<Utc>, seq: i64) -> String {
    let prefix = subscription_id.simple().to_string();
    format!(
        "INV-{}-{}-{:06}",
        &prefix[..8],
        date.format("%Y%m%d"),
        seq
    )
}

/// Append one immutable charge entry for `subscription_id`. Caller owns the
/// transaction; the bump and the insert commit or roll back together.
pub(crate) async fn append_entry(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
    amount_cents: i64,
    reason: BillingReason,
    now: DateTime<Utc>,
) -> EngineResult<SubscriptionBillingHistory> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        UPDATE tenant_subscriptions
        SET invoice_seq = invoice_seq + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING invoice_seq
        "#,
    )
    .bind(subscription_id)
    .fetch_one(&mut *tx)
    .await?;

    let entry = sqlx::query_as::<_, SubscriptionBillingHistory>(
        r#"
        INSERT INTO subscription_billing_history (
            id,
            subscription_id,
            invoice_number,
            billing_date,
            amount_cents,
            reason
        ) VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscription_id)
    .bind(invoice_number(subscription_id, now, seq))
    .bind(now)
    .bind(amount_cents)
    .bind(reason)
    .fetch_one(&mut *tx)
    .await?;

    Ok(entry)
}

pub async fn list(
    pool: &PgPool,
    subscription_id: Uuid,
    pagination: Pagination,
) -> EngineResult<Vec<SubscriptionBillingHistory>> {
    let entries = sqlx::query_as::<_, SubscriptionBillingHistory>(
        r#"
        SELECT * FROM subscription_billing_history
        WHERE subscription_id = $1
        ORDER BY billing_date DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(subscription_id)
    .bind(pagination.limit)
    .bind(pagination.offset)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

pub async fn find(pool: &PgPool, entry_id: Uuid) -> EngineResult<SubscriptionBillingHistory> {
    sqlx::query_as::<_, SubscriptionBillingHistory>(
        "SELECT * FROM subscription_billing_history WHERE id = $1",
    )
    .bind(entry_id)
    .fetch_optional(pool)
    .await?
    .ok_or(EngineError::LedgerEntryNotFound(entry_id))
}

/// One-way paid transition. The guarded UPDATE only fires on unpaid rows;
/// a second call falls through to the already-paid entry untouched, so
/// `paid_at` keeps its first value forever.
pub async fn mark_paid(
    pool: &PgPool,
    entry_id: Uuid,
    notes: Option<&str>,
) -> EngineResult<SubscriptionBillingHistory> {
    let updated = sqlx::query_as::<_, SubscriptionBillingHistory>(
        r#"
        UPDATE subscription_billing_history
        SET paid = TRUE, paid_at = NOW(), payment_notes = $2
        WHERE id = $1 AND paid = FALSE
        RETURNING *
        "#,
    )
    .bind(entry_id)
    .bind(notes)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(entry) => Ok(entry),
        None => find(pool, entry_id).await,
    }
}

/// True when an unpaid renewal charge already sits inside the given period.
pub(crate) async fn unpaid_renewal_in_period(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> EngineResult<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM subscription_billing_history
            WHERE subscription_id = $1
              AND reason = 'renewal'
              AND paid = FALSE
              AND billing_date >= $2
              AND billing_date < $3
        )
        "#,
    )
    .bind(subscription_id)
    .bind(period_start)
    .bind(period_end)
    .fetch_one(&mut *tx)
    .await?;
    Ok(exists)
}
