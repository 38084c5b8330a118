use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::plans::SubscriptionPlan;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Transitions are monotonic along this rank except renewal, which is
    /// the one sanctioned expired -> active edge.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            SubscriptionStatus::Active => 0,
            SubscriptionStatus::Suspended => 1,
            SubscriptionStatus::Expired => 2,
            SubscriptionStatus::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "billing_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingReason {
    Renewal,
    Overage,
    PlanChange,
    Manual,
}

/// key: subscription-model -> one row per tenant
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TenantSubscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub current_billing_amount_cents: i64,
    pub is_paid: bool,
    pub next_billing_date: DateTime<Utc>,
    pub student_count_at_last_check: i32,
    pub invoice_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// key: ledger-model -> append-only charge record
///
/// `amount_cents` and `reason` never change after insert; only the paid
/// trio may be updated, and only once.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionBillingHistory {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_number: String,
    pub billing_date: DateTime<Utc>,
    pub amount_cents: i64,
    pub reason: BillingReason,
    pub paid: bool,
    pub payment_notes: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Outcome of a student-count update, shaped for the admin screens that
/// display it. A plan change supersedes a same-plan overage, so at most one
/// of `tier_changed` / `threshold_met` is set and at most one ledger entry
/// is appended per call.
#[derive(Debug, Clone, Serialize)]
pub struct CountUpdateOutcome {
    pub tier_changed: bool,
    pub threshold_met: bool,
    pub new_plan: SubscriptionPlan,
    pub ledger_entry: Option<SubscriptionBillingHistory>,
}
