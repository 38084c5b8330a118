use thiserror::Error;
use uuid::Uuid;

use crate::subscription::SubscriptionStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("usage source unavailable: {0}")]
    DataUnavailable(String),
    #[error("subscription plan not found")]
    PlanNotFound,
    #[error("no subscription for tenant {0}")]
    SubscriptionNotFound(Uuid),
    #[error("ledger entry {0} not found")]
    LedgerEntryNotFound(Uuid),
    #[error("renewal already processed for the current billing period")]
    AlreadyRenewed,
    #[error("subscription status {from} does not permit transition to {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
