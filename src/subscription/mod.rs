pub mod ledger;
pub mod models;
pub mod service;

pub use models::{
    BillingReason, CountUpdateOutcome, Pagination, SubscriptionBillingHistory,
    SubscriptionStatus, TenantSubscription,
};
pub use service::{SubscriptionService, TenantLocks};
