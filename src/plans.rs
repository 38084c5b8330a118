use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// key: plan-model -> tier reference data
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub sort_order: i32,
    pub student_threshold: i32,
    pub overage_unit_price_cents: i64,
    pub monthly_price_cents: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrdering {
    Higher,
    Lower,
    Equal,
}

/// key: plan-catalog -> ordered tier lookup
///
/// Holds the active tiers sorted by `sort_order`. Tiers are monotonically
/// increasing; the last tier is the ceiling and absorbs any student count
/// above every threshold.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<SubscriptionPlan>,
}

impl PlanCatalog {
    pub async fn load(pool: &PgPool) -> EngineResult<Self> {
        let plans = sqlx::query_as::<_, SubscriptionPlan>(
            "SELECT * FROM subscription_plans WHERE active = TRUE ORDER BY sort_order ASC",
        )
        .fetch_all(pool)
        .await?;
        Ok(Self::from_plans(plans))
    }

    pub fn from_plans(mut plans: Vec<SubscriptionPlan>) -> Self {
        plans.sort_by_key(|plan| plan.sort_order);
        Self { plans }
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Cheapest tier, used when a subscription is provisioned lazily.
    pub fn entry_plan(&self) -> EngineResult<&SubscriptionPlan> {
        self.plans.first().ok_or(EngineError::PlanNotFound)
    }

    /// Lowest-sorted plan whose threshold covers `student_count`, falling
    /// back to the ceiling tier. Equal thresholds prefer the cheaper plan.
    pub fn plan_for_student_count(&self, student_count: i64) -> EngineResult<&SubscriptionPlan> {
        self.plans
            .iter()
            .filter(|plan| i64::from(plan.student_threshold) >= student_count)
            .min_by_key(|plan| (plan.student_threshold, plan.monthly_price_cents, plan.sort_order))
            .map(Ok)
            .unwrap_or_else(|| self.plans.last().ok_or(EngineError::PlanNotFound))
    }

    pub fn compare(a: &SubscriptionPlan, b: &SubscriptionPlan) -> PlanOrdering {
        match a.sort_order.cmp(&b.sort_order) {
            std::cmp::Ordering::Greater => PlanOrdering::Higher,
            std::cmp::Ordering::Less => PlanOrdering::Lower,
            std::cmp::Ordering::Equal => PlanOrdering::Equal,
        }
    }
}

/// Resolve a plan by id regardless of its active flag. A plan deactivated
/// mid-operation must still resolve for subscriptions that reference it; a
/// missing row surfaces as `PlanNotFound` rather than defaulting.
pub async fn resolve_plan(pool: &PgPool, plan_id: Uuid) -> EngineResult<SubscriptionPlan> {
    sqlx::query_as::<_, SubscriptionPlan>("SELECT * FROM subscription_plans WHERE id = $1")
        .bind(plan_id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::PlanNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(name: &str, sort_order: i32, threshold: i32, monthly_cents: i64) -> SubscriptionPlan {
        SubscriptionPlan {
            id: Uuid::new_v4(),
            name: name.to_string(),
            sort_order,
            student_threshold: threshold,
            overage_unit_price_cents: 50,
            monthly_price_cents: monthly_cents,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn catalog() -> PlanCatalog {
        PlanCatalog::from_plans(vec![
            plan("basic", 1, 100, 4_900),
            plan("standard", 2, 300, 14_900),
            plan("premium", 3, 1_000, 39_900),
        ])
    }

    #[test]
    fn lookup_returns_minimal_qualifying_tier() {
        let catalog = catalog();
        for count in [0, 1, 99, 100] {
            assert_eq!(
                catalog.plan_for_student_count(count).unwrap().name,
                "basic",
                "count {count} should stay on the lowest tier"
            );
        }
        assert_eq!(catalog.plan_for_student_count(101).unwrap().name, "standard");
        assert_eq!(catalog.plan_for_student_count(300).unwrap().name, "standard");
        assert_eq!(catalog.plan_for_student_count(301).unwrap().name, "premium");
    }

    #[test]
    fn lookup_falls_back_to_ceiling_tier() {
        let catalog = catalog();
        assert_eq!(
            catalog.plan_for_student_count(50_000).unwrap().name,
            "premium"
        );
    }

    #[test]
    fn equal_thresholds_prefer_cheaper_plan() {
        let catalog = PlanCatalog::from_plans(vec![
            plan("legacy", 1, 200, 9_900),
            plan("current", 2, 200, 7_900),
        ]);
        assert_eq!(catalog.plan_for_student_count(150).unwrap().name, "current");
    }

    #[test]
    fn compare_orders_by_sort_order() {
        let basic = plan("basic", 1, 100, 4_900);
        let premium = plan("premium", 3, 1_000, 39_900);
        assert_eq!(PlanCatalog::compare(&premium, &basic), PlanOrdering::Higher);
        assert_eq!(PlanCatalog::compare(&basic, &premium), PlanOrdering::Lower);
        assert_eq!(PlanCatalog::compare(&basic, &basic), PlanOrdering::Equal);
    }

    #[test]
    fn empty_catalog_surfaces_plan_not_found() {
        let catalog = PlanCatalog::from_plans(Vec::new());
        assert!(matches!(
            catalog.plan_for_student_count(1),
            Err(EngineError::PlanNotFound)
        ));
    }
}
