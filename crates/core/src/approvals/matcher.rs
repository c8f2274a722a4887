use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use super::ports::RuleRepository;
use crate::domain::document::DocumentType;
use crate::domain::identity::TenantId;
use crate::domain::rule::{ApprovalRule, PurchaseType};
use crate::errors::{ApplicationError, DomainError};

pub struct RuleMatcher {
    rules: Arc<dyn RuleRepository>,
}

impl RuleMatcher {
    pub fn new(rules: Arc<dyn RuleRepository>) -> Self {
        Self { rules }
    }

    /// `Ok(None)` means no approval chain applies; that is a business outcome, not a fault.
    pub async fn find_applicable_rule(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
        amount: Decimal,
        purchase_type: Option<PurchaseType>,
    ) -> Result<Option<ApprovalRule>, ApplicationError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(DomainError::NegativeAmount { amount }.into());
        }

        let candidates = self.rules.list_active_rules(tenant_id, document_type).await?;
        let candidate_count = candidates.len();
        let selected = select_rule(candidates, amount, purchase_type);

        debug!(
            event_name = "approval.rule.matched",
            tenant_id = %tenant_id.0,
            document_type = %document_type.0,
            %amount,
            purchase_type = purchase_type.map(|p| p.as_str()).unwrap_or("none"),
            candidate_count,
            rule_id = selected.as_ref().map(|rule| rule.id.0.as_str()).unwrap_or("none"),
            "approval rule selection finished"
        );

        Ok(selected)
    }
}

/// Highest priority wins; ties go to the older rule, then to the lower rule id.
pub fn select_rule(
    mut candidates: Vec<ApprovalRule>,
    amount: Decimal,
    purchase_type: Option<PurchaseType>,
) -> Option<ApprovalRule> {
    candidates.retain(|rule| rule.is_active);
    candidates.sort_by(|left, right| {
        right
            .priority
            .cmp(&left.priority)
            .then_with(|| left.created_at.cmp(&right.created_at))
            .then_with(|| left.id.cmp(&right.id))
    });
    candidates.into_iter().find(|rule| rule.matches(amount, purchase_type))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::{select_rule, RuleMatcher};
    use crate::approvals::memory::InMemoryRuleRepository;
    use crate::domain::document::DocumentType;
    use crate::domain::identity::{TenantId, UserId};
    use crate::domain::rule::{
        ApprovalLevel, ApprovalMode, ApprovalRule, ApproverSpec, LevelType, PurchaseType, RuleId,
    };
    use crate::errors::{ApplicationError, DomainError};

    fn rule(
        id: &str,
        priority: i32,
        max_amount: i64,
        purchase_type: Option<PurchaseType>,
    ) -> ApprovalRule {
        ApprovalRule {
            id: RuleId(id.to_string()),
            tenant_id: TenantId("tenant-a".to_string()),
            name: id.to_string(),
            document_type: DocumentType::purchase_request(),
            purchase_type,
            min_amount: Some(Decimal::ZERO),
            max_amount: Some(Decimal::new(max_amount, 0)),
            priority,
            is_active: true,
            levels: vec![ApprovalLevel {
                level_order: 1,
                name: "Manager".to_string(),
                mode: ApprovalMode::Any,
                level_type: LevelType::General,
                approvers: vec![ApproverSpec::User(UserId("mgr".to_string()))],
            }],
            created_at: Utc::now(),
        }
    }

    fn standard_rules() -> Vec<ApprovalRule> {
        vec![
            rule("p5-any", 5, 1_000_000, None),
            rule("p10-direct", 10, 100_000, Some(PurchaseType::Direct)),
        ]
    }

    #[test]
    fn higher_priority_rule_wins_when_it_qualifies() {
        let selected =
            select_rule(standard_rules(), Decimal::new(50_000, 0), Some(PurchaseType::Direct));
        assert_eq!(selected.map(|rule| rule.id.0), Some("p10-direct".to_string()));
    }

    #[test]
    fn purchase_type_mismatch_falls_through_to_unfiltered_rule() {
        let selected =
            select_rule(standard_rules(), Decimal::new(50_000, 0), Some(PurchaseType::WithQuote));
        assert_eq!(selected.map(|rule| rule.id.0), Some("p5-any".to_string()));
    }

    #[test]
    fn amount_above_every_bound_selects_nothing() {
        for purchase_type in [Some(PurchaseType::Direct), Some(PurchaseType::WithQuote), None] {
            assert!(select_rule(standard_rules(), Decimal::new(2_000_000, 0), purchase_type)
                .is_none());
        }
    }

    #[test]
    fn equal_priority_tie_goes_to_older_rule_then_lower_id() {
        let now = Utc::now();
        let mut newer = rule("a-newer", 7, 1_000, None);
        newer.created_at = now;
        let mut older = rule("z-older", 7, 1_000, None);
        older.created_at = now - Duration::days(1);

        let selected = select_rule(vec![newer.clone(), older], Decimal::ONE, None);
        assert_eq!(selected.map(|rule| rule.id.0), Some("z-older".to_string()));

        let mut twin = rule("b-twin", 7, 1_000, None);
        twin.created_at = now;
        let selected = select_rule(vec![twin, newer], Decimal::ONE, None);
        assert_eq!(selected.map(|rule| rule.id.0), Some("a-newer".to_string()));
    }

    #[tokio::test]
    async fn matcher_reads_rules_from_repository() {
        let matcher =
            RuleMatcher::new(Arc::new(InMemoryRuleRepository::with_rules(standard_rules())));

        let selected = matcher
            .find_applicable_rule(
                &TenantId("tenant-a".to_string()),
                &DocumentType::purchase_request(),
                Decimal::new(50_000, 0),
                Some(PurchaseType::Direct),
            )
            .await
            .expect("match");

        assert_eq!(selected.map(|rule| rule.id.0), Some("p10-direct".to_string()));
    }

    #[tokio::test]
    async fn negative_amount_is_a_domain_error() {
        let matcher = RuleMatcher::new(Arc::new(InMemoryRuleRepository::default()));

        let error = matcher
            .find_applicable_rule(
                &TenantId("tenant-a".to_string()),
                &DocumentType::purchase_request(),
                Decimal::NEGATIVE_ONE,
                None,
            )
            .await
            .expect_err("negative amount");

        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::NegativeAmount { .. })
        ));
    }
}
