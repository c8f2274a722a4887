use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::document::DocumentType;
use crate::domain::identity::{TenantId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseType {
    Direct,
    WithQuote,
}

impl PurchaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::WithQuote => "with_quote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "with_quote" => Some(Self::WithQuote),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// First potential approver to decide resolves the level.
    Any,
    /// Every potential approver must approve; one rejection resolves the level.
    All,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any" => Some(Self::Any),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelType {
    General,
    Specifications,
}

impl LevelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Specifications => "specifications",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "specifications" => Some(Self::Specifications),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ApproverSpec {
    User(UserId),
    Role(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub level_order: u32,
    pub name: String,
    pub mode: ApprovalMode,
    pub level_type: LevelType,
    pub approvers: Vec<ApproverSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub document_type: DocumentType,
    pub purchase_type: Option<PurchaseType>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub priority: i32,
    pub is_active: bool,
    pub levels: Vec<ApprovalLevel>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRule {
    /// Bounds are inclusive; an unset bound or purchase type filter matches everything.
    pub fn matches(&self, amount: Decimal, purchase_type: Option<PurchaseType>) -> bool {
        if let Some(required) = self.purchase_type {
            if purchase_type != Some(required) {
                return false;
            }
        }

        if let Some(min_amount) = self.min_amount {
            if amount < min_amount {
                return false;
            }
        }

        if let Some(max_amount) = self.max_amount {
            if amount > max_amount {
                return false;
            }
        }

        true
    }

    /// Levels that apply to a document, in ascending order.
    pub fn plan(&self, requires_spec_approval: bool) -> Vec<ApprovalLevel> {
        let mut levels: Vec<ApprovalLevel> = self
            .levels
            .iter()
            .filter(|level| requires_spec_approval || level.level_type != LevelType::Specifications)
            .cloned()
            .collect();
        levels.sort_by_key(|level| level.level_order);
        levels
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidRule("rule name must not be empty".to_string()));
        }

        if let (Some(min_amount), Some(max_amount)) = (self.min_amount, self.max_amount) {
            if min_amount > max_amount {
                return Err(DomainError::InvalidRule(format!(
                    "rule `{}` has min_amount {min_amount} above max_amount {max_amount}",
                    self.name
                )));
            }
        }

        if self.min_amount.is_some_and(|min_amount| min_amount.is_sign_negative()) {
            return Err(DomainError::InvalidRule(format!(
                "rule `{}` has a negative min_amount",
                self.name
            )));
        }

        if self.levels.is_empty() {
            return Err(DomainError::InvalidRule(format!("rule `{}` has no levels", self.name)));
        }

        let mut orders: Vec<u32> = self.levels.iter().map(|level| level.level_order).collect();
        orders.sort_unstable();
        for (index, order) in orders.iter().enumerate() {
            let expected = index as u32 + 1;
            if *order != expected {
                return Err(DomainError::InvalidRule(format!(
                    "rule `{}` level orders must be contiguous from 1, found {order} where {expected} was expected",
                    self.name
                )));
            }
        }

        if let Some(level) = self.levels.iter().find(|level| level.approvers.is_empty()) {
            return Err(DomainError::InvalidRule(format!(
                "level {} of rule `{}` has no approvers",
                level.level_order, self.name
            )));
        }

        Ok(())
    }
}
