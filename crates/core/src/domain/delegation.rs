use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::{TenantId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DelegationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub tenant_id: TenantId,
    pub delegator_id: UserId,
    pub delegate_id: UserId,
    /// Inclusive.
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    pub reason: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    pub fn overlaps(&self, start_date: NaiveDate, end_date: NaiveDate) -> bool {
        self.is_active && self.start_date <= end_date && self.end_date >= start_date
    }

    pub fn covers(&self, day: NaiveDate) -> bool {
        self.is_active && self.start_date <= day && day <= self.end_date
    }
}

/// Result of a conditional delegation insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelegationInsert {
    Inserted,
    Overlaps(Delegation),
}
