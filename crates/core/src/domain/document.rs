use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::identity::UserId;
use crate::domain::rule::PurchaseType;

/// Kind of document gated by approvals. Opaque to the engine beyond equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentType(pub String);

impl DocumentType {
    pub const PURCHASE_REQUEST: &'static str = "PURCHASE_REQUEST";

    pub fn purchase_request() -> Self {
        Self(Self::PURCHASE_REQUEST.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_type: DocumentType,
    pub document_id: String,
}

impl DocumentRef {
    pub fn new(document_type: DocumentType, document_id: impl Into<String>) -> Self {
        Self { document_type, document_id: document_id.into() }
    }
}

/// What an approver needs to see about a document in their inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document: DocumentRef,
    pub reference: String,
    pub title: String,
    pub amount: Decimal,
    pub purchase_type: Option<PurchaseType>,
    pub requested_by: Option<UserId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentApprovalStatus {
    Approved,
    Rejected,
}

impl DocumentApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}
