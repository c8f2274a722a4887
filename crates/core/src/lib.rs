pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;

pub use approvals::{
    ApprovalEngine, ApprovalServices, CancelDelegationOutcome, CancelOutcome,
    CreateDelegationOutcome, CreateDelegationRequest, DecisionFailure, DecisionOutcome,
    DecisionRequest, DelegationFailure, EngineSettings, NotApplicableReason, PendingApproval,
    StartOutcome, StartWorkflowRequest, SubmitDocumentRequest, WorkflowView,
};
pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use config::{AppConfig, DelegationPolicy};
pub use domain::delegation::{Delegation, DelegationId};
pub use domain::document::{DocumentRef, DocumentSummary, DocumentType};
pub use domain::identity::{DirectoryUser, TenantId, UserId};
pub use domain::rule::{
    ApprovalLevel, ApprovalMode, ApprovalRule, ApproverSpec, LevelType, PurchaseType, RuleId,
};
pub use domain::workflow::{
    ApprovalInstance, Decision, Verdict, Workflow, WorkflowId, WorkflowStatus,
};
pub use errors::{ApplicationError, DomainError};
