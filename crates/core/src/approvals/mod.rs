//! Multi-level approval workflows for tenant documents.
//!
//! [`ApprovalEngine`] wires the rule matcher, the workflow orchestrator, the decision processor and
//! the delegation manager over the collaborator traits in [`ports`].

pub mod decision;
pub mod delegation;
pub mod engine;
pub mod matcher;
pub mod memory;
pub mod notify;
pub mod orchestrator;
pub mod ports;
pub mod resolver;

pub use decision::{
    CancelOutcome, DecisionFailure, DecisionOutcome, DecisionProcessor, DecisionRequest,
    PendingApproval,
};
pub use delegation::{
    CancelDelegationOutcome, CreateDelegationOutcome, CreateDelegationRequest, DelegationFailure,
    DelegationManager,
};
pub use engine::{ApprovalEngine, ApprovalServices, EngineSettings, SubmitDocumentRequest};
pub use matcher::{select_rule, RuleMatcher};
pub use notify::{
    ChannelNotificationDispatcher, InMemoryNotificationDispatcher, Notification,
    NotificationDispatcher, NotificationError,
};
pub use orchestrator::{
    NotApplicableReason, StartOutcome, StartWorkflowRequest, WorkflowOrchestrator, WorkflowView,
};
pub use ports::{
    DelegationRepository, Directory, DocumentStore, RuleRepository, WorkflowRepository,
};
pub use resolver::{ApproverResolver, DirectoryApproverResolver};
