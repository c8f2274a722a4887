use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::delegation::{Delegation, DelegationId, DelegationInsert};
use crate::domain::document::{DocumentApprovalStatus, DocumentRef, DocumentSummary, DocumentType};
use crate::domain::identity::{DirectoryUser, TenantId, UserId};
use crate::domain::rule::ApprovalRule;
use crate::domain::workflow::{
    ApprovalInstance, ApprovalInstanceId, ApproverVote, DecisionRecord, LevelResolution, Workflow,
    WorkflowId,
};
use crate::errors::ApplicationError;

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Active rules for the tenant and document type, in the store's natural order.
    async fn list_active_rules(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
    ) -> Result<Vec<ApprovalRule>, ApplicationError>;
}

/// Persistence for workflows together with their approval instances and votes.
///
/// Every mutating method is conditional and reports whether it took effect, so that
/// concurrent callers racing on the same level observe exactly one winner.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Stores a new workflow and its first instance. Returns `false` without writing when the
    /// document already has an in-progress workflow.
    async fn create(
        &self,
        workflow: Workflow,
        first_instance: ApprovalInstance,
    ) -> Result<bool, ApplicationError>;

    async fn find(&self, id: &WorkflowId) -> Result<Option<Workflow>, ApplicationError>;

    async fn find_active(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<Workflow>, ApplicationError>;

    async fn list_in_progress(&self, tenant_id: &TenantId)
        -> Result<Vec<Workflow>, ApplicationError>;

    /// Instances ordered by level, each carrying its votes.
    async fn list_instances(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<ApprovalInstance>, ApplicationError>;

    /// Adds a vote if the instance is still pending and the seat has not voted yet.
    async fn record_vote(
        &self,
        instance_id: &ApprovalInstanceId,
        vote: &ApproverVote,
    ) -> Result<bool, ApplicationError>;

    /// Records the decision that settles a pending instance and applies `resolution` to its
    /// workflow as one atomic write. Returns `false` and writes nothing unless the instance is
    /// still pending and its workflow is in progress at the instance's level.
    async fn resolve_level(
        &self,
        instance_id: &ApprovalInstanceId,
        record: &DecisionRecord,
        resolution: &LevelResolution,
    ) -> Result<bool, ApplicationError>;

    /// Cancels an in-progress workflow and skips its pending instances. Returns the number of
    /// skipped instances, or `None` when the workflow was not in progress.
    async fn cancel(
        &self,
        workflow_id: &WorkflowId,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<usize>, ApplicationError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn summary(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<DocumentSummary>, ApplicationError>;

    async fn set_approval_status(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
        status: DocumentApprovalStatus,
    ) -> Result<(), ApplicationError>;
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_user(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
    ) -> Result<Option<DirectoryUser>, ApplicationError>;

    async fn list_active_members_with_role(
        &self,
        tenant_id: &TenantId,
        role: &str,
    ) -> Result<Vec<DirectoryUser>, ApplicationError>;
}

#[async_trait]
pub trait DelegationRepository: Send + Sync {
    /// Inserts unless an active delegation of the same delegator in the same tenant overlaps
    /// the new date range.
    async fn insert_if_no_overlap(
        &self,
        delegation: Delegation,
    ) -> Result<DelegationInsert, ApplicationError>;

    async fn find(&self, id: &DelegationId) -> Result<Option<Delegation>, ApplicationError>;

    /// Returns `true` if the delegation was active and is now inactive.
    async fn deactivate(&self, id: &DelegationId) -> Result<bool, ApplicationError>;

    /// Delegations where the user is delegator or delegate, newest first.
    async fn list_for_user(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Delegation>, ApplicationError>;

    async fn list_active_for_delegate(
        &self,
        delegate_id: &UserId,
        tenant_id: &TenantId,
        on: NaiveDate,
    ) -> Result<Vec<Delegation>, ApplicationError>;
}
