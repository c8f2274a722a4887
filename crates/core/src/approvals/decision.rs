use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::delegation::DelegationManager;
use super::orchestrator::WorkflowOrchestrator;
use super::ports::{DocumentStore, WorkflowRepository};
use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::config::DelegationPolicy;
use crate::domain::document::DocumentSummary;
use crate::domain::identity::{TenantId, UserId};
use crate::domain::rule::ApprovalMode;
use crate::domain::workflow::{
    ApprovalInstance, ApproverVote, DecisionRecord, Verdict, Workflow, WorkflowId, WorkflowStatus,
};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub workflow_id: WorkflowId,
    pub approver_id: UserId,
    pub verdict: Verdict,
    pub comment: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionFailure {
    WorkflowNotFound,
    NotInProgress,
    /// No pending instance at the workflow's current level.
    AlreadyDecided,
    Unauthorized,
    /// The seat already voted on an ALL-mode level.
    AlreadyVoted,
}

impl DecisionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound => "workflow_not_found",
            Self::NotInProgress => "not_in_progress",
            Self::AlreadyDecided => "already_decided",
            Self::Unauthorized => "unauthorized",
            Self::AlreadyVoted => "already_voted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub success: bool,
    pub workflow_complete: bool,
    pub final_status: Option<WorkflowStatus>,
    pub failure: Option<DecisionFailure>,
}

impl DecisionOutcome {
    pub fn refused(failure: DecisionFailure) -> Self {
        Self {
            success: false,
            workflow_complete: false,
            final_status: None,
            failure: Some(failure),
        }
    }

    pub fn recorded() -> Self {
        Self { success: true, workflow_complete: false, final_status: None, failure: None }
    }

    pub fn completed(status: WorkflowStatus) -> Self {
        Self { success: true, workflow_complete: true, final_status: Some(status), failure: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled { skipped: usize },
    NotFound,
    NotInProgress { status: WorkflowStatus },
}

/// One entry of an approver's inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub workflow: Workflow,
    pub instance: ApprovalInstance,
    pub document: Option<DocumentSummary>,
    /// Set when the user sees this entry only as someone's delegate.
    pub on_behalf_of: Option<UserId>,
}

/// The potential approver whose place a decider takes.
struct Seat {
    holder: UserId,
    on_behalf_of: Option<UserId>,
}

pub struct DecisionProcessor {
    workflows: Arc<dyn WorkflowRepository>,
    documents: Arc<dyn DocumentStore>,
    orchestrator: Arc<WorkflowOrchestrator>,
    delegations: Arc<DelegationManager>,
    audit: Arc<dyn AuditSink>,
    delegation_policy: DelegationPolicy,
}

impl DecisionProcessor {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        documents: Arc<dyn DocumentStore>,
        orchestrator: Arc<WorkflowOrchestrator>,
        delegations: Arc<DelegationManager>,
        audit: Arc<dyn AuditSink>,
        delegation_policy: DelegationPolicy,
    ) -> Self {
        Self { workflows, documents, orchestrator, delegations, audit, delegation_policy }
    }

    pub async fn process_decision(
        &self,
        request: DecisionRequest,
    ) -> Result<DecisionOutcome, ApplicationError> {
        let Some(workflow) = self.workflows.find(&request.workflow_id).await? else {
            let audit = AuditContext::new(None, &request.approver_id.0);
            return Ok(self.refuse(&audit, &request, DecisionFailure::WorkflowNotFound));
        };
        let audit = AuditContext::new(Some(workflow.tenant_id.clone()), &request.approver_id.0);

        if workflow.status != WorkflowStatus::InProgress {
            return Ok(self.refuse(&audit, &request, DecisionFailure::NotInProgress));
        }

        let instances = self.workflows.list_instances(&workflow.id).await?;
        let Some(instance) = instances
            .into_iter()
            .find(|instance| {
                instance.level_order == workflow.current_level && instance.is_pending()
            })
        else {
            return Ok(self.refuse(&audit, &request, DecisionFailure::AlreadyDecided));
        };

        let Some(seat) = self.seat_for(&workflow, &instance, &request.approver_id).await? else {
            return Ok(self.refuse(&audit, &request, DecisionFailure::Unauthorized));
        };

        match instance.approval_mode {
            ApprovalMode::Any => {
                self.decide_level(&workflow, &instance, &request, &seat, &audit).await
            }
            ApprovalMode::All => self.vote(&workflow, &instance, &request, &seat, &audit).await,
        }
    }

    pub async fn cancel_workflow(
        &self,
        workflow_id: &WorkflowId,
        cancelled_by: &UserId,
    ) -> Result<CancelOutcome, ApplicationError> {
        let Some(workflow) = self.workflows.find(workflow_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        let audit = AuditContext::new(Some(workflow.tenant_id.clone()), &cancelled_by.0);

        let Some(skipped) = self.workflows.cancel(workflow_id, Utc::now()).await? else {
            let status = match self.workflows.find(workflow_id).await? {
                Some(current) => current.status,
                None => workflow.status,
            };
            return Ok(CancelOutcome::NotInProgress { status });
        };

        info!(
            event_name = "approval.workflow.cancelled",
            correlation_id = %audit.correlation_id,
            tenant_id = %workflow.tenant_id.0,
            workflow_id = %workflow.id.0,
            skipped,
            "approval workflow cancelled"
        );
        self.audit.emit(
            audit
                .event(
                    Some(&workflow.id),
                    "approval.workflow.cancelled",
                    AuditCategory::Workflow,
                    AuditOutcome::Success,
                )
                .with_metadata("skipped_instances", skipped.to_string()),
        );

        Ok(CancelOutcome::Cancelled { skipped })
    }

    pub async fn get_pending_approvals(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<PendingApproval>, ApplicationError> {
        let principals = self.principals_of(user_id, tenant_id).await?;
        let mut pending = Vec::new();

        for workflow in self.workflows.list_in_progress(tenant_id).await? {
            let Some(instance) = self
                .workflows
                .list_instances(&workflow.id)
                .await?
                .into_iter()
                .find(|instance| {
                    instance.level_order == workflow.current_level && instance.is_pending()
                })
            else {
                continue;
            };

            let on_behalf_of = if open_seat(&instance, user_id) {
                None
            } else {
                match principals.iter().find(|principal| open_seat(&instance, principal)) {
                    Some(principal) => Some(principal.clone()),
                    None => continue,
                }
            };

            let document = self.documents.summary(tenant_id, &workflow.document).await?;
            pending.push(PendingApproval { workflow, instance, document, on_behalf_of });
        }

        Ok(pending)
    }

    /// Users whose seats `user_id` may fill today under the configured policy.
    async fn principals_of(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        match self.delegation_policy {
            DelegationPolicy::Ignore => Ok(Vec::new()),
            DelegationPolicy::Honor => {
                self.delegations
                    .active_principals(user_id, tenant_id, Utc::now().date_naive())
                    .await
            }
        }
    }

    async fn seat_for(
        &self,
        workflow: &Workflow,
        instance: &ApprovalInstance,
        approver_id: &UserId,
    ) -> Result<Option<Seat>, ApplicationError> {
        if instance.is_potential_approver(approver_id) {
            return Ok(Some(Seat { holder: approver_id.clone(), on_behalf_of: None }));
        }

        let principals = self.principals_of(approver_id, &workflow.tenant_id).await?;
        let held: Vec<&UserId> = instance
            .potential_approvers
            .iter()
            .map(|approver| &approver.user_id)
            .filter(|user_id| principals.contains(user_id))
            .collect();
        // Prefer a seat that can still vote; fall back so the caller sees AlreadyVoted.
        let preferred = held
            .iter()
            .find(|principal| open_seat(instance, principal))
            .or(held.first())
            .map(|principal| (*principal).clone());

        Ok(preferred.map(|principal| Seat {
            holder: principal.clone(),
            on_behalf_of: Some(principal),
        }))
    }

    /// Settles the whole level with this decision. Used for ANY levels.
    async fn decide_level(
        &self,
        workflow: &Workflow,
        instance: &ApprovalInstance,
        request: &DecisionRequest,
        seat: &Seat,
        audit: &AuditContext,
    ) -> Result<DecisionOutcome, ApplicationError> {
        let record = DecisionRecord {
            verdict: request.verdict,
            decided_by: request.approver_id.clone(),
            on_behalf_of: seat.on_behalf_of.clone(),
            comment: request.comment.clone(),
            decided_at: Utc::now(),
        };
        match self.settle(workflow, instance, &record, audit).await? {
            Some(outcome) => Ok(outcome),
            None => {
                let failure = self.lost_race_failure(&workflow.id).await?;
                Ok(self.refuse(audit, request, failure))
            }
        }
    }

    /// Stores the seat's vote, then settles the level once the votes decide it. A seat that
    /// already voted on a decided but still pending level settles it again, which lets a caller
    /// retry after a failure between the vote and the settlement.
    async fn vote(
        &self,
        workflow: &Workflow,
        instance: &ApprovalInstance,
        request: &DecisionRequest,
        seat: &Seat,
        audit: &AuditContext,
    ) -> Result<DecisionOutcome, ApplicationError> {
        let voted_now = if instance.has_vote_from(&seat.holder) {
            if instance.deciding_vote().is_none() {
                return Ok(self.refuse(audit, request, DecisionFailure::AlreadyVoted));
            }
            false
        } else {
            let vote = ApproverVote {
                voter_id: seat.holder.clone(),
                decided_by: request.approver_id.clone(),
                verdict: request.verdict,
                comment: request.comment.clone(),
                voted_at: Utc::now(),
            };
            if !self.workflows.record_vote(&instance.id, &vote).await? {
                let still_pending = self.pending_instance(workflow, instance).await?.is_some();
                let failure = if still_pending {
                    DecisionFailure::AlreadyVoted
                } else {
                    self.lost_race_failure(&workflow.id).await?
                };
                return Ok(self.refuse(audit, request, failure));
            }

            info!(
                event_name = "approval.vote.recorded",
                correlation_id = %audit.correlation_id,
                tenant_id = %workflow.tenant_id.0,
                workflow_id = %workflow.id.0,
                level_order = instance.level_order,
                voter_id = %seat.holder.0,
                decided_by = %request.approver_id.0,
                verdict = request.verdict.as_str(),
                "vote recorded on unanimous level"
            );
            self.audit.emit(
                audit
                    .event(
                        Some(&workflow.id),
                        "approval.vote.recorded",
                        AuditCategory::Decision,
                        AuditOutcome::Success,
                    )
                    .with_metadata("level_order", instance.level_order.to_string())
                    .with_metadata("voter_id", seat.holder.0.clone())
                    .with_metadata("verdict", request.verdict.as_str()),
            );
            true
        };

        let Some(current) = self.pending_instance(workflow, instance).await? else {
            // Another voter settled the level first; this vote still counts.
            return Ok(self.settled_elsewhere(audit, request, voted_now));
        };
        let Some(deciding) = current.deciding_vote() else {
            return Ok(DecisionOutcome::recorded());
        };
        let record = DecisionRecord {
            verdict: deciding.verdict,
            decided_by: deciding.decided_by.clone(),
            on_behalf_of: (deciding.decided_by != deciding.voter_id)
                .then(|| deciding.voter_id.clone()),
            comment: deciding.comment.clone(),
            decided_at: Utc::now(),
        };

        match self.settle(workflow, &current, &record, audit).await? {
            Some(outcome) => Ok(outcome),
            None => Ok(self.settled_elsewhere(audit, request, voted_now)),
        }
    }

    async fn settle(
        &self,
        workflow: &Workflow,
        instance: &ApprovalInstance,
        record: &DecisionRecord,
        audit: &AuditContext,
    ) -> Result<Option<DecisionOutcome>, ApplicationError> {
        let Some(settled) = self.orchestrator.settle_level(workflow, instance, record, audit).await?
        else {
            return Ok(None);
        };

        self.log_recorded(workflow, instance, record, audit);
        self.orchestrator.publish(workflow, &settled, audit).await;
        Ok(Some(match settled.status() {
            Some(status) => DecisionOutcome::completed(status),
            None => DecisionOutcome::recorded(),
        }))
    }

    fn settled_elsewhere(
        &self,
        audit: &AuditContext,
        request: &DecisionRequest,
        voted_now: bool,
    ) -> DecisionOutcome {
        if voted_now {
            DecisionOutcome::recorded()
        } else {
            self.refuse(audit, request, DecisionFailure::AlreadyVoted)
        }
    }

    async fn pending_instance(
        &self,
        workflow: &Workflow,
        instance: &ApprovalInstance,
    ) -> Result<Option<ApprovalInstance>, ApplicationError> {
        Ok(self
            .workflows
            .list_instances(&workflow.id)
            .await?
            .into_iter()
            .find(|current| current.id == instance.id && current.is_pending()))
    }

    async fn lost_race_failure(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<DecisionFailure, ApplicationError> {
        Ok(match self.workflows.find(workflow_id).await? {
            Some(current) if current.status == WorkflowStatus::InProgress => {
                DecisionFailure::AlreadyDecided
            }
            Some(_) => DecisionFailure::NotInProgress,
            None => DecisionFailure::WorkflowNotFound,
        })
    }

    fn log_recorded(
        &self,
        workflow: &Workflow,
        instance: &ApprovalInstance,
        record: &DecisionRecord,
        audit: &AuditContext,
    ) {
        let on_behalf_of = record.on_behalf_of.as_ref().map(|user| user.0.as_str());
        info!(
            event_name = "approval.decision.recorded",
            correlation_id = %audit.correlation_id,
            tenant_id = %workflow.tenant_id.0,
            workflow_id = %workflow.id.0,
            level_order = instance.level_order,
            decided_by = %record.decided_by.0,
            on_behalf_of = on_behalf_of.unwrap_or("none"),
            verdict = record.verdict.as_str(),
            "approval decision recorded"
        );

        let mut event = audit
            .event(
                Some(&workflow.id),
                "approval.decision.recorded",
                AuditCategory::Decision,
                AuditOutcome::Success,
            )
            .with_metadata("level_order", instance.level_order.to_string())
            .with_metadata("verdict", record.verdict.as_str());
        if let Some(principal) = &record.on_behalf_of {
            event = event.with_metadata("on_behalf_of", principal.0.clone());
        }
        self.audit.emit(event);
    }

    fn refuse(
        &self,
        audit: &AuditContext,
        request: &DecisionRequest,
        failure: DecisionFailure,
    ) -> DecisionOutcome {
        warn!(
            event_name = "approval.decision.refused",
            correlation_id = %audit.correlation_id,
            workflow_id = %request.workflow_id.0,
            approver_id = %request.approver_id.0,
            failure = failure.as_str(),
            "approval decision refused"
        );
        self.audit.emit(
            audit
                .event(
                    Some(&request.workflow_id),
                    "approval.decision.refused",
                    AuditCategory::Decision,
                    AuditOutcome::Rejected,
                )
                .with_metadata("failure", failure.as_str()),
        );
        DecisionOutcome::refused(failure)
    }
}

/// Whether `user_id` holds a seat on the instance that can still act.
fn open_seat(instance: &ApprovalInstance, user_id: &UserId) -> bool {
    instance.is_potential_approver(user_id)
        && (instance.approval_mode == ApprovalMode::Any || !instance.has_vote_from(user_id))
}
