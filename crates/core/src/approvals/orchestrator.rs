use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::matcher::RuleMatcher;
use super::notify::{dispatch_best_effort, Notification, NotificationDispatcher};
use super::ports::{DocumentStore, WorkflowRepository};
use super::resolver::ApproverResolver;
use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::domain::document::{DocumentApprovalStatus, DocumentRef};
use crate::domain::identity::{TenantId, UserId};
use crate::domain::rule::{ApprovalLevel, PurchaseType, RuleId};
use crate::domain::workflow::{
    ApprovalInstance, ApprovalInstanceId, DecisionRecord, LevelResolution, Verdict, Workflow,
    WorkflowCompletion, WorkflowId, WorkflowStatus,
};
use crate::errors::{ApplicationError, DomainError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    pub tenant_id: TenantId,
    pub document: DocumentRef,
    pub amount: Decimal,
    pub purchase_type: Option<PurchaseType>,
    pub requires_spec_approval: bool,
    pub initiated_by: UserId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotApplicableReason {
    NoMatchingRule,
    /// The matched rule only has specification levels and the document does not need them.
    NoApplicableLevels { rule_id: RuleId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { workflow: Workflow, first_instance: ApprovalInstance },
    NotApplicable(NotApplicableReason),
    AlreadyInProgress(Workflow),
    DocumentNotFound,
}

impl StartOutcome {
    pub fn workflow(&self) -> Option<&Workflow> {
        match self {
            Self::Started { workflow, .. } | Self::AlreadyInProgress(workflow) => Some(workflow),
            Self::NotApplicable(_) | Self::DocumentNotFound => None,
        }
    }
}

/// A workflow together with the instances created for it so far.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowView {
    pub workflow: Workflow,
    pub instances: Vec<ApprovalInstance>,
}

/// A level settled by a successful decision, whose effects still have to be announced.
pub(crate) enum Settled {
    Advanced { from_level: u32, next_instance: ApprovalInstance },
    Completed { verdict: Verdict, completion: WorkflowCompletion },
}

impl Settled {
    pub(crate) fn status(&self) -> Option<WorkflowStatus> {
        match self {
            Self::Advanced { .. } => None,
            Self::Completed { completion, .. } => Some(completion.status),
        }
    }
}

pub struct WorkflowOrchestrator {
    matcher: RuleMatcher,
    workflows: Arc<dyn WorkflowRepository>,
    documents: Arc<dyn DocumentStore>,
    resolver: Arc<dyn ApproverResolver>,
    notifications: Arc<dyn NotificationDispatcher>,
    audit: Arc<dyn AuditSink>,
}

impl WorkflowOrchestrator {
    pub fn new(
        matcher: RuleMatcher,
        workflows: Arc<dyn WorkflowRepository>,
        documents: Arc<dyn DocumentStore>,
        resolver: Arc<dyn ApproverResolver>,
        notifications: Arc<dyn NotificationDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { matcher, workflows, documents, resolver, notifications, audit }
    }

    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartOutcome, ApplicationError> {
        let audit = AuditContext::new(Some(request.tenant_id.clone()), &request.initiated_by.0);

        let Some(rule) = self
            .matcher
            .find_applicable_rule(
                &request.tenant_id,
                &request.document.document_type,
                request.amount,
                request.purchase_type,
            )
            .await?
        else {
            info!(
                event_name = "approval.workflow.not_applicable",
                correlation_id = %audit.correlation_id,
                tenant_id = %request.tenant_id.0,
                document_id = %request.document.document_id,
                "no approval rule matches document"
            );
            return Ok(StartOutcome::NotApplicable(NotApplicableReason::NoMatchingRule));
        };

        let plan = rule.plan(request.requires_spec_approval);
        let Some(first_level) = plan.first().cloned() else {
            info!(
                event_name = "approval.workflow.not_applicable",
                correlation_id = %audit.correlation_id,
                tenant_id = %request.tenant_id.0,
                rule_id = %rule.id.0,
                "matched rule has no levels applicable to this document"
            );
            return Ok(StartOutcome::NotApplicable(NotApplicableReason::NoApplicableLevels {
                rule_id: rule.id,
            }));
        };

        if let Some(existing) =
            self.workflows.find_active(&request.tenant_id, &request.document).await?
        {
            return Ok(StartOutcome::AlreadyInProgress(existing));
        }

        let workflow = Workflow {
            id: WorkflowId(Uuid::new_v4().to_string()),
            tenant_id: request.tenant_id.clone(),
            rule_id: rule.id.clone(),
            document: request.document.clone(),
            status: WorkflowStatus::InProgress,
            current_level: first_level.level_order,
            requires_spec_approval: request.requires_spec_approval,
            plan,
            initiated_by: request.initiated_by.clone(),
            created_at: Utc::now(),
            completed_at: None,
            final_decision: None,
            final_comment: None,
        };
        let first_instance = self.open_instance(&workflow, &first_level).await?;

        if !self.workflows.create(workflow.clone(), first_instance.clone()).await? {
            return match self.workflows.find_active(&request.tenant_id, &request.document).await? {
                Some(existing) => Ok(StartOutcome::AlreadyInProgress(existing)),
                None => Err(DomainError::InvariantViolation(format!(
                    "workflow creation for document `{}` conflicted but no active workflow was found",
                    request.document.document_id
                ))
                .into()),
            };
        }

        info!(
            event_name = "approval.workflow.started",
            correlation_id = %audit.correlation_id,
            tenant_id = %workflow.tenant_id.0,
            workflow_id = %workflow.id.0,
            rule_id = %rule.id.0,
            document_id = %workflow.document.document_id,
            level_order = first_level.level_order,
            potential_approvers = first_instance.potential_approvers.len(),
            "approval workflow started"
        );
        self.audit.emit(
            audit
                .event(
                    Some(&workflow.id),
                    "approval.workflow.started",
                    AuditCategory::Workflow,
                    AuditOutcome::Success,
                )
                .with_metadata("rule_id", rule.id.0.clone())
                .with_metadata("document_type", workflow.document.document_type.0.clone())
                .with_metadata("document_id", workflow.document.document_id.clone())
                .with_metadata("level_order", first_level.level_order.to_string()),
        );

        self.announce(&workflow, &first_instance).await;
        Ok(StartOutcome::Started { workflow, first_instance })
    }

    pub async fn get_workflow_status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowView>, ApplicationError> {
        let Some(workflow) = self.workflows.find(workflow_id).await? else {
            return Ok(None);
        };
        let instances = self.workflows.list_instances(&workflow.id).await?;
        Ok(Some(WorkflowView { workflow, instances }))
    }

    pub async fn get_active_workflow(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<WorkflowView>, ApplicationError> {
        let Some(workflow) = self.workflows.find_active(tenant_id, document).await? else {
            return Ok(None);
        };
        let instances = self.workflows.list_instances(&workflow.id).await?;
        Ok(Some(WorkflowView { workflow, instances }))
    }

    /// Builds a pending instance for `level`, freezing its approvers.
    pub(crate) async fn open_instance(
        &self,
        workflow: &Workflow,
        level: &ApprovalLevel,
    ) -> Result<ApprovalInstance, ApplicationError> {
        let potential_approvers = self.resolver.resolve(&workflow.tenant_id, level).await?;
        if potential_approvers.is_empty() {
            warn!(
                event_name = "approval.instance.no_approvers",
                tenant_id = %workflow.tenant_id.0,
                workflow_id = %workflow.id.0,
                level_order = level.level_order,
                "level resolved to no potential approvers; only cancellation can end it"
            );
        }

        Ok(ApprovalInstance::open(
            ApprovalInstanceId(Uuid::new_v4().to_string()),
            workflow.id.clone(),
            level,
            potential_approvers,
            Utc::now(),
        ))
    }

    pub(crate) async fn announce(&self, workflow: &Workflow, instance: &ApprovalInstance) {
        let summary = match self.documents.summary(&workflow.tenant_id, &workflow.document).await {
            Ok(summary) => summary,
            Err(error) => {
                warn!(
                    event_name = "approval.notification.summary_unavailable",
                    workflow_id = %workflow.id.0,
                    error = %error,
                    "document summary unavailable; notifying without it"
                );
                None
            }
        };

        for approver in &instance.potential_approvers {
            dispatch_best_effort(
                self.notifications.as_ref(),
                Notification::ApprovalNeeded {
                    tenant_id: workflow.tenant_id.clone(),
                    user_id: approver.user_id.clone(),
                    email: approver.email.clone(),
                    workflow_id: workflow.id.clone(),
                    document: workflow.document.clone(),
                    summary: summary.clone(),
                    level_name: instance.level_name.clone(),
                },
            );
        }
    }

    /// Records `record` on the pending `instance` and, in the same write, either opens the next
    /// planned level or completes the workflow. The next instance is resolved before anything
    /// is written, so a failing lookup leaves the level pending. Returns `None` when another
    /// caller settled the level, or the workflow stopped, first.
    pub(crate) async fn settle_level(
        &self,
        workflow: &Workflow,
        instance: &ApprovalInstance,
        record: &DecisionRecord,
        audit: &AuditContext,
    ) -> Result<Option<Settled>, ApplicationError> {
        let next_level = match record.verdict {
            Verdict::Approved => workflow.next_level_after(instance.level_order).cloned(),
            Verdict::Rejected => None,
        };
        let settled = match next_level {
            Some(next_level) => Settled::Advanced {
                from_level: instance.level_order,
                next_instance: self.open_instance(workflow, &next_level).await?,
            },
            None => Settled::Completed {
                verdict: record.verdict,
                completion: WorkflowCompletion {
                    status: record.verdict.final_status(),
                    final_decision: record.verdict.decision(),
                    final_comment: record.comment.clone(),
                    completed_at: Utc::now(),
                },
            },
        };
        let resolution = match &settled {
            Settled::Advanced { next_instance, .. } => {
                LevelResolution::Advance(next_instance.clone())
            }
            Settled::Completed { completion, .. } => LevelResolution::Complete(completion.clone()),
        };

        if !self.workflows.resolve_level(&instance.id, record, &resolution).await? {
            warn!(
                event_name = "approval.level.settle_lost",
                correlation_id = %audit.correlation_id,
                workflow_id = %workflow.id.0,
                level_order = instance.level_order,
                "level was settled elsewhere before this decision could be stored"
            );
            return Ok(None);
        }
        Ok(Some(settled))
    }

    /// Logs, audits and notifies what a settled level did to the workflow.
    pub(crate) async fn publish(
        &self,
        workflow: &Workflow,
        settled: &Settled,
        audit: &AuditContext,
    ) {
        match settled {
            Settled::Advanced { from_level, next_instance } => {
                self.publish_advance(workflow, *from_level, next_instance, audit).await;
            }
            Settled::Completed { verdict, completion } => {
                self.publish_completion(workflow, *verdict, completion, audit).await;
            }
        }
    }

    async fn publish_advance(
        &self,
        workflow: &Workflow,
        from_level: u32,
        next_instance: &ApprovalInstance,
        audit: &AuditContext,
    ) {
        info!(
            event_name = "approval.level.advanced",
            correlation_id = %audit.correlation_id,
            tenant_id = %workflow.tenant_id.0,
            workflow_id = %workflow.id.0,
            from_level,
            to_level = next_instance.level_order,
            "approval workflow advanced to next level"
        );
        self.audit.emit(
            audit
                .event(
                    Some(&workflow.id),
                    "approval.level.advanced",
                    AuditCategory::Workflow,
                    AuditOutcome::Success,
                )
                .with_metadata("from_level", from_level.to_string())
                .with_metadata("to_level", next_instance.level_order.to_string()),
        );

        self.announce(workflow, next_instance).await;
    }

    async fn publish_completion(
        &self,
        workflow: &Workflow,
        verdict: Verdict,
        completion: &WorkflowCompletion,
        audit: &AuditContext,
    ) {
        info!(
            event_name = "approval.workflow.completed",
            correlation_id = %audit.correlation_id,
            tenant_id = %workflow.tenant_id.0,
            workflow_id = %workflow.id.0,
            status = completion.status.as_str(),
            "approval workflow completed"
        );
        self.audit.emit(
            audit
                .event(
                    Some(&workflow.id),
                    "approval.workflow.completed",
                    AuditCategory::Workflow,
                    AuditOutcome::Success,
                )
                .with_metadata("status", completion.status.as_str()),
        );

        let document_status = match verdict {
            Verdict::Approved => DocumentApprovalStatus::Approved,
            Verdict::Rejected => DocumentApprovalStatus::Rejected,
        };
        if let Err(sync_error) = self
            .documents
            .set_approval_status(&workflow.tenant_id, &workflow.document, document_status)
            .await
        {
            error!(
                event_name = "approval.document.status_sync_failed",
                correlation_id = %audit.correlation_id,
                workflow_id = %workflow.id.0,
                document_id = %workflow.document.document_id,
                error = %sync_error,
                "workflow completed but document status could not be updated"
            );
            self.audit.emit(
                audit
                    .event(
                        Some(&workflow.id),
                        "approval.document.status_sync_failed",
                        AuditCategory::Document,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("status", document_status.as_str())
                    .with_metadata("error", sync_error.to_string()),
            );
        }

        dispatch_best_effort(
            self.notifications.as_ref(),
            Notification::WorkflowCompleted {
                tenant_id: workflow.tenant_id.clone(),
                user_id: workflow.initiated_by.clone(),
                workflow_id: workflow.id.clone(),
                document: workflow.document.clone(),
                status: completion.status,
                comment: completion.final_comment.clone(),
            },
        );
    }
}

