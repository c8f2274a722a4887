use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::decision::{
    CancelOutcome, DecisionOutcome, DecisionProcessor, DecisionRequest, PendingApproval,
};
use super::delegation::{
    CancelDelegationOutcome, CreateDelegationOutcome, CreateDelegationRequest, DelegationManager,
};
use super::matcher::RuleMatcher;
use super::notify::NotificationDispatcher;
use super::orchestrator::{StartOutcome, StartWorkflowRequest, WorkflowOrchestrator, WorkflowView};
use super::ports::{
    DelegationRepository, Directory, DocumentStore, RuleRepository, WorkflowRepository,
};
use super::resolver::{ApproverResolver, DirectoryApproverResolver};
use crate::audit::AuditSink;
use crate::config::{ApprovalsConfig, DelegationPolicy};
use crate::domain::delegation::{Delegation, DelegationId};
use crate::domain::document::DocumentRef;
use crate::domain::identity::{TenantId, UserId};
use crate::domain::workflow::WorkflowId;
use crate::errors::ApplicationError;

/// Every collaborator the engine talks to.
#[derive(Clone)]
pub struct ApprovalServices {
    pub rules: Arc<dyn RuleRepository>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub documents: Arc<dyn DocumentStore>,
    pub directory: Arc<dyn Directory>,
    pub delegations: Arc<dyn DelegationRepository>,
    pub notifications: Arc<dyn NotificationDispatcher>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub delegation_policy: DelegationPolicy,
}

impl From<&ApprovalsConfig> for EngineSettings {
    fn from(config: &ApprovalsConfig) -> Self {
        Self { delegation_policy: config.delegation_policy }
    }
}

/// Starts a workflow for a document already known to the document store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDocumentRequest {
    pub tenant_id: TenantId,
    pub document: DocumentRef,
    pub requires_spec_approval: bool,
    pub initiated_by: UserId,
}

/// The operations exposed to request handlers.
pub struct ApprovalEngine {
    documents: Arc<dyn DocumentStore>,
    orchestrator: Arc<WorkflowOrchestrator>,
    decisions: DecisionProcessor,
    delegations: Arc<DelegationManager>,
}

impl ApprovalEngine {
    pub fn new(services: ApprovalServices, settings: EngineSettings) -> Self {
        let resolver: Arc<dyn ApproverResolver> =
            Arc::new(DirectoryApproverResolver::new(services.directory.clone()));
        Self::with_resolver(services, resolver, settings)
    }

    pub fn with_resolver(
        services: ApprovalServices,
        resolver: Arc<dyn ApproverResolver>,
        settings: EngineSettings,
    ) -> Self {
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            RuleMatcher::new(services.rules.clone()),
            services.workflows.clone(),
            services.documents.clone(),
            resolver,
            services.notifications.clone(),
            services.audit.clone(),
        ));
        let delegations = Arc::new(DelegationManager::new(
            services.delegations.clone(),
            services.notifications.clone(),
            services.audit.clone(),
        ));
        let decisions = DecisionProcessor::new(
            services.workflows.clone(),
            services.documents.clone(),
            orchestrator.clone(),
            delegations.clone(),
            services.audit.clone(),
            settings.delegation_policy,
        );

        Self { documents: services.documents, orchestrator, decisions, delegations }
    }

    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartOutcome, ApplicationError> {
        self.orchestrator.start_workflow(request).await
    }

    /// Reads amount and purchase type from the document store, then starts the workflow.
    pub async fn submit_document(
        &self,
        request: SubmitDocumentRequest,
    ) -> Result<StartOutcome, ApplicationError> {
        let Some(summary) = self.documents.summary(&request.tenant_id, &request.document).await?
        else {
            return Ok(StartOutcome::DocumentNotFound);
        };

        self.orchestrator
            .start_workflow(StartWorkflowRequest {
                tenant_id: request.tenant_id,
                document: request.document,
                amount: summary.amount,
                purchase_type: summary.purchase_type,
                requires_spec_approval: request.requires_spec_approval,
                initiated_by: request.initiated_by,
            })
            .await
    }

    pub async fn process_decision(
        &self,
        request: DecisionRequest,
    ) -> Result<DecisionOutcome, ApplicationError> {
        self.decisions.process_decision(request).await
    }

    pub async fn cancel_workflow(
        &self,
        workflow_id: &WorkflowId,
        cancelled_by: &UserId,
    ) -> Result<CancelOutcome, ApplicationError> {
        self.decisions.cancel_workflow(workflow_id, cancelled_by).await
    }

    pub async fn get_workflow_status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowView>, ApplicationError> {
        self.orchestrator.get_workflow_status(workflow_id).await
    }

    pub async fn get_active_workflow(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<WorkflowView>, ApplicationError> {
        self.orchestrator.get_active_workflow(tenant_id, document).await
    }

    pub async fn get_pending_approvals(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<PendingApproval>, ApplicationError> {
        self.decisions.get_pending_approvals(user_id, tenant_id).await
    }

    pub async fn create_delegation(
        &self,
        request: CreateDelegationRequest,
    ) -> Result<CreateDelegationOutcome, ApplicationError> {
        self.delegations.create_delegation(request).await
    }

    pub async fn cancel_delegation(
        &self,
        delegation_id: &DelegationId,
    ) -> Result<CancelDelegationOutcome, ApplicationError> {
        self.delegations.cancel_delegation(delegation_id).await
    }

    pub async fn get_user_delegations(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Delegation>, ApplicationError> {
        self.delegations.get_user_delegations(user_id, tenant_id).await
    }
}
