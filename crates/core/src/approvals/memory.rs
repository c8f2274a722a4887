use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::ports::{
    DelegationRepository, Directory, DocumentStore, RuleRepository, WorkflowRepository,
};
use crate::domain::delegation::{Delegation, DelegationId, DelegationInsert};
use crate::domain::document::{DocumentApprovalStatus, DocumentRef, DocumentSummary, DocumentType};
use crate::domain::identity::{DirectoryUser, TenantId, UserId};
use crate::domain::rule::ApprovalRule;
use crate::domain::workflow::{
    ApprovalInstance, ApprovalInstanceId, ApproverVote, Decision, DecisionRecord, LevelResolution,
    Workflow, WorkflowId, WorkflowStatus,
};
use crate::errors::ApplicationError;

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<Vec<ApprovalRule>>,
}

impl InMemoryRuleRepository {
    pub fn with_rules(rules: Vec<ApprovalRule>) -> Self {
        Self { rules: RwLock::new(rules) }
    }

    pub async fn insert(&self, rule: ApprovalRule) {
        self.rules.write().await.push(rule);
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn list_active_rules(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
    ) -> Result<Vec<ApprovalRule>, ApplicationError> {
        let rules = self.rules.read().await;
        Ok(rules
            .iter()
            .filter(|rule| {
                rule.is_active
                    && &rule.tenant_id == tenant_id
                    && &rule.document_type == document_type
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct WorkflowState {
    workflows: HashMap<WorkflowId, Workflow>,
    instances: HashMap<ApprovalInstanceId, ApprovalInstance>,
}

impl WorkflowState {
    fn in_progress_at(&self, workflow_id: &WorkflowId, level_order: u32) -> bool {
        self.workflows.get(workflow_id).is_some_and(|workflow| {
            workflow.status == WorkflowStatus::InProgress && workflow.current_level == level_order
        })
    }
}

/// Every mutation runs under one write lock, which makes each conditional update atomic.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    state: RwLock<WorkflowState>,
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create(
        &self,
        workflow: Workflow,
        first_instance: ApprovalInstance,
    ) -> Result<bool, ApplicationError> {
        let mut state = self.state.write().await;
        let duplicate = state.workflows.values().any(|existing| {
            existing.status == WorkflowStatus::InProgress
                && existing.tenant_id == workflow.tenant_id
                && existing.document == workflow.document
        });
        if duplicate {
            return Ok(false);
        }

        state.instances.insert(first_instance.id.clone(), first_instance);
        state.workflows.insert(workflow.id.clone(), workflow);
        Ok(true)
    }

    async fn find(&self, id: &WorkflowId) -> Result<Option<Workflow>, ApplicationError> {
        Ok(self.state.read().await.workflows.get(id).cloned())
    }

    async fn find_active(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<Workflow>, ApplicationError> {
        let state = self.state.read().await;
        Ok(state
            .workflows
            .values()
            .find(|workflow| {
                workflow.status == WorkflowStatus::InProgress
                    && &workflow.tenant_id == tenant_id
                    && &workflow.document == document
            })
            .cloned())
    }

    async fn list_in_progress(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Workflow>, ApplicationError> {
        let state = self.state.read().await;
        let mut workflows: Vec<Workflow> = state
            .workflows
            .values()
            .filter(|workflow| {
                workflow.status == WorkflowStatus::InProgress && &workflow.tenant_id == tenant_id
            })
            .cloned()
            .collect();
        workflows.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(workflows)
    }

    async fn list_instances(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<ApprovalInstance>, ApplicationError> {
        let state = self.state.read().await;
        let mut instances: Vec<ApprovalInstance> = state
            .instances
            .values()
            .filter(|instance| &instance.workflow_id == workflow_id)
            .cloned()
            .collect();
        instances.sort_by_key(|instance| instance.level_order);
        Ok(instances)
    }

    async fn record_vote(
        &self,
        instance_id: &ApprovalInstanceId,
        vote: &ApproverVote,
    ) -> Result<bool, ApplicationError> {
        let mut state = self.state.write().await;
        let Some(instance) = state.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if !instance.is_pending() || instance.has_vote_from(&vote.voter_id) {
            return Ok(false);
        }

        instance.votes.push(vote.clone());
        Ok(true)
    }

    async fn resolve_level(
        &self,
        instance_id: &ApprovalInstanceId,
        record: &DecisionRecord,
        resolution: &LevelResolution,
    ) -> Result<bool, ApplicationError> {
        let mut state = self.state.write().await;
        let Some((workflow_id, level_order)) = state
            .instances
            .get(instance_id)
            .filter(|instance| instance.is_pending())
            .map(|instance| (instance.workflow_id.clone(), instance.level_order))
        else {
            return Ok(false);
        };
        if !state.in_progress_at(&workflow_id, level_order) {
            return Ok(false);
        }

        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.decision = record.verdict.decision();
            instance.decided_by = Some(record.decided_by.clone());
            instance.on_behalf_of = record.on_behalf_of.clone();
            instance.comment = record.comment.clone();
            instance.decided_at = Some(record.decided_at);
        }
        if let Some(workflow) = state.workflows.get_mut(&workflow_id) {
            match resolution {
                LevelResolution::Advance(next_instance) => {
                    workflow.current_level = next_instance.level_order;
                }
                LevelResolution::Complete(completion) => {
                    workflow.status = completion.status;
                    workflow.final_decision = Some(completion.final_decision);
                    workflow.final_comment = completion.final_comment.clone();
                    workflow.completed_at = Some(completion.completed_at);
                }
            }
        }
        if let LevelResolution::Advance(next_instance) = resolution {
            state.instances.insert(next_instance.id.clone(), next_instance.clone());
        }
        Ok(true)
    }

    async fn cancel(
        &self,
        workflow_id: &WorkflowId,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<usize>, ApplicationError> {
        let mut state = self.state.write().await;
        let Some(workflow) = state.workflows.get_mut(workflow_id) else {
            return Ok(None);
        };
        if workflow.status != WorkflowStatus::InProgress {
            return Ok(None);
        }

        workflow.status = WorkflowStatus::Cancelled;
        workflow.completed_at = Some(cancelled_at);

        let mut skipped = 0;
        for instance in state.instances.values_mut() {
            if &instance.workflow_id == workflow_id && instance.is_pending() {
                instance.decision = Decision::Skipped;
                skipped += 1;
            }
        }
        Ok(Some(skipped))
    }
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<(TenantId, DocumentRef), DocumentSummary>>,
    statuses: RwLock<HashMap<(TenantId, DocumentRef), DocumentApprovalStatus>>,
}

impl InMemoryDocumentStore {
    pub async fn insert(&self, tenant_id: TenantId, summary: DocumentSummary) {
        self.documents.write().await.insert((tenant_id, summary.document.clone()), summary);
    }

    pub async fn approval_status(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Option<DocumentApprovalStatus> {
        self.statuses.read().await.get(&(tenant_id.clone(), document.clone())).copied()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn summary(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<DocumentSummary>, ApplicationError> {
        Ok(self.documents.read().await.get(&(tenant_id.clone(), document.clone())).cloned())
    }

    async fn set_approval_status(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
        status: DocumentApprovalStatus,
    ) -> Result<(), ApplicationError> {
        self.statuses.write().await.insert((tenant_id.clone(), document.clone()), status);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDirectory {
    members: RwLock<HashMap<TenantId, Vec<DirectoryUser>>>,
}

impl InMemoryDirectory {
    pub async fn insert(&self, tenant_id: TenantId, user: DirectoryUser) {
        let mut members = self.members.write().await;
        let tenant_members = members.entry(tenant_id).or_default();
        tenant_members.retain(|existing| existing.user_id != user.user_id);
        tenant_members.push(user);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn find_user(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
    ) -> Result<Option<DirectoryUser>, ApplicationError> {
        let members = self.members.read().await;
        Ok(members
            .get(tenant_id)
            .and_then(|users| users.iter().find(|user| &user.user_id == user_id))
            .cloned())
    }

    async fn list_active_members_with_role(
        &self,
        tenant_id: &TenantId,
        role: &str,
    ) -> Result<Vec<DirectoryUser>, ApplicationError> {
        let members = self.members.read().await;
        Ok(members
            .get(tenant_id)
            .map(|users| {
                users.iter().filter(|user| user.is_active && user.has_role(role)).cloned().collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryDelegationRepository {
    delegations: RwLock<Vec<Delegation>>,
}

#[async_trait]
impl DelegationRepository for InMemoryDelegationRepository {
    async fn insert_if_no_overlap(
        &self,
        delegation: Delegation,
    ) -> Result<DelegationInsert, ApplicationError> {
        let mut delegations = self.delegations.write().await;
        if let Some(existing) = delegations.iter().find(|existing| {
            existing.delegator_id == delegation.delegator_id
                && existing.tenant_id == delegation.tenant_id
                && existing.overlaps(delegation.start_date, delegation.end_date)
        }) {
            return Ok(DelegationInsert::Overlaps(existing.clone()));
        }

        delegations.push(delegation);
        Ok(DelegationInsert::Inserted)
    }

    async fn find(&self, id: &DelegationId) -> Result<Option<Delegation>, ApplicationError> {
        Ok(self.delegations.read().await.iter().find(|delegation| &delegation.id == id).cloned())
    }

    async fn deactivate(&self, id: &DelegationId) -> Result<bool, ApplicationError> {
        let mut delegations = self.delegations.write().await;
        match delegations.iter_mut().find(|delegation| &delegation.id == id) {
            Some(delegation) if delegation.is_active => {
                delegation.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Delegation>, ApplicationError> {
        let delegations = self.delegations.read().await;
        let mut matching: Vec<Delegation> = delegations
            .iter()
            .filter(|delegation| {
                &delegation.tenant_id == tenant_id
                    && (&delegation.delegator_id == user_id || &delegation.delegate_id == user_id)
            })
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
        });
        Ok(matching)
    }

    async fn list_active_for_delegate(
        &self,
        delegate_id: &UserId,
        tenant_id: &TenantId,
        on: NaiveDate,
    ) -> Result<Vec<Delegation>, ApplicationError> {
        let delegations = self.delegations.read().await;
        Ok(delegations
            .iter()
            .filter(|delegation| {
                &delegation.delegate_id == delegate_id
                    && &delegation.tenant_id == tenant_id
                    && delegation.covers(on)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{InMemoryDirectory, InMemoryRuleRepository, InMemoryWorkflowRepository};
    use crate::approvals::ports::{Directory, RuleRepository, WorkflowRepository};
    use crate::domain::document::{DocumentRef, DocumentType};
    use crate::domain::identity::{DirectoryUser, TenantId, UserId};
    use crate::domain::rule::{
        ApprovalLevel, ApprovalMode, ApprovalRule, ApproverSpec, LevelType, RuleId,
    };
    use crate::domain::workflow::{
        ApprovalInstance, ApprovalInstanceId, Decision, DecisionRecord, LevelResolution, Verdict,
        Workflow, WorkflowCompletion, WorkflowId, WorkflowStatus,
    };

    fn level() -> ApprovalLevel {
        ApprovalLevel {
            level_order: 1,
            name: "Manager".to_string(),
            mode: ApprovalMode::Any,
            level_type: LevelType::General,
            approvers: vec![ApproverSpec::Role("manager".to_string())],
        }
    }

    fn workflow(id: &str) -> Workflow {
        Workflow {
            id: WorkflowId(id.to_string()),
            tenant_id: TenantId("tenant-a".to_string()),
            rule_id: RuleId("rule-1".to_string()),
            document: DocumentRef::new(DocumentType::purchase_request(), "PR-1"),
            status: WorkflowStatus::InProgress,
            current_level: 1,
            requires_spec_approval: false,
            plan: vec![level()],
            initiated_by: UserId("requester".to_string()),
            created_at: Utc::now(),
            completed_at: None,
            final_decision: None,
            final_comment: None,
        }
    }

    fn instance(id: &str, workflow_id: &str) -> ApprovalInstance {
        ApprovalInstance::open(
            ApprovalInstanceId(id.to_string()),
            WorkflowId(workflow_id.to_string()),
            &level(),
            Vec::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn second_in_progress_workflow_for_same_document_is_refused() {
        let repo = InMemoryWorkflowRepository::default();

        assert!(repo.create(workflow("wf-1"), instance("i-1", "wf-1")).await.expect("create"));
        assert!(!repo.create(workflow("wf-2"), instance("i-2", "wf-2")).await.expect("create"));

        let cancelled = repo.cancel(&WorkflowId("wf-1".to_string()), Utc::now()).await;
        assert_eq!(cancelled, Ok(Some(1)));
        assert!(repo.create(workflow("wf-3"), instance("i-3", "wf-3")).await.expect("create"));
    }

    #[tokio::test]
    async fn cancel_skips_only_pending_instances() {
        let repo = InMemoryWorkflowRepository::default();
        repo.create(workflow("wf-1"), instance("i-1", "wf-1")).await.expect("create");

        repo.cancel(&WorkflowId("wf-1".to_string()), Utc::now()).await.expect("cancel");
        let second = repo.cancel(&WorkflowId("wf-1".to_string()), Utc::now()).await;

        let instances =
            repo.list_instances(&WorkflowId("wf-1".to_string())).await.expect("instances");
        assert_eq!(instances[0].decision, Decision::Skipped);
        assert_eq!(second, Ok(None));
    }

    fn approval(by: &str) -> (DecisionRecord, LevelResolution) {
        let record = DecisionRecord {
            verdict: Verdict::Approved,
            decided_by: UserId(by.to_string()),
            on_behalf_of: None,
            comment: None,
            decided_at: Utc::now(),
        };
        let resolution = LevelResolution::Complete(WorkflowCompletion {
            status: WorkflowStatus::Approved,
            final_decision: Decision::Approved,
            final_comment: None,
            completed_at: Utc::now(),
        });
        (record, resolution)
    }

    #[tokio::test]
    async fn level_settles_once_and_only_at_the_current_level() {
        let repo = InMemoryWorkflowRepository::default();
        let mut moved_on = workflow("wf-2");
        moved_on.document = DocumentRef::new(DocumentType::purchase_request(), "PR-2");
        moved_on.current_level = 2;
        repo.create(workflow("wf-1"), instance("i-1", "wf-1")).await.expect("create");
        repo.create(moved_on, instance("i-2", "wf-2")).await.expect("create");

        let (record, resolution) = approval("alice");
        let first = ApprovalInstanceId("i-1".to_string());
        assert_eq!(repo.resolve_level(&first, &record, &resolution).await, Ok(true));
        assert_eq!(repo.resolve_level(&first, &record, &resolution).await, Ok(false));
        let stale = ApprovalInstanceId("i-2".to_string());
        assert_eq!(repo.resolve_level(&stale, &record, &resolution).await, Ok(false));

        let settled = repo.find(&WorkflowId("wf-1".to_string())).await.expect("find");
        assert_eq!(settled.map(|workflow| workflow.status), Some(WorkflowStatus::Approved));
        let untouched =
            repo.list_instances(&WorkflowId("wf-2".to_string())).await.expect("instances");
        assert_eq!(untouched[0].decision, Decision::Pending);
    }

    #[tokio::test]
    async fn rule_listing_filters_inactive_and_foreign_rules() {
        let active = ApprovalRule {
            id: RuleId("rule-1".to_string()),
            tenant_id: TenantId("tenant-a".to_string()),
            name: "Default".to_string(),
            document_type: DocumentType::purchase_request(),
            purchase_type: None,
            min_amount: None,
            max_amount: Some(Decimal::new(1_000, 0)),
            priority: 1,
            is_active: true,
            levels: vec![level()],
            created_at: Utc::now(),
        };
        let mut inactive = active.clone();
        inactive.id = RuleId("rule-2".to_string());
        inactive.is_active = false;
        let mut foreign = active.clone();
        foreign.id = RuleId("rule-3".to_string());
        foreign.tenant_id = TenantId("tenant-b".to_string());

        let repo = InMemoryRuleRepository::with_rules(vec![active, inactive, foreign]);
        let rules = repo
            .list_active_rules(&TenantId("tenant-a".to_string()), &DocumentType::purchase_request())
            .await
            .expect("list rules");

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id.0, "rule-1");
    }

    #[tokio::test]
    async fn directory_role_lookup_skips_inactive_members() {
        let directory = InMemoryDirectory::default();
        let tenant = TenantId("tenant-a".to_string());
        for (id, active) in [("u-1", true), ("u-2", false)] {
            directory
                .insert(
                    tenant.clone(),
                    DirectoryUser {
                        user_id: UserId(id.to_string()),
                        name: id.to_string(),
                        email: format!("{id}@example.test"),
                        roles: vec!["Manager".to_string()],
                        is_active: active,
                    },
                )
                .await;
        }

        let managers =
            directory.list_active_members_with_role(&tenant, "manager").await.expect("lookup");
        assert_eq!(managers.len(), 1);
        assert_eq!(managers[0].user_id.0, "u-1");
    }
}
