use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};
use tracing::debug;

use procure_core::approvals::ports::WorkflowRepository;
use procure_core::domain::document::{DocumentRef, DocumentType};
use procure_core::domain::identity::{TenantId, UserId};
use procure_core::domain::rule::{ApprovalLevel, ApprovalMode, LevelType, RuleId};
use procure_core::domain::workflow::{
    ApprovalInstance, ApprovalInstanceId, ApproverVote, Decision, DecisionRecord,
    LevelResolution, PotentialApprover, Verdict, Workflow, WorkflowId, WorkflowStatus,
};
use procure_core::errors::ApplicationError;

use super::{
    is_unique_violation, parse_enum, parse_optional_timestamp, parse_timestamp, parse_u32,
    RepositoryError,
};
use crate::DbPool;

const WORKFLOW_COLUMNS: &str = "id, tenant_id, rule_id, document_type, document_id, status,
    current_level, requires_spec_approval, plan_json, initiated_by, created_at, completed_at,
    final_decision, final_comment";

const INSTANCE_COLUMNS: &str = "id, workflow_id, level_order, level_name, level_type,
    approval_mode, potential_approvers_json, decision, decided_by, on_behalf_of, comment,
    decided_at, created_at";

pub struct SqlWorkflowRepository {
    pool: DbPool,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_workflow(
        &self,
        workflow: &Workflow,
        first_instance: &ApprovalInstance,
    ) -> Result<bool, RepositoryError> {
        let plan_json = serde_json::to_string(&workflow.plan).map_err(|error| {
            RepositoryError::Decode(format!("plan is not serializable: {error}"))
        })?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO approval_workflow (id, tenant_id, rule_id, document_type, document_id,
                                            status, current_level, requires_spec_approval,
                                            plan_json, initiated_by, created_at, completed_at,
                                            final_decision, final_comment)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow.id.0)
        .bind(&workflow.tenant_id.0)
        .bind(&workflow.rule_id.0)
        .bind(&workflow.document.document_type.0)
        .bind(&workflow.document.document_id)
        .bind(workflow.status.as_str())
        .bind(i64::from(workflow.current_level))
        .bind(workflow.requires_spec_approval)
        .bind(plan_json)
        .bind(&workflow.initiated_by.0)
        .bind(workflow.created_at.to_rfc3339())
        .bind(workflow.completed_at.map(|at| at.to_rfc3339()))
        .bind(workflow.final_decision.map(|decision| decision.as_str()))
        .bind(&workflow.final_comment)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                debug!(
                    event_name = "approval.workflow.duplicate_refused",
                    document_id = %workflow.document.document_id,
                    "document already has an in-progress workflow"
                );
                return Ok(false);
            }
            Err(error) => return Err(error.into()),
        }

        insert_instance(&mut tx, first_instance).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn fetch_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {WORKFLOW_COLUMNS} FROM approval_workflow WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(workflow_from_row).transpose()
    }

    async fn fetch_active(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM approval_workflow
             WHERE tenant_id = ? AND document_type = ? AND document_id = ?
               AND status = 'in_progress'"
        ))
        .bind(&tenant_id.0)
        .bind(&document.document_type.0)
        .bind(&document.document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(workflow_from_row).transpose()
    }

    async fn fetch_in_progress(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM approval_workflow
             WHERE tenant_id = ? AND status = 'in_progress'
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(workflow_from_row).collect()
    }

    async fn fetch_instances(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM approval_instance
             WHERE workflow_id = ?
             ORDER BY level_order ASC"
        ))
        .bind(&workflow_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut instances = rows.into_iter().map(instance_from_row).collect::<Result<Vec<_>, _>>()?;

        let vote_rows = sqlx::query(
            "SELECT v.instance_id, v.voter_id, v.decided_by, v.verdict, v.comment, v.voted_at
             FROM approval_vote v JOIN approval_instance i ON i.id = v.instance_id
             WHERE i.workflow_id = ?
             ORDER BY v.voted_at ASC, v.voter_id ASC",
        )
        .bind(&workflow_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut votes: HashMap<String, Vec<ApproverVote>> = HashMap::new();
        for row in vote_rows {
            let instance_id: String = row.try_get("instance_id")?;
            votes.entry(instance_id).or_default().push(vote_from_row(&row)?);
        }
        for instance in &mut instances {
            instance.votes = votes.remove(&instance.id.0).unwrap_or_default();
        }
        Ok(instances)
    }

    async fn insert_vote(
        &self,
        instance_id: &ApprovalInstanceId,
        vote: &ApproverVote,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO approval_vote
                 (instance_id, voter_id, decided_by, verdict, comment, voted_at)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE EXISTS (
                 SELECT 1 FROM approval_instance i
                 JOIN approval_workflow w ON w.id = i.workflow_id
                 WHERE i.id = ? AND i.decision = 'pending' AND w.status = 'in_progress'
             )",
        )
        .bind(&instance_id.0)
        .bind(&vote.voter_id.0)
        .bind(&vote.decided_by.0)
        .bind(vote.verdict.as_str())
        .bind(&vote.comment)
        .bind(vote.voted_at.to_rfc3339())
        .bind(&instance_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn settle(
        &self,
        instance_id: &ApprovalInstanceId,
        record: &DecisionRecord,
        resolution: &LevelResolution,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let decided = sqlx::query(
            "UPDATE approval_instance
             SET decision = ?, decided_by = ?, on_behalf_of = ?, comment = ?, decided_at = ?
             WHERE id = ?
               AND decision = 'pending'
               AND EXISTS (
                   SELECT 1 FROM approval_workflow w
                   WHERE w.id = approval_instance.workflow_id
                     AND w.status = 'in_progress'
                     AND w.current_level = approval_instance.level_order
               )",
        )
        .bind(record.verdict.as_str())
        .bind(&record.decided_by.0)
        .bind(record.on_behalf_of.as_ref().map(|user| user.0.as_str()))
        .bind(&record.comment)
        .bind(record.decided_at.to_rfc3339())
        .bind(&instance_id.0)
        .execute(&mut *tx)
        .await?;
        if decided.rows_affected() == 0 {
            return Ok(false);
        }

        let row = sqlx::query("SELECT workflow_id, level_order FROM approval_instance WHERE id = ?")
            .bind(&instance_id.0)
            .fetch_one(&mut *tx)
            .await?;
        let workflow_id: String = row.try_get("workflow_id")?;
        let level_order = parse_u32("level_order", row.try_get("level_order")?)?;

        let moved = match resolution {
            LevelResolution::Advance(next_instance) => {
                let moved = sqlx::query(
                    "UPDATE approval_workflow SET current_level = ?
                     WHERE id = ? AND status = 'in_progress' AND current_level = ?",
                )
                .bind(i64::from(next_instance.level_order))
                .bind(&workflow_id)
                .bind(i64::from(level_order))
                .execute(&mut *tx)
                .await?;
                if moved.rows_affected() == 1 {
                    insert_instance(&mut tx, next_instance).await?;
                }
                moved.rows_affected()
            }
            LevelResolution::Complete(completion) => sqlx::query(
                "UPDATE approval_workflow
                 SET status = ?, final_decision = ?, final_comment = ?, completed_at = ?
                 WHERE id = ? AND status = 'in_progress' AND current_level = ?",
            )
            .bind(completion.status.as_str())
            .bind(completion.final_decision.as_str())
            .bind(&completion.final_comment)
            .bind(completion.completed_at.to_rfc3339())
            .bind(&workflow_id)
            .bind(i64::from(level_order))
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };
        if moved == 0 {
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn cancel_in_progress(
        &self,
        workflow_id: &WorkflowId,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<usize>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let cancelled = sqlx::query(
            "UPDATE approval_workflow SET status = 'cancelled', completed_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(cancelled_at.to_rfc3339())
        .bind(&workflow_id.0)
        .execute(&mut *tx)
        .await?;
        if cancelled.rows_affected() == 0 {
            return Ok(None);
        }

        let skipped = sqlx::query(
            "UPDATE approval_instance SET decision = 'skipped'
             WHERE workflow_id = ? AND decision = 'pending'",
        )
        .bind(&workflow_id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(skipped.rows_affected() as usize))
    }
}

#[async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn create(
        &self,
        workflow: Workflow,
        first_instance: ApprovalInstance,
    ) -> Result<bool, ApplicationError> {
        Ok(self.insert_workflow(&workflow, &first_instance).await?)
    }

    async fn find(&self, id: &WorkflowId) -> Result<Option<Workflow>, ApplicationError> {
        Ok(self.fetch_workflow(id).await?)
    }

    async fn find_active(
        &self,
        tenant_id: &TenantId,
        document: &DocumentRef,
    ) -> Result<Option<Workflow>, ApplicationError> {
        Ok(self.fetch_active(tenant_id, document).await?)
    }

    async fn list_in_progress(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Workflow>, ApplicationError> {
        Ok(self.fetch_in_progress(tenant_id).await?)
    }

    async fn list_instances(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<ApprovalInstance>, ApplicationError> {
        Ok(self.fetch_instances(workflow_id).await?)
    }

    async fn record_vote(
        &self,
        instance_id: &ApprovalInstanceId,
        vote: &ApproverVote,
    ) -> Result<bool, ApplicationError> {
        Ok(self.insert_vote(instance_id, vote).await?)
    }

    async fn resolve_level(
        &self,
        instance_id: &ApprovalInstanceId,
        record: &DecisionRecord,
        resolution: &LevelResolution,
    ) -> Result<bool, ApplicationError> {
        Ok(self.settle(instance_id, record, resolution).await?)
    }

    async fn cancel(
        &self,
        workflow_id: &WorkflowId,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<usize>, ApplicationError> {
        Ok(self.cancel_in_progress(workflow_id, cancelled_at).await?)
    }
}

async fn insert_instance(
    tx: &mut Transaction<'_, Sqlite>,
    instance: &ApprovalInstance,
) -> Result<(), RepositoryError> {
    let approvers_json = serde_json::to_string(&instance.potential_approvers).map_err(|error| {
        RepositoryError::Decode(format!("potential approvers are not serializable: {error}"))
    })?;

    sqlx::query(
        "INSERT INTO approval_instance (id, workflow_id, level_order, level_name, level_type,
                                        approval_mode, potential_approvers_json, decision,
                                        decided_by, on_behalf_of, comment, decided_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&instance.id.0)
    .bind(&instance.workflow_id.0)
    .bind(i64::from(instance.level_order))
    .bind(&instance.level_name)
    .bind(instance.level_type.as_str())
    .bind(instance.approval_mode.as_str())
    .bind(approvers_json)
    .bind(instance.decision.as_str())
    .bind(instance.decided_by.as_ref().map(|user| user.0.as_str()))
    .bind(instance.on_behalf_of.as_ref().map(|user| user.0.as_str()))
    .bind(&instance.comment)
    .bind(instance.decided_at.map(|at| at.to_rfc3339()))
    .bind(instance.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn workflow_from_row(row: SqliteRow) -> Result<Workflow, RepositoryError> {
    let plan_json: String = row.try_get("plan_json")?;
    let plan: Vec<ApprovalLevel> = serde_json::from_str(&plan_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid plan_json: {error}")))?;
    let final_decision = row
        .try_get::<Option<String>, _>("final_decision")?
        .map(|value| parse_enum("final decision", value, Decision::parse))
        .transpose()?;

    Ok(Workflow {
        id: WorkflowId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        rule_id: RuleId(row.try_get("rule_id")?),
        document: DocumentRef::new(
            DocumentType(row.try_get("document_type")?),
            row.try_get::<String, _>("document_id")?,
        ),
        status: parse_enum("workflow status", row.try_get("status")?, WorkflowStatus::parse)?,
        current_level: parse_u32("current_level", row.try_get("current_level")?)?,
        requires_spec_approval: row.try_get("requires_spec_approval")?,
        plan,
        initiated_by: UserId(row.try_get("initiated_by")?),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        final_decision,
        final_comment: row.try_get("final_comment")?,
    })
}

fn instance_from_row(row: SqliteRow) -> Result<ApprovalInstance, RepositoryError> {
    let approvers_json: String = row.try_get("potential_approvers_json")?;
    let potential_approvers: Vec<PotentialApprover> = serde_json::from_str(&approvers_json)
        .map_err(|error| {
            RepositoryError::Decode(format!("invalid potential_approvers_json: {error}"))
        })?;

    Ok(ApprovalInstance {
        id: ApprovalInstanceId(row.try_get("id")?),
        workflow_id: WorkflowId(row.try_get("workflow_id")?),
        level_order: parse_u32("level_order", row.try_get("level_order")?)?,
        level_name: row.try_get("level_name")?,
        level_type: parse_enum("level type", row.try_get("level_type")?, LevelType::parse)?,
        approval_mode: parse_enum(
            "approval mode",
            row.try_get("approval_mode")?,
            ApprovalMode::parse,
        )?,
        potential_approvers,
        decision: parse_enum("decision", row.try_get("decision")?, Decision::parse)?,
        decided_by: row.try_get::<Option<String>, _>("decided_by")?.map(UserId),
        on_behalf_of: row.try_get::<Option<String>, _>("on_behalf_of")?.map(UserId),
        comment: row.try_get("comment")?,
        decided_at: parse_optional_timestamp("decided_at", row.try_get("decided_at")?)?,
        votes: Vec::new(),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn vote_from_row(row: &SqliteRow) -> Result<ApproverVote, RepositoryError> {
    Ok(ApproverVote {
        voter_id: UserId(row.try_get("voter_id")?),
        decided_by: UserId(row.try_get("decided_by")?),
        verdict: parse_enum("verdict", row.try_get("verdict")?, Verdict::parse)?,
        comment: row.try_get("comment")?,
        voted_at: parse_timestamp("voted_at", row.try_get("voted_at")?)?,
    })
}
