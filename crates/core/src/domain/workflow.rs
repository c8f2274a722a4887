use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::document::DocumentRef;
use crate::domain::identity::{TenantId, UserId};
use crate::domain::rule::{ApprovalLevel, ApprovalMode, LevelType, RuleId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApprovalInstanceId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Approved,
    Rejected,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
    /// Never decided because the workflow was cancelled.
    Skipped,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// The two decisions an approver can submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        self.decision().as_str()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match Decision::parse(value)? {
            Decision::Approved => Some(Self::Approved),
            Decision::Rejected => Some(Self::Rejected),
            Decision::Pending | Decision::Skipped => None,
        }
    }

    pub fn decision(&self) -> Decision {
        match self {
            Self::Approved => Decision::Approved,
            Self::Rejected => Decision::Rejected,
        }
    }

    pub fn final_status(&self) -> WorkflowStatus {
        match self {
            Self::Approved => WorkflowStatus::Approved,
            Self::Rejected => WorkflowStatus::Rejected,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentialApprover {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: Option<String>,
}

/// One approver's vote on an ALL-mode level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverVote {
    /// The potential approver whose seat this vote fills.
    pub voter_id: UserId,
    /// Who actually submitted it; differs from `voter_id` for delegated votes.
    pub decided_by: UserId,
    pub verdict: Verdict,
    pub comment: Option<String>,
    pub voted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub verdict: Verdict,
    pub decided_by: UserId,
    pub on_behalf_of: Option<UserId>,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: ApprovalInstanceId,
    pub workflow_id: WorkflowId,
    pub level_order: u32,
    pub level_name: String,
    pub level_type: LevelType,
    pub approval_mode: ApprovalMode,
    pub potential_approvers: Vec<PotentialApprover>,
    pub decision: Decision,
    pub decided_by: Option<UserId>,
    pub on_behalf_of: Option<UserId>,
    pub comment: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub votes: Vec<ApproverVote>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalInstance {
    pub fn open(
        id: ApprovalInstanceId,
        workflow_id: WorkflowId,
        level: &ApprovalLevel,
        potential_approvers: Vec<PotentialApprover>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_id,
            level_order: level.level_order,
            level_name: level.name.clone(),
            level_type: level.level_type,
            approval_mode: level.mode,
            potential_approvers,
            decision: Decision::Pending,
            decided_by: None,
            on_behalf_of: None,
            comment: None,
            decided_at: None,
            votes: Vec::new(),
            created_at,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }

    pub fn is_potential_approver(&self, user_id: &UserId) -> bool {
        self.potential_approvers.iter().any(|approver| &approver.user_id == user_id)
    }

    pub fn has_vote_from(&self, voter_id: &UserId) -> bool {
        self.votes.iter().any(|vote| &vote.voter_id == voter_id)
    }

    /// True once every potential approver has an approving vote on record.
    pub fn is_unanimously_approved(&self) -> bool {
        !self.potential_approvers.is_empty()
            && self.potential_approvers.iter().all(|approver| {
                self.votes.iter().any(|vote| {
                    vote.voter_id == approver.user_id && vote.verdict == Verdict::Approved
                })
            })
    }

    /// The vote that settles an ALL-mode level: the earliest rejection, otherwise the latest
    /// approval once the level is unanimous. `None` while the level is still open.
    pub fn deciding_vote(&self) -> Option<&ApproverVote> {
        let first_rejection = self
            .votes
            .iter()
            .filter(|vote| vote.verdict == Verdict::Rejected)
            .min_by_key(|vote| vote.voted_at);
        if first_rejection.is_some() {
            return first_rejection;
        }
        if self.is_unanimously_approved() {
            return self.votes.iter().max_by_key(|vote| vote.voted_at);
        }
        None
    }
}

/// What settling a level does to its workflow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LevelResolution {
    /// Moves the workflow to the next planned level, opening this instance for it.
    Advance(ApprovalInstance),
    Complete(WorkflowCompletion),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub tenant_id: TenantId,
    pub rule_id: RuleId,
    pub document: DocumentRef,
    pub status: WorkflowStatus,
    pub current_level: u32,
    pub requires_spec_approval: bool,
    /// Levels this workflow walks through, frozen when it started.
    pub plan: Vec<ApprovalLevel>,
    pub initiated_by: UserId,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_decision: Option<Decision>,
    pub final_comment: Option<String>,
}

impl Workflow {
    pub fn level(&self, level_order: u32) -> Option<&ApprovalLevel> {
        self.plan.iter().find(|level| level.level_order == level_order)
    }

    pub fn next_level_after(&self, level_order: u32) -> Option<&ApprovalLevel> {
        self.plan
            .iter()
            .filter(|level| level.level_order > level_order)
            .min_by_key(|level| level.level_order)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCompletion {
    pub status: WorkflowStatus,
    pub final_decision: Decision,
    pub final_comment: Option<String>,
    pub completed_at: DateTime<Utc>,
}
