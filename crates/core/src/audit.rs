use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::identity::TenantId;
use crate::domain::workflow::WorkflowId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Workflow,
    Decision,
    Delegation,
    Document,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Correlation fields shared by every event emitted during one engine call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub tenant_id: Option<TenantId>,
    pub correlation_id: String,
    pub actor: String,
}

impl AuditContext {
    pub fn new(tenant_id: Option<TenantId>, actor: impl Into<String>) -> Self {
        Self { tenant_id, correlation_id: Uuid::new_v4().to_string(), actor: actor.into() }
    }

    pub fn event(
        &self,
        workflow_id: Option<&WorkflowId>,
        event_type: impl Into<String>,
        category: AuditCategory,
        outcome: AuditOutcome,
    ) -> AuditEvent {
        AuditEvent::new(
            self.tenant_id.clone(),
            workflow_id.cloned(),
            self.correlation_id.clone(),
            event_type,
            category,
            self.actor.clone(),
            outcome,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub tenant_id: Option<TenantId>,
    pub workflow_id: Option<WorkflowId>,
    pub correlation_id: String,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        tenant_id: Option<TenantId>,
        workflow_id: Option<WorkflowId>,
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            tenant_id,
            workflow_id,
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.event_type).collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Writes audit events to the `tracing` pipeline under the `procure::audit` target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        tracing::info!(
            target: "procure::audit",
            event_name = %event.event_type,
            event_id = %event.event_id,
            correlation_id = %event.correlation_id,
            tenant_id = event.tenant_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            workflow_id = event.workflow_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            actor = %event.actor,
            outcome = event.outcome.as_str(),
            metadata = %metadata,
            "audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, InMemoryAuditSink},
        domain::{identity::TenantId, workflow::WorkflowId},
    };

    #[test]
    fn in_memory_sink_records_events_with_correlation_fields() {
        let sink = InMemoryAuditSink::default();
        let context = AuditContext::new(Some(TenantId("tenant-a".to_owned())), "u-approver");
        let workflow_id = WorkflowId("wf-42".to_owned());

        sink.emit(
            context
                .event(
                    Some(&workflow_id),
                    "approval.decision.recorded",
                    AuditCategory::Decision,
                    AuditOutcome::Success,
                )
                .with_metadata("level", "1")
                .with_metadata("decision", "approved"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, context.correlation_id);
        assert_eq!(events[0].workflow_id.as_ref(), Some(&workflow_id));
        assert_eq!(events[0].actor, "u-approver");
        assert!(events[0].metadata.contains_key("level"));
    }

    #[test]
    fn each_context_gets_a_distinct_correlation_id() {
        let first = AuditContext::new(None, "system");
        let second = AuditContext::new(None, "system");

        assert_ne!(first.correlation_id, second.correlation_id);
    }
}
