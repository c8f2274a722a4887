use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::notify::{dispatch_best_effort, Notification, NotificationDispatcher};
use super::ports::DelegationRepository;
use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::domain::delegation::{Delegation, DelegationId, DelegationInsert};
use crate::domain::identity::{TenantId, UserId};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDelegationRequest {
    pub tenant_id: TenantId,
    pub delegator_id: UserId,
    pub delegate_id: UserId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelegationFailure {
    /// An active delegation of the same delegator already covers part of the range.
    Conflict { existing: DelegationId },
    InvalidRange,
    SelfDelegation,
}

impl DelegationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::InvalidRange => "invalid_range",
            Self::SelfDelegation => "self_delegation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateDelegationOutcome {
    Created(Delegation),
    Rejected(DelegationFailure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelDelegationOutcome {
    Cancelled,
    NotFound,
    AlreadyInactive,
}

pub struct DelegationManager {
    delegations: Arc<dyn DelegationRepository>,
    notifications: Arc<dyn NotificationDispatcher>,
    audit: Arc<dyn AuditSink>,
}

impl DelegationManager {
    pub fn new(
        delegations: Arc<dyn DelegationRepository>,
        notifications: Arc<dyn NotificationDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { delegations, notifications, audit }
    }

    pub async fn create_delegation(
        &self,
        request: CreateDelegationRequest,
    ) -> Result<CreateDelegationOutcome, ApplicationError> {
        let audit = AuditContext::new(Some(request.tenant_id.clone()), &request.delegator_id.0);

        if request.delegator_id == request.delegate_id {
            return Ok(self.reject(&audit, DelegationFailure::SelfDelegation));
        }
        if request.start_date > request.end_date {
            return Ok(self.reject(&audit, DelegationFailure::InvalidRange));
        }

        let delegation = Delegation {
            id: DelegationId(Uuid::new_v4().to_string()),
            tenant_id: request.tenant_id,
            delegator_id: request.delegator_id,
            delegate_id: request.delegate_id,
            start_date: request.start_date,
            end_date: request.end_date,
            reason: request.reason,
            is_active: true,
            created_at: Utc::now(),
        };

        match self.delegations.insert_if_no_overlap(delegation.clone()).await? {
            DelegationInsert::Overlaps(existing) => {
                Ok(self.reject(&audit, DelegationFailure::Conflict { existing: existing.id }))
            }
            DelegationInsert::Inserted => {
                info!(
                    event_name = "approval.delegation.created",
                    correlation_id = %audit.correlation_id,
                    tenant_id = %delegation.tenant_id.0,
                    delegation_id = %delegation.id.0,
                    delegator_id = %delegation.delegator_id.0,
                    delegate_id = %delegation.delegate_id.0,
                    start_date = %delegation.start_date,
                    end_date = %delegation.end_date,
                    "delegation created"
                );
                self.audit.emit(
                    audit
                        .event(
                            None,
                            "approval.delegation.created",
                            AuditCategory::Delegation,
                            AuditOutcome::Success,
                        )
                        .with_metadata("delegation_id", delegation.id.0.clone())
                        .with_metadata("delegate_id", delegation.delegate_id.0.clone()),
                );

                dispatch_best_effort(
                    self.notifications.as_ref(),
                    Notification::DelegationReceived {
                        tenant_id: delegation.tenant_id.clone(),
                        delegate_id: delegation.delegate_id.clone(),
                        delegator_id: delegation.delegator_id.clone(),
                        start_date: delegation.start_date,
                        end_date: delegation.end_date,
                        reason: delegation.reason.clone(),
                    },
                );
                Ok(CreateDelegationOutcome::Created(delegation))
            }
        }
    }

    /// Soft-deactivates; the record stays in history.
    pub async fn cancel_delegation(
        &self,
        delegation_id: &DelegationId,
    ) -> Result<CancelDelegationOutcome, ApplicationError> {
        let Some(delegation) = self.delegations.find(delegation_id).await? else {
            return Ok(CancelDelegationOutcome::NotFound);
        };
        if !self.delegations.deactivate(delegation_id).await? {
            return Ok(CancelDelegationOutcome::AlreadyInactive);
        }

        let audit =
            AuditContext::new(Some(delegation.tenant_id.clone()), &delegation.delegator_id.0);
        info!(
            event_name = "approval.delegation.cancelled",
            correlation_id = %audit.correlation_id,
            tenant_id = %delegation.tenant_id.0,
            delegation_id = %delegation.id.0,
            "delegation cancelled"
        );
        self.audit.emit(
            audit
                .event(
                    None,
                    "approval.delegation.cancelled",
                    AuditCategory::Delegation,
                    AuditOutcome::Success,
                )
                .with_metadata("delegation_id", delegation.id.0.clone()),
        );

        Ok(CancelDelegationOutcome::Cancelled)
    }

    pub async fn get_user_delegations(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Delegation>, ApplicationError> {
        self.delegations.list_for_user(user_id, tenant_id).await
    }

    /// Delegators whose active delegation to `delegate_id` covers `on`.
    pub async fn active_principals(
        &self,
        delegate_id: &UserId,
        tenant_id: &TenantId,
        on: NaiveDate,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let mut principals: Vec<UserId> = self
            .delegations
            .list_active_for_delegate(delegate_id, tenant_id, on)
            .await?
            .into_iter()
            .map(|delegation| delegation.delegator_id)
            .collect();
        principals.sort();
        principals.dedup();
        Ok(principals)
    }

    fn reject(&self, audit: &AuditContext, failure: DelegationFailure) -> CreateDelegationOutcome {
        info!(
            event_name = "approval.delegation.rejected",
            correlation_id = %audit.correlation_id,
            failure = failure.as_str(),
            "delegation request rejected"
        );
        self.audit.emit(
            audit
                .event(
                    None,
                    "approval.delegation.rejected",
                    AuditCategory::Delegation,
                    AuditOutcome::Rejected,
                )
                .with_metadata("failure", failure.as_str()),
        );
        CreateDelegationOutcome::Rejected(failure)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::{
        CancelDelegationOutcome, CreateDelegationOutcome, CreateDelegationRequest,
        DelegationFailure, DelegationManager,
    };
    use crate::approvals::memory::InMemoryDelegationRepository;
    use crate::approvals::notify::InMemoryNotificationDispatcher;
    use crate::audit::InMemoryAuditSink;
    use crate::domain::identity::{TenantId, UserId};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn request(delegate: &str, start: NaiveDate, end: NaiveDate) -> CreateDelegationRequest {
        CreateDelegationRequest {
            tenant_id: TenantId("tenant-a".to_string()),
            delegator_id: UserId("u1".to_string()),
            delegate_id: UserId(delegate.to_string()),
            start_date: start,
            end_date: end,
            reason: Some("vacation".to_string()),
        }
    }

    fn manager() -> (DelegationManager, InMemoryNotificationDispatcher, InMemoryAuditSink) {
        let notifications = InMemoryNotificationDispatcher::default();
        let audit = InMemoryAuditSink::default();
        let manager = DelegationManager::new(
            Arc::new(InMemoryDelegationRepository::default()),
            Arc::new(notifications.clone()),
            Arc::new(audit.clone()),
        );
        (manager, notifications, audit)
    }

    #[tokio::test]
    async fn created_delegation_notifies_delegate() {
        let (manager, notifications, audit) = manager();

        let outcome = manager
            .create_delegation(request("u2", date(2025, 1, 1), date(2025, 1, 31)))
            .await
            .expect("create");

        assert!(matches!(outcome, CreateDelegationOutcome::Created(_)));
        let sent = notifications.sent_to(&UserId("u2".to_string()));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "delegation_received");
        assert_eq!(audit.event_types(), vec!["approval.delegation.created".to_string()]);
    }

    #[tokio::test]
    async fn reversed_range_and_self_delegation_are_rejected() {
        let (manager, notifications, _) = manager();

        let reversed = manager
            .create_delegation(request("u2", date(2025, 2, 1), date(2025, 1, 1)))
            .await
            .expect("create");
        let to_self = manager
            .create_delegation(request("u1", date(2025, 1, 1), date(2025, 1, 2)))
            .await
            .expect("create");

        assert_eq!(reversed, CreateDelegationOutcome::Rejected(DelegationFailure::InvalidRange));
        assert_eq!(to_self, CreateDelegationOutcome::Rejected(DelegationFailure::SelfDelegation));
        assert!(notifications.notifications().is_empty());
    }

    #[tokio::test]
    async fn cancel_is_soft_and_reports_repeat_calls() {
        let (manager, _, _) = manager();
        let CreateDelegationOutcome::Created(delegation) = manager
            .create_delegation(request("u2", date(2025, 1, 1), date(2025, 1, 31)))
            .await
            .expect("create")
        else {
            panic!("delegation should be created");
        };

        assert_eq!(
            manager.cancel_delegation(&delegation.id).await.expect("cancel"),
            CancelDelegationOutcome::Cancelled
        );
        assert_eq!(
            manager.cancel_delegation(&delegation.id).await.expect("cancel again"),
            CancelDelegationOutcome::AlreadyInactive
        );

        let history = manager
            .get_user_delegations(&UserId("u2".to_string()), &TenantId("tenant-a".to_string()))
            .await
            .expect("history");
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_active);
    }

    #[tokio::test]
    async fn cancelled_delegation_frees_its_range() {
        let (manager, _, _) = manager();
        let CreateDelegationOutcome::Created(first) = manager
            .create_delegation(request("u2", date(2025, 1, 1), date(2025, 1, 31)))
            .await
            .expect("create")
        else {
            panic!("delegation should be created");
        };
        manager.cancel_delegation(&first.id).await.expect("cancel");

        let again = manager
            .create_delegation(request("u3", date(2025, 1, 10), date(2025, 1, 20)))
            .await
            .expect("create");

        assert!(matches!(again, CreateDelegationOutcome::Created(_)));
    }

    #[tokio::test]
    async fn active_principals_follow_the_date_window() {
        let (manager, _, _) = manager();
        manager
            .create_delegation(request("u2", date(2025, 1, 1), date(2025, 1, 31)))
            .await
            .expect("create");
        let tenant = TenantId("tenant-a".to_string());
        let delegate = UserId("u2".to_string());

        let inside = manager
            .active_principals(&delegate, &tenant, date(2025, 1, 31))
            .await
            .expect("principals");
        let outside = manager
            .active_principals(&delegate, &tenant, date(2025, 2, 1))
            .await
            .expect("principals");

        assert_eq!(inside, vec![UserId("u1".to_string())]);
        assert!(outside.is_empty());
    }
}
