use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::domain::document::{DocumentRef, DocumentSummary};
use crate::domain::identity::{TenantId, UserId};
use crate::domain::workflow::{WorkflowId, WorkflowStatus};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    ApprovalNeeded {
        tenant_id: TenantId,
        user_id: UserId,
        email: String,
        workflow_id: WorkflowId,
        document: DocumentRef,
        summary: Option<DocumentSummary>,
        level_name: String,
    },
    WorkflowCompleted {
        tenant_id: TenantId,
        user_id: UserId,
        workflow_id: WorkflowId,
        document: DocumentRef,
        status: WorkflowStatus,
        comment: Option<String>,
    },
    DelegationReceived {
        tenant_id: TenantId,
        delegate_id: UserId,
        delegator_id: UserId,
        start_date: NaiveDate,
        end_date: NaiveDate,
        reason: Option<String>,
    },
}

impl Notification {
    pub fn recipient(&self) -> &UserId {
        match self {
            Self::ApprovalNeeded { user_id, .. } | Self::WorkflowCompleted { user_id, .. } => {
                user_id
            }
            Self::DelegationReceived { delegate_id, .. } => delegate_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApprovalNeeded { .. } => "approval_needed",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::DelegationReceived { .. } => "delegation_received",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification channel is closed")]
    ChannelClosed,
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Hands notifications to a delivery mechanism. Implementations must return promptly;
/// actual delivery happens elsewhere.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Best-effort dispatch: failures are logged and swallowed.
pub(crate) fn dispatch_best_effort(
    dispatcher: &dyn NotificationDispatcher,
    notification: Notification,
) {
    let kind = notification.kind();
    let recipient = notification.recipient().0.clone();
    if let Err(error) = dispatcher.dispatch(notification) {
        warn!(
            event_name = "approval.notification.dispatch_failed",
            notification_kind = kind,
            recipient = %recipient,
            error = %error,
            "notification dispatch failed"
        );
    }
}

/// Queues notifications on an unbounded channel drained by a delivery worker.
#[derive(Clone, Debug)]
pub struct ChannelNotificationDispatcher {
    sender: UnboundedSender<Notification>,
}

impl ChannelNotificationDispatcher {
    pub fn new() -> (Self, UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationDispatcher for ChannelNotificationDispatcher {
    fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        self.sender.send(notification).map_err(|_| NotificationError::ChannelClosed)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationDispatcher {
    notifications: Arc<Mutex<Vec<Notification>>>,
    reject_all: bool,
}

impl InMemoryNotificationDispatcher {
    /// A dispatcher that refuses every notification, for exercising failure paths.
    pub fn rejecting() -> Self {
        Self { notifications: Arc::default(), reject_all: true }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        match self.notifications.lock() {
            Ok(notifications) => notifications.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn sent_to(&self, user_id: &UserId) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|notification| notification.recipient() == user_id)
            .collect()
    }
}

impl NotificationDispatcher for InMemoryNotificationDispatcher {
    fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        if self.reject_all {
            return Err(NotificationError::Rejected("dispatcher is rejecting".to_string()));
        }
        match self.notifications.lock() {
            Ok(mut notifications) => notifications.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        dispatch_best_effort, ChannelNotificationDispatcher, InMemoryNotificationDispatcher,
        Notification, NotificationDispatcher, NotificationError,
    };
    use crate::domain::identity::{TenantId, UserId};

    fn delegation_received() -> Notification {
        Notification::DelegationReceived {
            tenant_id: TenantId("tenant-a".to_string()),
            delegate_id: UserId("u2".to_string()),
            delegator_id: UserId("u1".to_string()),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).expect("date"),
            end_date: NaiveDate::from_ymd_opt(2025, 1, 31).expect("date"),
            reason: Some("vacation".to_string()),
        }
    }

    #[tokio::test]
    async fn channel_dispatcher_queues_for_worker() {
        let (dispatcher, mut receiver) = ChannelNotificationDispatcher::new();

        dispatcher.dispatch(delegation_received()).expect("dispatch");

        let received = receiver.recv().await.expect("queued notification");
        assert_eq!(received.kind(), "delegation_received");
        assert_eq!(received.recipient(), &UserId("u2".to_string()));
    }

    #[test]
    fn channel_dispatcher_reports_closed_receiver() {
        let (dispatcher, receiver) = ChannelNotificationDispatcher::new();
        drop(receiver);

        assert_eq!(
            dispatcher.dispatch(delegation_received()),
            Err(NotificationError::ChannelClosed)
        );
    }

    #[test]
    fn best_effort_dispatch_swallows_failures() {
        let dispatcher = InMemoryNotificationDispatcher::rejecting();

        dispatch_best_effort(&dispatcher, delegation_received());

        assert!(dispatcher.notifications().is_empty());
    }
}
