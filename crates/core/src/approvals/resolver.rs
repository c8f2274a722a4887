use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::ports::Directory;
use crate::domain::identity::{DirectoryUser, TenantId, UserId};
use crate::domain::rule::{ApprovalLevel, ApproverSpec};
use crate::domain::workflow::PotentialApprover;
use crate::errors::ApplicationError;

/// Turns a level's approver specifications into the concrete people allowed to decide it.
///
/// Called exactly once per instance; the result is stored as the instance snapshot and never
/// recomputed.
#[async_trait]
pub trait ApproverResolver: Send + Sync {
    async fn resolve(
        &self,
        tenant_id: &TenantId,
        level: &ApprovalLevel,
    ) -> Result<Vec<PotentialApprover>, ApplicationError>;
}

pub struct DirectoryApproverResolver {
    directory: Arc<dyn Directory>,
}

impl DirectoryApproverResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ApproverResolver for DirectoryApproverResolver {
    async fn resolve(
        &self,
        tenant_id: &TenantId,
        level: &ApprovalLevel,
    ) -> Result<Vec<PotentialApprover>, ApplicationError> {
        let mut seen: HashSet<UserId> = HashSet::new();
        let mut approvers = Vec::new();

        for spec in &level.approvers {
            match spec {
                ApproverSpec::User(user_id) => {
                    // Named users are taken as given; only role expansion filters on activity.
                    match self.directory.find_user(tenant_id, user_id).await? {
                        Some(user) => push_unique(&mut approvers, &mut seen, user, None),
                        None => {
                            warn!(
                                event_name = "approval.resolver.user_unknown",
                                tenant_id = %tenant_id.0,
                                user_id = %user_id.0,
                                level_order = level.level_order,
                                "named approver is not in the tenant directory; skipping"
                            );
                        }
                    }
                }
                ApproverSpec::Role(role) => {
                    let members =
                        self.directory.list_active_members_with_role(tenant_id, role).await?;
                    for member in members {
                        push_unique(&mut approvers, &mut seen, member, Some(role.clone()));
                    }
                }
            }
        }

        Ok(approvers)
    }
}

fn push_unique(
    approvers: &mut Vec<PotentialApprover>,
    seen: &mut HashSet<UserId>,
    user: DirectoryUser,
    role: Option<String>,
) {
    if seen.insert(user.user_id.clone()) {
        approvers.push(PotentialApprover {
            user_id: user.user_id,
            name: user.name,
            email: user.email,
            role,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ApproverResolver, DirectoryApproverResolver};
    use crate::approvals::memory::InMemoryDirectory;
    use crate::domain::identity::{DirectoryUser, TenantId, UserId};
    use crate::domain::rule::{ApprovalLevel, ApprovalMode, ApproverSpec, LevelType};

    fn user(id: &str, roles: &[&str], is_active: bool) -> DirectoryUser {
        DirectoryUser {
            user_id: UserId(id.to_string()),
            name: format!("User {id}"),
            email: format!("{id}@example.test"),
            roles: roles.iter().map(|role| role.to_string()).collect(),
            is_active,
        }
    }

    async fn directory() -> Arc<InMemoryDirectory> {
        let directory = Arc::new(InMemoryDirectory::default());
        let tenant = TenantId("tenant-a".to_string());
        directory.insert(tenant.clone(), user("alice", &["buyer"], true)).await;
        directory.insert(tenant.clone(), user("bob", &["buyer", "finance"], true)).await;
        directory.insert(tenant.clone(), user("carol", &["finance"], false)).await;
        directory.insert(TenantId("tenant-b".to_string()), user("dave", &["buyer"], true)).await;
        directory
    }

    fn level(approvers: Vec<ApproverSpec>) -> ApprovalLevel {
        ApprovalLevel {
            level_order: 1,
            name: "Review".to_string(),
            mode: ApprovalMode::Any,
            level_type: LevelType::General,
            approvers,
        }
    }

    #[tokio::test]
    async fn role_expands_to_every_active_tenant_member() {
        let resolver = DirectoryApproverResolver::new(directory().await);

        let approvers = resolver
            .resolve(&TenantId("tenant-a".to_string()), &level(vec![ApproverSpec::Role(
                "buyer".to_string(),
            )]))
            .await
            .expect("resolve");

        let ids: Vec<&str> = approvers.iter().map(|a| a.user_id.0.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert!(approvers.iter().all(|a| a.role.as_deref() == Some("buyer")));
    }

    #[tokio::test]
    async fn union_keeps_first_occurrence_and_named_users_regardless_of_activity() {
        let resolver = DirectoryApproverResolver::new(directory().await);

        let approvers = resolver
            .resolve(
                &TenantId("tenant-a".to_string()),
                &level(vec![
                    ApproverSpec::User(UserId("bob".to_string())),
                    ApproverSpec::Role("finance".to_string()),
                    ApproverSpec::User(UserId("carol".to_string())),
                    ApproverSpec::User(UserId("ghost".to_string())),
                ]),
            )
            .await
            .expect("resolve");

        let ids: Vec<&str> = approvers.iter().map(|a| a.user_id.0.as_str()).collect();
        assert_eq!(ids, vec!["bob", "carol"]);
        assert_eq!(approvers[0].role, None);
        assert_eq!(approvers[1].role, None);
    }
}
