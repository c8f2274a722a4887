use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

/// A tenant member as seen by the directory service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub roles: Vec<String>,
    pub is_active: bool,
}

impl DirectoryUser {
    pub fn has_role(&self, role: &str) -> bool {
        let wanted = role.trim().to_ascii_lowercase();
        self.roles.iter().any(|held| held.trim().to_ascii_lowercase() == wanted)
    }
}
