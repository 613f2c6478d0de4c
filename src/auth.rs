use serde::{Deserialize, Serialize};

/// Identity of the actor performing a request.
///
/// Authentication itself (token validation, JWT issuance) happens outside
/// this crate; callers hand over the resolved identity as a plain value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub user_id: String,
    pub role_ids: Vec<String>,
    pub is_admin: bool,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>, role_ids: Vec<String>, is_admin: bool) -> Self {
        Self {
            user_id: user_id.into(),
            role_ids,
            is_admin,
        }
    }

    /// Internal actor used for bootstrap writes.
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            role_ids: Vec::new(),
            is_admin: true,
        }
    }

    /// The actor's own id followed by all of its role ids.
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.user_id.as_str()).chain(self.role_ids.iter().map(String::as_str))
    }
}
