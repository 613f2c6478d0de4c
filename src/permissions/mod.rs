//! Permission entries: access-control rules binding a member (user or
//! role) to tri-state action flags over a uri scope.

pub mod resolver;

pub use resolver::PermissionResolver;

use serde::{Deserialize, Serialize};

/// Whether an entry's member id names a user or a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberIdKind {
    User,
    Role,
}

/// Uri namespace an entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessUriScheme {
    /// Record content scopes: `/{database}/{dataset}/...`
    Content,
    /// Database administration scopes: `/{database}`
    Database,
}

impl AccessUriScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessUriScheme::Content => "content",
            AccessUriScheme::Database => "database",
        }
    }
}

/// Action a permission value gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionAction {
    Read,
    Add,
    Change,
    Delete,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::Read => "Read",
            PermissionAction::Add => "Add",
            PermissionAction::Change => "Change",
            PermissionAction::Delete => "Delete",
        }
    }
}

/// Tri-state grant: Undefined defers to less specific scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PermissionValue {
    Allow,
    Deny,
    #[default]
    Undefined,
}

/// Four independent tri-state flags, one per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionValues {
    pub read: PermissionValue,
    pub add: PermissionValue,
    pub change: PermissionValue,
    pub delete: PermissionValue,
}

impl PermissionValues {
    pub fn allow_all() -> Self {
        Self {
            read: PermissionValue::Allow,
            add: PermissionValue::Allow,
            change: PermissionValue::Allow,
            delete: PermissionValue::Allow,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            read: PermissionValue::Deny,
            add: PermissionValue::Deny,
            change: PermissionValue::Deny,
            delete: PermissionValue::Deny,
        }
    }

    pub fn get(&self, action: PermissionAction) -> PermissionValue {
        match action {
            PermissionAction::Read => self.read,
            PermissionAction::Add => self.add,
            PermissionAction::Change => self.change,
            PermissionAction::Delete => self.delete,
        }
    }
}

/// Access-control rule for one member over one uri scope.
///
/// Identity key = member id + access uri; upserts replace the values of an
/// existing entry with the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionEntry {
    pub member_id_kind: MemberIdKind,
    pub member_id: String,
    pub access_uri_scheme: AccessUriScheme,
    pub access_uri: String,
    pub permission_values: PermissionValues,
}

impl PermissionEntry {
    pub fn new(
        member_id_kind: MemberIdKind,
        member_id: impl Into<String>,
        access_uri_scheme: AccessUriScheme,
        access_uri: impl Into<String>,
        permission_values: PermissionValues,
    ) -> Self {
        Self {
            member_id_kind,
            member_id: member_id.into(),
            access_uri_scheme,
            access_uri: access_uri.into(),
            permission_values,
        }
    }

    /// Identity key of this entry within the permission set.
    pub fn key(&self) -> String {
        format!("{}:{}", self.member_id, self.access_uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_default_to_undefined() {
        let values = PermissionValues::default();
        assert_eq!(values.get(PermissionAction::Read), PermissionValue::Undefined);
        assert_eq!(values.get(PermissionAction::Delete), PermissionValue::Undefined);
    }

    #[test]
    fn test_exchange_shape() {
        let entry = PermissionEntry::new(
            MemberIdKind::Role,
            "r1",
            AccessUriScheme::Content,
            "/db/people",
            PermissionValues {
                read: PermissionValue::Allow,
                ..Default::default()
            },
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["memberIdKind"], "Role");
        assert_eq!(value["accessUriScheme"], "Content");
        assert_eq!(value["permissionValues"]["read"], "Allow");
        assert_eq!(value["permissionValues"]["change"], "Undefined");
    }

    #[test]
    fn test_identity_key() {
        let entry = PermissionEntry::new(
            MemberIdKind::User,
            "u1",
            AccessUriScheme::Content,
            "/db",
            PermissionValues::allow_all(),
        );
        assert_eq!(entry.key(), "u1:/db");
    }
}
