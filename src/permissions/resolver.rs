//! Effective-permission resolution.
//!
//! Longest-prefix matching with deny precedence: at each specificity level,
//! an explicit Deny from any of the actor's member ids (user or role) wins
//! outright, an explicit Allow wins otherwise, and Undefined walks up to the
//! parent scope. With no matching entry up to the root the default is Deny,
//! except for admin actors which resolve Allow.

use std::collections::{BTreeMap, HashMap};

use crate::auth::AuthContext;
use crate::error::{DataKeepError, DataKeepResult};
use crate::permissions::{
    AccessUriScheme, PermissionAction, PermissionEntry, PermissionValue, PermissionValues,
};

/// Read-mostly index over the permission-entry set.
///
/// Entries are keyed per member in a sorted map of scoped uris, so each
/// specificity level is an ordered lookup rather than a linear scan over
/// the whole entry set. Resolution is a pure function of the index.
#[derive(Debug, Default, Clone)]
pub struct PermissionResolver {
    index: HashMap<String, BTreeMap<String, PermissionValues>>,
}

impl PermissionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[PermissionEntry]) -> Self {
        let mut index: HashMap<String, BTreeMap<String, PermissionValues>> = HashMap::new();
        for entry in entries {
            index
                .entry(entry.member_id.clone())
                .or_default()
                .insert(
                    scope_key(entry.access_uri_scheme, &entry.access_uri),
                    entry.permission_values,
                );
        }
        Self { index }
    }

    /// Resolves the actor's effective permission; Undefined never escapes.
    pub fn resolve(
        &self,
        auth: &AuthContext,
        scheme: AccessUriScheme,
        access_uri: &str,
        action: PermissionAction,
    ) -> DataKeepResult<PermissionValue> {
        let chain = prefix_chain(access_uri)?;
        for prefix in &chain {
            let key = scope_key(scheme, prefix);
            let mut allowed = false;
            for member in auth.member_ids() {
                let values = self.index.get(member).and_then(|scopes| scopes.get(&key));
                match values.map(|v| v.get(action)) {
                    Some(PermissionValue::Deny) => return Ok(PermissionValue::Deny),
                    Some(PermissionValue::Allow) => allowed = true,
                    _ => {}
                }
            }
            if allowed {
                return Ok(PermissionValue::Allow);
            }
        }
        if auth.is_admin {
            Ok(PermissionValue::Allow)
        } else {
            Ok(PermissionValue::Deny)
        }
    }
}

fn scope_key(scheme: AccessUriScheme, uri: &str) -> String {
    format!("{}|{}", scheme.as_str(), uri)
}

/// Splits a uri into its prefix chain, most specific first, ending at the
/// root scope. Accepts plain `/a/b/c` paths and `scheme://host/path` forms.
pub fn prefix_chain(uri: &str) -> DataKeepResult<Vec<String>> {
    if uri.is_empty() {
        return Err(DataKeepError::InvalidUri("Empty uri".to_string()));
    }
    let (head, path) = match uri.split_once("://") {
        Some((scheme, rest)) => {
            if scheme.is_empty() || rest.is_empty() {
                return Err(DataKeepError::InvalidUri(format!("Malformed uri '{}'", uri)));
            }
            (Some(scheme), rest)
        }
        None => (None, uri),
    };
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() && head.is_none() && path != "/" {
        return Err(DataKeepError::InvalidUri(format!("Malformed uri '{}'", uri)));
    }
    let segments: Vec<&str> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    };
    if segments.iter().any(|s| s.is_empty()) {
        return Err(DataKeepError::InvalidUri(format!(
            "Empty segment in uri '{}'",
            uri
        )));
    }

    let mut chain = Vec::with_capacity(segments.len() + 1);
    for depth in (1..=segments.len()).rev() {
        let joined = segments[..depth].join("/");
        chain.push(match head {
            Some(h) => format!("{}://{}", h, joined),
            None => format!("/{}", joined),
        });
    }
    if head.is_none() {
        chain.push("/".to_string());
    }
    Ok(chain)
}
