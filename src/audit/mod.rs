//! Append-only audit journal types.
//!
//! Every mutating operation writes a [`LogRecord`] capturing enough state
//! to reverse it. Records are never rewritten after creation except for the
//! `consumed` marker set when a record is replayed by a reset.

pub mod engine;

pub use engine::AuditEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of mutation a log record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogAction {
    Add,
    Change,
    Delete,
    ChangePassword,
    Reset,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Add => "Add",
            LogAction::Change => "Change",
            LogAction::Delete => "Delete",
            LogAction::ChangePassword => "ChangePassword",
            LogAction::Reset => "Reset",
        }
    }
}

/// One entry of the append-only change journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub log_id: String,
    /// Provider-assigned write order, monotonic per database.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    /// `{database_id}/{dataset_id}` of the mutated record.
    pub location: String,
    pub action: LogAction,
    pub record_id: String,
    /// Pre-mutation document; present for Change/Delete/ChangePassword.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_before: Option<Value>,
    /// Post-mutation document, used to detect intervening changes on reset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_after: Option<Value>,
    /// Set once the entry has been replayed; consumed entries reset as a
    /// success no-op.
    #[serde(default)]
    pub consumed: bool,
}

impl LogRecord {
    pub fn new(
        user_id: impl Into<String>,
        location: impl Into<String>,
        action: LogAction,
        record_id: impl Into<String>,
        snapshot_before: Option<Value>,
        snapshot_after: Option<Value>,
    ) -> Self {
        Self {
            log_id: Uuid::new_v4().to_string(),
            seq: 0,
            timestamp: Utc::now(),
            user_id: user_id.into(),
            location: location.into(),
            action,
            record_id: record_id.into(),
            snapshot_before,
            snapshot_after,
            consumed: false,
        }
    }
}

/// Field a log filter clause inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFilterKind {
    RecordId,
    UserId,
    Action,
    Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFilterOp {
    Equals,
    NotEquals,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterClause {
    pub kind: LogFilterKind,
    pub op: LogFilterOp,
    pub value: String,
}

/// Ordered list of clauses, ANDed against the log record set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilter {
    pub clauses: Vec<LogFilterClause>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: LogFilterKind, op: LogFilterOp, value: impl Into<String>) -> Self {
        self.clauses.push(LogFilterClause {
            kind,
            op,
            value: value.into(),
        });
        self
    }

    /// Clause matching one record id exactly.
    pub fn record_id(record_id: impl Into<String>) -> Self {
        Self::new().with(LogFilterKind::RecordId, LogFilterOp::Equals, record_id)
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.clauses.iter().all(|clause| {
            let actual: &str = match clause.kind {
                LogFilterKind::RecordId => record.record_id.as_str(),
                LogFilterKind::UserId => record.user_id.as_str(),
                LogFilterKind::Action => record.action.as_str(),
                LogFilterKind::Location => record.location.as_str(),
            };
            match clause.op {
                LogFilterOp::Equals => actual == clause.value,
                LogFilterOp::NotEquals => actual != clause.value,
                LogFilterOp::Contains => actual.contains(clause.value.as_str()),
            }
        })
    }
}
