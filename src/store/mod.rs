//! Record store abstraction: provider-agnostic typed CRUD and predicate
//! queries over schema-flexible documents.
//!
//! Providers persist documents per dataset, enforce the undeclared-field
//! policy of the owning database, and guarantee that a data mutation and
//! its audit-log entry commit atomically.

pub mod memory;
pub mod predicate;
pub mod sled_store;

pub use memory::MemoryStore;
pub use predicate::{FieldPredicate, Predicate, PredicateOp};
pub use sled_store::SledStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{LogFilter, LogRecord};
use crate::error::{DataKeepError, DataKeepResult};
use crate::schema::{mapper, Database};

/// Scoped handle to an open provider connection for one database.
///
/// Sessions carry no backend state themselves; providers track the open
/// set and reject operations on closed sessions.
#[derive(Debug, Clone)]
pub struct Session {
    database_id: String,
    session_id: String,
}

impl Session {
    pub(crate) fn new(database_id: &str) -> Self {
        Self {
            database_id: database_id.to_string(),
            session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// A stored document plus version bookkeeping for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub record_id: String,
    pub dataset_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub document: Value,
}

impl StoredRecord {
    pub fn new(record_id: String, dataset_id: String, document: Value) -> Self {
        let now = Utc::now();
        Self {
            record_id,
            dataset_id,
            version: 1,
            created_at: now,
            updated_at: now,
            document,
        }
    }

    /// Next version of this record with a replaced document.
    pub fn with_document(&self, document: Value) -> Self {
        Self {
            record_id: self.record_id.clone(),
            dataset_id: self.dataset_id.clone(),
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: Utc::now(),
            document,
        }
    }
}

/// One data mutation inside a logged commit.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Add {
        dataset_id: String,
        record_id: String,
        document: Value,
    },
    Change {
        dataset_id: String,
        record_id: String,
        document: Value,
        /// Version observed at read time; a mismatch aborts the commit
        /// with `ConcurrencyConflict`.
        expected_version: Option<u64>,
    },
    Delete {
        dataset_id: String,
        record_id: String,
    },
}

/// A data mutation paired with its mandatory log entry.
///
/// `op` may be `None` when a reset finds the target state already reverted
/// and only the Reset entry plus the consumed marker need to commit.
#[derive(Debug)]
pub struct LoggedWrite<'a> {
    pub op: Option<WriteOp>,
    pub log: &'a LogRecord,
    /// Log entry to mark consumed in the same transaction.
    pub consume: Option<&'a LogRecord>,
}

/// Records touched by a committed write.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    /// Resulting record for Add/Change.
    pub record: Option<StoredRecord>,
    /// Pre-mutation record for Change/Delete.
    pub before: Option<StoredRecord>,
}

/// Provider contract executing typed CRUD, predicate queries and atomic
/// logged commits against a backend.
pub trait RecordStore: Send + Sync {
    /// Registers a database definition with this provider.
    fn register_database(&self, definition: Database) -> DataKeepResult<()>;

    /// Replaces a registered definition, e.g. after a dataset change.
    fn update_database(&self, definition: Database) -> DataKeepResult<()>;

    /// Unregisters a database and drops its records. Log entries stay in
    /// storage but are only readable through a session, so they become
    /// reachable again when the same database id is re-registered.
    fn remove_database(&self, database_id: &str) -> DataKeepResult<()>;

    fn database(&self, database_id: &str) -> DataKeepResult<Option<Database>>;

    fn open_session(&self, database_id: &str) -> DataKeepResult<Session>;

    fn close_session(&self, session: Session) -> DataKeepResult<()>;

    fn get(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: &str,
    ) -> DataKeepResult<Option<StoredRecord>>;

    fn first_or_default(
        &self,
        session: &Session,
        dataset_id: &str,
        predicate: &Predicate,
    ) -> DataKeepResult<Option<StoredRecord>>;

    /// All records of a dataset matching the predicate. The returned
    /// sequence is finite and re-iterable per call.
    fn find(
        &self,
        session: &Session,
        dataset_id: &str,
        predicate: &Predicate,
    ) -> DataKeepResult<Vec<StoredRecord>>;

    /// Commits a data mutation together with its log entry; either both
    /// persist or neither does.
    fn commit(&self, session: &Session, write: LoggedWrite<'_>) -> DataKeepResult<WriteOutcome>;

    fn get_log(&self, session: &Session, log_id: &str) -> DataKeepResult<Option<LogRecord>>;

    /// Log entries of the session's database matching the filter, in
    /// write order.
    fn query_logs(&self, session: &Session, filter: &LogFilter) -> DataKeepResult<Vec<LogRecord>>;
}

/// Rejects documents carrying undeclared fields unless the owning database
/// allows them. Shared by all providers.
pub(crate) fn validate_document(
    definition: &Database,
    dataset_id: &str,
    document: &Value,
) -> DataKeepResult<()> {
    let dataset = definition.dataset(dataset_id).ok_or_else(|| {
        DataKeepError::NotFound(format!(
            "Dataset '{}' in database '{}'",
            dataset_id, definition.database_id
        ))
    })?;
    if definition.allow_undeclared {
        return Ok(());
    }
    let declared = dataset.declared_paths();
    for entry in mapper::map(document, "") {
        let rel = entry.path.trim_start_matches('/');
        if rel.is_empty() {
            continue;
        }
        if !declared.contains(rel) {
            return Err(DataKeepError::SchemaViolation(format!(
                "Undeclared field '{}' in dataset '{}'",
                rel, dataset_id
            )));
        }
    }
    Ok(())
}
