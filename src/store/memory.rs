//! In-memory reference provider.
//!
//! Single coarse lock over the whole state: every logged commit is applied
//! under it, so a mutation and its log entry are observed together or not
//! at all. Serves as the correctness reference for other providers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::audit::{LogFilter, LogRecord};
use crate::error::{DataKeepError, DataKeepResult};
use crate::schema::Database;
use crate::store::{
    validate_document, LoggedWrite, Predicate, RecordStore, Session, StoredRecord, WriteOp,
    WriteOutcome,
};

#[derive(Default)]
struct MemoryInner {
    databases: HashMap<String, Database>,
    /// database id -> (dataset id, record id) -> record
    records: HashMap<String, BTreeMap<(String, String), StoredRecord>>,
    /// database id -> log entries in write order
    logs: HashMap<String, Vec<LogRecord>>,
    sessions: HashSet<String>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn assert_session(inner: &MemoryInner, session: &Session) -> DataKeepResult<()> {
    if inner.sessions.contains(session.session_id()) {
        Ok(())
    } else {
        Err(DataKeepError::Provider(format!(
            "Session '{}' is not open",
            session.session_id()
        )))
    }
}

impl RecordStore for MemoryStore {
    fn register_database(&self, definition: Database) -> DataKeepResult<()> {
        definition.validate()?;
        let mut inner = self.lock();
        if inner.databases.contains_key(&definition.database_id) {
            return Err(DataKeepError::AlreadyExists(format!(
                "Database '{}'",
                definition.database_id
            )));
        }
        log::info!("Registered database '{}' (memory)", definition.database_id);
        inner
            .databases
            .insert(definition.database_id.clone(), definition);
        Ok(())
    }

    fn update_database(&self, definition: Database) -> DataKeepResult<()> {
        definition.validate()?;
        let mut inner = self.lock();
        if !inner.databases.contains_key(&definition.database_id) {
            return Err(DataKeepError::NotFound(format!(
                "Database '{}'",
                definition.database_id
            )));
        }
        inner
            .databases
            .insert(definition.database_id.clone(), definition);
        Ok(())
    }

    fn remove_database(&self, database_id: &str) -> DataKeepResult<()> {
        let mut inner = self.lock();
        if inner.databases.remove(database_id).is_none() {
            return Err(DataKeepError::NotFound(format!("Database '{}'", database_id)));
        }
        inner.records.remove(database_id);
        log::info!("Removed database '{}' (memory)", database_id);
        Ok(())
    }

    fn database(&self, database_id: &str) -> DataKeepResult<Option<Database>> {
        Ok(self.lock().databases.get(database_id).cloned())
    }

    fn open_session(&self, database_id: &str) -> DataKeepResult<Session> {
        let mut inner = self.lock();
        if !inner.databases.contains_key(database_id) {
            return Err(DataKeepError::NotFound(format!("Database '{}'", database_id)));
        }
        let session = Session::new(database_id);
        inner.sessions.insert(session.session_id().to_string());
        Ok(session)
    }

    fn close_session(&self, session: Session) -> DataKeepResult<()> {
        self.lock().sessions.remove(session.session_id());
        Ok(())
    }

    fn get(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: &str,
    ) -> DataKeepResult<Option<StoredRecord>> {
        let inner = self.lock();
        assert_session(&inner, session)?;
        Ok(inner
            .records
            .get(session.database_id())
            .and_then(|records| {
                records.get(&(dataset_id.to_string(), record_id.to_string()))
            })
            .cloned())
    }

    fn first_or_default(
        &self,
        session: &Session,
        dataset_id: &str,
        predicate: &Predicate,
    ) -> DataKeepResult<Option<StoredRecord>> {
        Ok(self.find(session, dataset_id, predicate)?.into_iter().next())
    }

    fn find(
        &self,
        session: &Session,
        dataset_id: &str,
        predicate: &Predicate,
    ) -> DataKeepResult<Vec<StoredRecord>> {
        let inner = self.lock();
        assert_session(&inner, session)?;
        let records = match inner.records.get(session.database_id()) {
            Some(records) => records,
            None => return Ok(Vec::new()),
        };
        Ok(records
            .iter()
            .filter(|((dataset, _), record)| {
                dataset == dataset_id && predicate.matches(&record.document)
            })
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn commit(&self, session: &Session, write: LoggedWrite<'_>) -> DataKeepResult<WriteOutcome> {
        let mut inner = self.lock();
        assert_session(&inner, session)?;
        let database_id = session.database_id().to_string();
        let definition = inner
            .databases
            .get(&database_id)
            .cloned()
            .ok_or_else(|| DataKeepError::NotFound(format!("Database '{}'", database_id)))?;

        // All checks run before any state is touched, so an error leaves
        // nothing half-applied.
        if let Some(consume) = write.consume {
            let known = inner
                .logs
                .get(&database_id)
                .map_or(false, |logs| logs.iter().any(|l| l.log_id == consume.log_id));
            if !known {
                return Err(DataKeepError::NotFound(format!(
                    "Log entry '{}'",
                    consume.log_id
                )));
            }
        }

        let mut outcome = WriteOutcome::default();
        if let Some(op) = &write.op {
            match op {
                WriteOp::Add {
                    dataset_id,
                    record_id,
                    document,
                } => {
                    validate_document(&definition, dataset_id, document)?;
                    let records = inner.records.entry(database_id.clone()).or_default();
                    let key = (dataset_id.clone(), record_id.clone());
                    if records.contains_key(&key) {
                        return Err(DataKeepError::AlreadyExists(format!(
                            "Record '{}' in dataset '{}'",
                            record_id, dataset_id
                        )));
                    }
                    let record =
                        StoredRecord::new(record_id.clone(), dataset_id.clone(), document.clone());
                    records.insert(key, record.clone());
                    outcome.record = Some(record);
                }
                WriteOp::Change {
                    dataset_id,
                    record_id,
                    document,
                    expected_version,
                } => {
                    validate_document(&definition, dataset_id, document)?;
                    let records = inner.records.entry(database_id.clone()).or_default();
                    let key = (dataset_id.clone(), record_id.clone());
                    let existing = records.get(&key).cloned().ok_or_else(|| {
                        DataKeepError::NotFound(format!(
                            "Record '{}' in dataset '{}'",
                            record_id, dataset_id
                        ))
                    })?;
                    if let Some(expected) = expected_version {
                        if *expected != existing.version {
                            return Err(DataKeepError::ConcurrencyConflict(format!(
                                "Record '{}' changed since it was read",
                                record_id
                            )));
                        }
                    }
                    let updated = existing.with_document(document.clone());
                    records.insert(key, updated.clone());
                    outcome.before = Some(existing);
                    outcome.record = Some(updated);
                }
                WriteOp::Delete {
                    dataset_id,
                    record_id,
                } => {
                    let records = inner.records.entry(database_id.clone()).or_default();
                    let key = (dataset_id.clone(), record_id.clone());
                    let removed = records.remove(&key).ok_or_else(|| {
                        DataKeepError::NotFound(format!(
                            "Record '{}' in dataset '{}'",
                            record_id, dataset_id
                        ))
                    })?;
                    outcome.before = Some(removed);
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let logs = inner.logs.entry(database_id).or_default();
        if let Some(consume) = write.consume {
            if let Some(target) = logs.iter_mut().find(|l| l.log_id == consume.log_id) {
                target.consumed = true;
            }
        }
        let mut log = write.log.clone();
        log.seq = seq;
        logs.push(log);
        Ok(outcome)
    }

    fn get_log(&self, session: &Session, log_id: &str) -> DataKeepResult<Option<LogRecord>> {
        let inner = self.lock();
        assert_session(&inner, session)?;
        Ok(inner
            .logs
            .get(session.database_id())
            .and_then(|logs| logs.iter().find(|l| l.log_id == log_id))
            .cloned())
    }

    fn query_logs(&self, session: &Session, filter: &LogFilter) -> DataKeepResult<Vec<LogRecord>> {
        let inner = self.lock();
        assert_session(&inner, session)?;
        Ok(inner
            .logs
            .get(session.database_id())
            .map(|logs| logs.iter().filter(|l| filter.matches(l)).cloned().collect())
            .unwrap_or_default())
    }
}
