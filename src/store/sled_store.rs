//! Sled-backed provider.
//!
//! Records and log entries live in two named trees keyed by
//! `record:{db}:{dataset}:{id}` and `log:{db}:{seq}:{id}`. A logged commit
//! runs as a multi-tree sled transaction, so the data mutation and its log
//! entry persist atomically; trees are flushed after every durable write.

use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use crate::audit::{LogFilter, LogRecord};
use crate::error::{DataKeepError, DataKeepResult};
use crate::schema::Database;
use crate::store::{
    validate_document, LoggedWrite, Predicate, RecordStore, Session, StoredRecord, WriteOp,
    WriteOutcome,
};

pub struct SledStore {
    db: sled::Db,
    records: sled::Tree,
    logs: sled::Tree,
    databases: RwLock<HashMap<String, Database>>,
    sessions: RwLock<HashSet<String>>,
}

impl SledStore {
    pub fn open(path: &Path) -> DataKeepResult<Self> {
        let db = sled::open(path)?;
        let records = db.open_tree("records")?;
        let logs = db.open_tree("audit_log")?;
        log::info!("Opened sled store at {}", path.display());
        Ok(Self {
            db,
            records,
            logs,
            databases: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashSet::new()),
        })
    }

    fn record_key(database_id: &str, dataset_id: &str, record_id: &str) -> String {
        format!("record:{}:{}:{}", database_id, dataset_id, record_id)
    }

    fn dataset_prefix(database_id: &str, dataset_id: &str) -> String {
        format!("record:{}:{}:", database_id, dataset_id)
    }

    /// Zero-padded seq keeps the tree's key order equal to write order.
    fn log_key(database_id: &str, seq: u64, log_id: &str) -> String {
        format!("log:{}:{:020}:{}", database_id, seq, log_id)
    }

    fn log_prefix(database_id: &str) -> String {
        format!("log:{}:", database_id)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DataKeepResult<T> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }

    fn assert_session(&self, session: &Session) -> DataKeepResult<()> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        if sessions.contains(session.session_id()) {
            Ok(())
        } else {
            Err(DataKeepError::Provider(format!(
                "Session '{}' is not open",
                session.session_id()
            )))
        }
    }

    fn definition(&self, database_id: &str) -> DataKeepResult<Database> {
        self.databases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(database_id)
            .cloned()
            .ok_or_else(|| DataKeepError::NotFound(format!("Database '{}'", database_id)))
    }
}

impl RecordStore for SledStore {
    fn register_database(&self, definition: Database) -> DataKeepResult<()> {
        definition.validate()?;
        let mut databases = self.databases.write().unwrap_or_else(|p| p.into_inner());
        if databases.contains_key(&definition.database_id) {
            return Err(DataKeepError::AlreadyExists(format!(
                "Database '{}'",
                definition.database_id
            )));
        }
        log::info!("Registered database '{}' (sled)", definition.database_id);
        databases.insert(definition.database_id.clone(), definition);
        Ok(())
    }

    fn update_database(&self, definition: Database) -> DataKeepResult<()> {
        definition.validate()?;
        let mut databases = self.databases.write().unwrap_or_else(|p| p.into_inner());
        if !databases.contains_key(&definition.database_id) {
            return Err(DataKeepError::NotFound(format!(
                "Database '{}'",
                definition.database_id
            )));
        }
        databases.insert(definition.database_id.clone(), definition);
        Ok(())
    }

    fn remove_database(&self, database_id: &str) -> DataKeepResult<()> {
        {
            let mut databases = self.databases.write().unwrap_or_else(|p| p.into_inner());
            if databases.remove(database_id).is_none() {
                return Err(DataKeepError::NotFound(format!("Database '{}'", database_id)));
            }
        }
        let prefix = format!("record:{}:", database_id);
        let mut keys = Vec::new();
        for item in self.records.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            keys.push(key);
        }
        for key in keys {
            self.records.remove(key)?;
        }
        self.records.flush()?;
        log::info!("Removed database '{}' (sled)", database_id);
        Ok(())
    }

    fn database(&self, database_id: &str) -> DataKeepResult<Option<Database>> {
        Ok(self
            .databases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(database_id)
            .cloned())
    }

    fn open_session(&self, database_id: &str) -> DataKeepResult<Session> {
        self.definition(database_id)?;
        let session = Session::new(database_id);
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session.session_id().to_string());
        Ok(session)
    }

    fn close_session(&self, session: Session) -> DataKeepResult<()> {
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session.session_id());
        Ok(())
    }

    fn get(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: &str,
    ) -> DataKeepResult<Option<StoredRecord>> {
        self.assert_session(session)?;
        let key = Self::record_key(session.database_id(), dataset_id, record_id);
        match self.records.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn first_or_default(
        &self,
        session: &Session,
        dataset_id: &str,
        predicate: &Predicate,
    ) -> DataKeepResult<Option<StoredRecord>> {
        self.assert_session(session)?;
        let prefix = Self::dataset_prefix(session.database_id(), dataset_id);
        for item in self.records.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let record: StoredRecord = Self::decode(&bytes)?;
            if predicate.matches(&record.document) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn find(
        &self,
        session: &Session,
        dataset_id: &str,
        predicate: &Predicate,
    ) -> DataKeepResult<Vec<StoredRecord>> {
        self.assert_session(session)?;
        let prefix = Self::dataset_prefix(session.database_id(), dataset_id);
        let mut results = Vec::new();
        for item in self.records.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let record: StoredRecord = Self::decode(&bytes)?;
            if predicate.matches(&record.document) {
                results.push(record);
            }
        }
        Ok(results)
    }

    fn commit(&self, session: &Session, write: LoggedWrite<'_>) -> DataKeepResult<WriteOutcome> {
        self.assert_session(session)?;
        let database_id = session.database_id().to_string();
        let definition = self.definition(&database_id)?;
        if let Some(op) = &write.op {
            match op {
                WriteOp::Add {
                    dataset_id,
                    document,
                    ..
                }
                | WriteOp::Change {
                    dataset_id,
                    document,
                    ..
                } => validate_document(&definition, dataset_id, document)?,
                WriteOp::Delete { .. } => {}
            }
        }

        let seq = self.db.generate_id()?;
        let mut log = write.log.clone();
        log.seq = seq;
        let log_key = Self::log_key(&database_id, seq, &log.log_id);
        let log_bytes = serde_json::to_vec(&log)?;
        let consume = match write.consume {
            Some(entry) => {
                let mut consumed = entry.clone();
                consumed.consumed = true;
                Some((
                    Self::log_key(&database_id, entry.seq, &entry.log_id),
                    serde_json::to_vec(&consumed)?,
                ))
            }
            None => None,
        };

        let op = write.op.clone();
        let result = (&self.records, &self.logs).transaction(|(records, logs)| {
            let mut outcome = WriteOutcome::default();
            if let Some(op) = &op {
                match op {
                    WriteOp::Add {
                        dataset_id,
                        record_id,
                        document,
                    } => {
                        let key = Self::record_key(&database_id, dataset_id, record_id);
                        if records.get(key.as_bytes())?.is_some() {
                            return Err(ConflictableTransactionError::Abort(
                                DataKeepError::AlreadyExists(format!(
                                    "Record '{}' in dataset '{}'",
                                    record_id, dataset_id
                                )),
                            ));
                        }
                        let record = StoredRecord::new(
                            record_id.clone(),
                            dataset_id.clone(),
                            document.clone(),
                        );
                        let bytes = serde_json::to_vec(&record).map_err(|e| {
                            ConflictableTransactionError::Abort(DataKeepError::from(e))
                        })?;
                        records.insert(key.as_bytes(), bytes)?;
                        outcome.record = Some(record);
                    }
                    WriteOp::Change {
                        dataset_id,
                        record_id,
                        document,
                        expected_version,
                    } => {
                        let key = Self::record_key(&database_id, dataset_id, record_id);
                        let existing: StoredRecord = match records.get(key.as_bytes())? {
                            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                                ConflictableTransactionError::Abort(DataKeepError::from(e))
                            })?,
                            None => {
                                return Err(ConflictableTransactionError::Abort(
                                    DataKeepError::NotFound(format!(
                                        "Record '{}' in dataset '{}'",
                                        record_id, dataset_id
                                    )),
                                ))
                            }
                        };
                        if let Some(expected) = expected_version {
                            if *expected != existing.version {
                                return Err(ConflictableTransactionError::Abort(
                                    DataKeepError::ConcurrencyConflict(format!(
                                        "Record '{}' changed since it was read",
                                        record_id
                                    )),
                                ));
                            }
                        }
                        let updated = existing.with_document(document.clone());
                        let bytes = serde_json::to_vec(&updated).map_err(|e| {
                            ConflictableTransactionError::Abort(DataKeepError::from(e))
                        })?;
                        records.insert(key.as_bytes(), bytes)?;
                        outcome.before = Some(existing);
                        outcome.record = Some(updated);
                    }
                    WriteOp::Delete {
                        dataset_id,
                        record_id,
                    } => {
                        let key = Self::record_key(&database_id, dataset_id, record_id);
                        match records.remove(key.as_bytes())? {
                            Some(bytes) => {
                                let removed: StoredRecord =
                                    serde_json::from_slice(&bytes).map_err(|e| {
                                        ConflictableTransactionError::Abort(DataKeepError::from(e))
                                    })?;
                                outcome.before = Some(removed);
                            }
                            None => {
                                return Err(ConflictableTransactionError::Abort(
                                    DataKeepError::NotFound(format!(
                                        "Record '{}' in dataset '{}'",
                                        record_id, dataset_id
                                    )),
                                ))
                            }
                        }
                    }
                }
            }
            if let Some((key, bytes)) = &consume {
                logs.insert(key.as_bytes(), bytes.clone())?;
            }
            logs.insert(log_key.as_bytes(), log_bytes.clone())?;
            Ok(outcome)
        });

        match result {
            Ok(outcome) => {
                self.records.flush()?;
                self.logs.flush()?;
                Ok(outcome)
            }
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn get_log(&self, session: &Session, log_id: &str) -> DataKeepResult<Option<LogRecord>> {
        self.assert_session(session)?;
        let prefix = Self::log_prefix(session.database_id());
        for item in self.logs.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let record: LogRecord = Self::decode(&bytes)?;
            if record.log_id == log_id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn query_logs(&self, session: &Session, filter: &LogFilter) -> DataKeepResult<Vec<LogRecord>> {
        self.assert_session(session)?;
        let prefix = Self::log_prefix(session.database_id());
        let mut results = Vec::new();
        for item in self.logs.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let record: LogRecord = Self::decode(&bytes)?;
            if filter.matches(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }
}
