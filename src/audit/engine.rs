//! Audit log engine: writes a journal entry for every mutation and replays
//! entries to reverse them.
//!
//! Reset never rewrites history: it applies the inverse mutation through
//! the record store and appends its own Reset entry, consuming the source
//! entry in the same transaction.

use serde_json::Value;
use uuid::Uuid;

use crate::audit::{LogAction, LogRecord};
use crate::auth::AuthContext;
use crate::error::{DataKeepError, DataKeepResult};
use crate::store::{LoggedWrite, RecordStore, Session, StoredRecord, WriteOp};

pub struct AuditEngine<'a> {
    store: &'a dyn RecordStore,
}

impl<'a> AuditEngine<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store }
    }

    fn location(session: &Session, dataset_id: &str) -> String {
        format!("{}/{}", session.database_id(), dataset_id)
    }

    /// Adds a record and logs it. With `record_id == None` a fresh id is
    /// generated.
    pub fn logged_add(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: Option<String>,
        document: Value,
        actor: &AuthContext,
    ) -> DataKeepResult<StoredRecord> {
        let record_id = record_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let log = LogRecord::new(
            actor.user_id.clone(),
            Self::location(session, dataset_id),
            LogAction::Add,
            record_id.clone(),
            None,
            Some(document.clone()),
        );
        let outcome = self.store.commit(
            session,
            LoggedWrite {
                op: Some(WriteOp::Add {
                    dataset_id: dataset_id.to_string(),
                    record_id,
                    document,
                }),
                log: &log,
                consume: None,
            },
        )?;
        outcome
            .record
            .ok_or_else(|| DataKeepError::Provider("Add committed without a record".to_string()))
    }

    /// Replaces a record's document and logs the pre-mutation snapshot.
    pub fn logged_change(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: &str,
        document: Value,
        actor: &AuthContext,
    ) -> DataKeepResult<StoredRecord> {
        self.change_with_action(session, dataset_id, record_id, document, actor, LogAction::Change)
    }

    /// Same as a change, logged as a credential update so its reset
    /// restores the prior hash.
    pub fn logged_credential_change(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: &str,
        document: Value,
        actor: &AuthContext,
    ) -> DataKeepResult<StoredRecord> {
        self.change_with_action(
            session,
            dataset_id,
            record_id,
            document,
            actor,
            LogAction::ChangePassword,
        )
    }

    fn change_with_action(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: &str,
        document: Value,
        actor: &AuthContext,
        action: LogAction,
    ) -> DataKeepResult<StoredRecord> {
        let current = self
            .store
            .get(session, dataset_id, record_id)?
            .ok_or_else(|| {
                DataKeepError::NotFound(format!(
                    "Record '{}' in dataset '{}'",
                    record_id, dataset_id
                ))
            })?;
        let log = LogRecord::new(
            actor.user_id.clone(),
            Self::location(session, dataset_id),
            action,
            record_id.to_string(),
            Some(current.document.clone()),
            Some(document.clone()),
        );
        let outcome = self.store.commit(
            session,
            LoggedWrite {
                op: Some(WriteOp::Change {
                    dataset_id: dataset_id.to_string(),
                    record_id: record_id.to_string(),
                    document,
                    expected_version: Some(current.version),
                }),
                log: &log,
                consume: None,
            },
        )?;
        outcome
            .record
            .ok_or_else(|| DataKeepError::Provider("Change committed without a record".to_string()))
    }

    /// Deletes a record, logging its full document for replay.
    pub fn logged_delete(
        &self,
        session: &Session,
        dataset_id: &str,
        record_id: &str,
        actor: &AuthContext,
    ) -> DataKeepResult<StoredRecord> {
        let current = self
            .store
            .get(session, dataset_id, record_id)?
            .ok_or_else(|| {
                DataKeepError::NotFound(format!(
                    "Record '{}' in dataset '{}'",
                    record_id, dataset_id
                ))
            })?;
        let log = LogRecord::new(
            actor.user_id.clone(),
            Self::location(session, dataset_id),
            LogAction::Delete,
            record_id.to_string(),
            Some(current.document.clone()),
            None,
        );
        let outcome = self.store.commit(
            session,
            LoggedWrite {
                op: Some(WriteOp::Delete {
                    dataset_id: dataset_id.to_string(),
                    record_id: record_id.to_string(),
                }),
                log: &log,
                consume: None,
            },
        )?;
        outcome
            .before
            .ok_or_else(|| DataKeepError::Provider("Delete committed without a record".to_string()))
    }

    /// Reverses the mutation captured by a log entry.
    ///
    /// Idempotent per entry: a consumed entry returns success without
    /// touching data or writing a duplicate mutation. The target's current
    /// state is verified against the stored snapshots first; an intervening
    /// unrelated change surfaces as `ConcurrencyConflict`.
    pub fn reset(&self, session: &Session, log_id: &str, actor: &AuthContext) -> DataKeepResult<()> {
        let entry = self
            .store
            .get_log(session, log_id)?
            .ok_or_else(|| DataKeepError::NotFound(format!("Log entry '{}'", log_id)))?;
        if entry.consumed {
            log::debug!("Log entry '{}' already consumed, reset is a no-op", log_id);
            return Ok(());
        }
        let dataset_id = dataset_of(&entry.location)?;
        let current = self.store.get(session, &dataset_id, &entry.record_id)?;

        let op = match entry.action {
            LogAction::Add => match &current {
                Some(record) => {
                    if let Some(after) = &entry.snapshot_after {
                        if &record.document != after {
                            return Err(DataKeepError::ConcurrencyConflict(format!(
                                "Record '{}' was modified after the logged add",
                                entry.record_id
                            )));
                        }
                    }
                    Some(WriteOp::Delete {
                        dataset_id: dataset_id.clone(),
                        record_id: entry.record_id.clone(),
                    })
                }
                None => None,
            },
            LogAction::Change | LogAction::ChangePassword => {
                let before = entry.snapshot_before.clone().ok_or_else(|| {
                    DataKeepError::Provider(format!(
                        "Log entry '{}' is missing its snapshot",
                        log_id
                    ))
                })?;
                match &current {
                    Some(record) if record.document == before => None,
                    Some(record) => {
                        if let Some(after) = &entry.snapshot_after {
                            if &record.document != after {
                                return Err(DataKeepError::ConcurrencyConflict(format!(
                                    "Record '{}' was modified after the logged change",
                                    entry.record_id
                                )));
                            }
                        }
                        Some(WriteOp::Change {
                            dataset_id: dataset_id.clone(),
                            record_id: entry.record_id.clone(),
                            document: before,
                            expected_version: Some(record.version),
                        })
                    }
                    None => {
                        return Err(DataKeepError::ConcurrencyConflict(format!(
                            "Record '{}' no longer exists",
                            entry.record_id
                        )))
                    }
                }
            }
            LogAction::Delete => {
                let before = entry.snapshot_before.clone().ok_or_else(|| {
                    DataKeepError::Provider(format!(
                        "Log entry '{}' is missing its snapshot",
                        log_id
                    ))
                })?;
                match &current {
                    Some(record) if record.document == before => None,
                    Some(_) => {
                        return Err(DataKeepError::ConcurrencyConflict(format!(
                            "Record '{}' was re-created after the logged delete",
                            entry.record_id
                        )))
                    }
                    None => Some(WriteOp::Add {
                        dataset_id: dataset_id.clone(),
                        record_id: entry.record_id.clone(),
                        document: before,
                    }),
                }
            }
            LogAction::Reset => {
                return Err(DataKeepError::SchemaViolation(format!(
                    "Log entry '{}' is a reset entry and cannot be replayed",
                    log_id
                )))
            }
        };

        let reset_log = LogRecord::new(
            actor.user_id.clone(),
            entry.location.clone(),
            LogAction::Reset,
            entry.record_id.clone(),
            current.map(|record| record.document),
            entry.snapshot_before.clone(),
        );
        self.store.commit(
            session,
            LoggedWrite {
                op,
                log: &reset_log,
                consume: Some(&entry),
            },
        )?;
        log::info!(
            "Reset log entry '{}' ({:?} on '{}')",
            log_id,
            entry.action,
            entry.record_id
        );
        Ok(())
    }
}

fn dataset_of(location: &str) -> DataKeepResult<String> {
    location
        .split_once('/')
        .map(|(_, dataset)| dataset.to_string())
        .ok_or_else(|| {
            DataKeepError::Provider(format!("Malformed log location '{}'", location))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{LogFilter, LogFilterKind, LogFilterOp};
    use crate::config::ProviderKind;
    use crate::schema::{DataType, Database, Dataset, Field};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn setup() -> (MemoryStore, Session, AuthContext) {
        let store = MemoryStore::new();
        let database = Database::new("db", ProviderKind::Memory).with_datasets(vec![
            Dataset::new("people", "People").with_fields(vec![
                Field::new("f1", "name", DataType::String),
                Field::new("f2", "age", DataType::Number),
            ]),
        ]);
        store.register_database(database).unwrap();
        let session = store.open_session("db").unwrap();
        (store, session, AuthContext::new("u1", vec![], false))
    }

    #[test]
    fn test_add_change_delete_leaves_three_ordered_entries() {
        let (store, session, actor) = setup();
        let engine = AuditEngine::new(&store);
        let record = engine
            .logged_add(&session, "people", None, json!({"name": "Ada"}), &actor)
            .unwrap();
        engine
            .logged_change(
                &session,
                "people",
                &record.record_id,
                json!({"name": "Grace"}),
                &actor,
            )
            .unwrap();
        engine
            .logged_delete(&session, "people", &record.record_id, &actor)
            .unwrap();

        let logs = store
            .query_logs(&session, &LogFilter::record_id(&record.record_id))
            .unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].action, LogAction::Add);
        assert_eq!(logs[1].action, LogAction::Change);
        assert_eq!(logs[2].action, LogAction::Delete);
        assert!(logs[0].seq < logs[1].seq && logs[1].seq < logs[2].seq);
        assert_eq!(logs[1].snapshot_before, Some(json!({"name": "Ada"})));
        assert_eq!(logs[2].snapshot_before, Some(json!({"name": "Grace"})));
    }

    #[test]
    fn test_reset_of_delete_restores_the_document() {
        let (store, session, actor) = setup();
        let engine = AuditEngine::new(&store);
        let record = engine
            .logged_add(&session, "people", None, json!({"name": "Ada", "age": 36}), &actor)
            .unwrap();
        engine
            .logged_delete(&session, "people", &record.record_id, &actor)
            .unwrap();

        let delete_log = store
            .query_logs(
                &session,
                &LogFilter::record_id(&record.record_id).with(
                    LogFilterKind::Action,
                    LogFilterOp::Equals,
                    "Delete",
                ),
            )
            .unwrap()
            .pop()
            .unwrap();
        engine.reset(&session, &delete_log.log_id, &actor).unwrap();

        let restored = store
            .get(&session, "people", &record.record_id)
            .unwrap()
            .unwrap();
        assert_eq!(restored.document, json!({"name": "Ada", "age": 36}));

        // The source entry is consumed and a Reset entry was appended.
        let consumed = store.get_log(&session, &delete_log.log_id).unwrap().unwrap();
        assert!(consumed.consumed);
        let resets = store
            .query_logs(
                &session,
                &LogFilter::new().with(LogFilterKind::Action, LogFilterOp::Equals, "Reset"),
            )
            .unwrap();
        assert_eq!(resets.len(), 1);
    }

    #[test]
    fn test_reset_of_add_deletes_the_record() {
        let (store, session, actor) = setup();
        let engine = AuditEngine::new(&store);
        let record = engine
            .logged_add(&session, "people", None, json!({"name": "Ada"}), &actor)
            .unwrap();
        let add_log = store
            .query_logs(&session, &LogFilter::record_id(&record.record_id))
            .unwrap()
            .remove(0);
        engine.reset(&session, &add_log.log_id, &actor).unwrap();
        assert!(store
            .get(&session, "people", &record.record_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reset_of_change_restores_previous_document() {
        let (store, session, actor) = setup();
        let engine = AuditEngine::new(&store);
        let record = engine
            .logged_add(&session, "people", None, json!({"name": "Ada"}), &actor)
            .unwrap();
        engine
            .logged_change(
                &session,
                "people",
                &record.record_id,
                json!({"name": "Grace"}),
                &actor,
            )
            .unwrap();
        let change_log = store
            .query_logs(
                &session,
                &LogFilter::record_id(&record.record_id).with(
                    LogFilterKind::Action,
                    LogFilterOp::Equals,
                    "Change",
                ),
            )
            .unwrap()
            .pop()
            .unwrap();
        engine.reset(&session, &change_log.log_id, &actor).unwrap();
        let current = store
            .get(&session, "people", &record.record_id)
            .unwrap()
            .unwrap();
        assert_eq!(current.document, json!({"name": "Ada"}));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (store, session, actor) = setup();
        let engine = AuditEngine::new(&store);
        let record = engine
            .logged_add(&session, "people", None, json!({"name": "Ada"}), &actor)
            .unwrap();
        engine
            .logged_delete(&session, "people", &record.record_id, &actor)
            .unwrap();
        let delete_log = store
            .query_logs(
                &session,
                &LogFilter::record_id(&record.record_id).with(
                    LogFilterKind::Action,
                    LogFilterOp::Equals,
                    "Delete",
                ),
            )
            .unwrap()
            .pop()
            .unwrap();

        engine.reset(&session, &delete_log.log_id, &actor).unwrap();
        let logs_after_first = store.query_logs(&session, &LogFilter::new()).unwrap().len();
        let state_after_first = store
            .get(&session, "people", &record.record_id)
            .unwrap()
            .unwrap();

        // Second reset succeeds without data changes or new log entries.
        engine.reset(&session, &delete_log.log_id, &actor).unwrap();
        assert_eq!(
            store.query_logs(&session, &LogFilter::new()).unwrap().len(),
            logs_after_first
        );
        let state_after_second = store
            .get(&session, "people", &record.record_id)
            .unwrap()
            .unwrap();
        assert_eq!(state_after_first.document, state_after_second.document);
        assert_eq!(state_after_first.version, state_after_second.version);
    }

    #[test]
    fn test_reset_detects_intervening_change() {
        let (store, session, actor) = setup();
        let engine = AuditEngine::new(&store);
        let record = engine
            .logged_add(&session, "people", None, json!({"name": "Ada"}), &actor)
            .unwrap();
        let first_change = {
            engine
                .logged_change(
                    &session,
                    "people",
                    &record.record_id,
                    json!({"name": "Grace"}),
                    &actor,
                )
                .unwrap();
            store
                .query_logs(
                    &session,
                    &LogFilter::record_id(&record.record_id).with(
                        LogFilterKind::Action,
                        LogFilterOp::Equals,
                        "Change",
                    ),
                )
                .unwrap()
                .pop()
                .unwrap()
        };
        // An unrelated later change invalidates the first entry's replay.
        engine
            .logged_change(
                &session,
                "people",
                &record.record_id,
                json!({"name": "Barbara"}),
                &actor,
            )
            .unwrap();
        let err = engine
            .reset(&session, &first_change.log_id, &actor)
            .unwrap_err();
        assert!(matches!(err, DataKeepError::ConcurrencyConflict(_)));
    }

    #[test]
    fn test_reset_entries_cannot_be_replayed() {
        let (store, session, actor) = setup();
        let engine = AuditEngine::new(&store);
        let record = engine
            .logged_add(&session, "people", None, json!({"name": "Ada"}), &actor)
            .unwrap();
        let add_log = store
            .query_logs(&session, &LogFilter::record_id(&record.record_id))
            .unwrap()
            .remove(0);
        engine.reset(&session, &add_log.log_id, &actor).unwrap();
        let reset_log = store
            .query_logs(
                &session,
                &LogFilter::new().with(LogFilterKind::Action, LogFilterOp::Equals, "Reset"),
            )
            .unwrap()
            .pop()
            .unwrap();
        assert!(engine.reset(&session, &reset_log.log_id, &actor).is_err());
    }
}
