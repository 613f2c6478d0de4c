//! Durability and atomicity tests for the sled provider.

use datakeep::{
    AuthContext, DataService, DataType, Database, Dataset, ErrorType, Field, LogFilter,
    ProviderKind, StoreConfig,
};
use serde_json::json;
use tempfile::TempDir;

fn sled_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(dir.path().join("store")).with_provider(ProviderKind::Sled)
}

fn notes_database() -> Database {
    Database::new("notes", ProviderKind::Sled).with_datasets(vec![Dataset::new(
        "entries",
        "Entries",
    )
    .with_fields(vec![
        Field::new("f1", "title", DataType::String),
        Field::new("f2", "body", DataType::String),
    ])])
}

#[test]
fn records_and_logs_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let admin = AuthContext::system();

    let record_id = {
        let svc = DataService::new(sled_config(&dir)).unwrap();
        svc.create_database(&admin, notes_database());
        let added = svc.add_record(
            &admin,
            "notes",
            "entries",
            None,
            json!({"title": "first", "body": "hello"}),
        );
        assert!(added.is_ok(), "{}", added.message);
        added.payload.unwrap()["recordId"].as_str().unwrap().to_string()
    };

    // A fresh service instance re-registers persisted databases from the
    // system records and sees the data.
    let svc = DataService::new(sled_config(&dir)).unwrap();
    let fetched = svc.get_record(&admin, "notes", "entries", &record_id);
    assert!(fetched.is_ok(), "{}", fetched.message);
    assert_eq!(fetched.payload.unwrap()["document"]["title"], "first");

    let logs = svc
        .query_logs(&admin, "notes", &LogFilter::record_id(&record_id))
        .payload
        .unwrap();
    assert_eq!(logs.as_array().unwrap().len(), 1);
}

#[test]
fn failed_write_leaves_no_log_entry() {
    let dir = TempDir::new().unwrap();
    let admin = AuthContext::system();
    let svc = DataService::new(sled_config(&dir)).unwrap();
    svc.create_database(&admin, notes_database());

    let rejected = svc.add_record(
        &admin,
        "notes",
        "entries",
        None,
        json!({"undeclared": true}),
    );
    assert_eq!(rejected.error_type, ErrorType::SchemaViolation);
    let logs = svc
        .query_logs(&admin, "notes", &LogFilter::new())
        .payload
        .unwrap();
    assert!(logs.as_array().unwrap().is_empty());
}

#[test]
fn reset_on_sled_is_atomic_and_idempotent() {
    let dir = TempDir::new().unwrap();
    let admin = AuthContext::system();
    let svc = DataService::new(sled_config(&dir)).unwrap();
    svc.create_database(&admin, notes_database());

    let record_id = svc
        .add_record(&admin, "notes", "entries", None, json!({"title": "t", "body": "b"}))
        .payload
        .unwrap()["recordId"]
        .as_str()
        .unwrap()
        .to_string();
    svc.delete_record(&admin, "notes", "entries", &record_id);
    let delete_log_id = svc
        .query_logs(
            &admin,
            "notes",
            &LogFilter::record_id(&record_id).with(
                datakeep::LogFilterKind::Action,
                datakeep::LogFilterOp::Equals,
                "Delete",
            ),
        )
        .payload
        .unwrap()[0]["logId"]
        .as_str()
        .unwrap()
        .to_string();

    assert!(svc.reset(&admin, "notes", &delete_log_id).is_ok());
    assert!(svc.get_record(&admin, "notes", "entries", &record_id).is_ok());
    let log_count = |svc: &DataService| {
        svc.query_logs(&admin, "notes", &LogFilter::new())
            .payload
            .unwrap()
            .as_array()
            .unwrap()
            .len()
    };
    let after_first = log_count(&svc);
    assert!(svc.reset(&admin, "notes", &delete_log_id).is_ok());
    assert_eq!(log_count(&svc), after_first);
}

#[test]
fn versions_increment_across_changes_on_sled() {
    let dir = TempDir::new().unwrap();
    let admin = AuthContext::system();
    let svc = DataService::new(sled_config(&dir)).unwrap();
    svc.create_database(&admin, notes_database());

    let record_id = svc
        .add_record(&admin, "notes", "entries", None, json!({"title": "a", "body": "x"}))
        .payload
        .unwrap()["recordId"]
        .as_str()
        .unwrap()
        .to_string();
    let v2 = svc.change_record(&admin, "notes", "entries", &record_id, json!({"title": "b"}));
    assert_eq!(v2.payload.unwrap()["version"], 2);
    let v3 = svc.change_record(&admin, "notes", "entries", &record_id, json!({"title": "c"}));
    assert_eq!(v3.payload.unwrap()["version"], 3);
}
