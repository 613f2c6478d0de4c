//! datakeep: a permission-gated, audit-logged document record store.
//!
//! Databases declare datasets with typed field schemas; records are JSON
//! documents validated against those schemas. Every mutation commits
//! atomically with an audit log entry that can later be replayed to
//! reverse it. Access is resolved through hierarchical, tri-state
//! permissions per user or role. Two storage providers ship in-tree: an
//! in-memory reference store and a durable sled-backed store.
//!
//! [`DataService`] is the entry point; construct it from a [`StoreConfig`]
//! and call its `Response`-returning operations with an [`AuthContext`]
//! obtained from `verify_credentials`.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod permissions;
pub mod response;
pub mod schema;
pub mod service;
pub mod store;

pub use audit::{AuditEngine, LogAction, LogFilter, LogFilterKind, LogFilterOp, LogRecord};
pub use auth::AuthContext;
pub use config::{ProviderKind, StoreConfig};
pub use error::{DataKeepError, DataKeepResult, ErrorType};
pub use permissions::{
    AccessUriScheme, MemberIdKind, PermissionAction, PermissionEntry, PermissionResolver,
    PermissionValue, PermissionValues,
};
pub use response::Response;
pub use schema::{AccessMode, DataType, Database, Dataset, Field};
pub use service::{DataService, SYSTEM_DATABASE_ID};
pub use store::{
    FieldPredicate, MemoryStore, Predicate, PredicateOp, RecordStore, Session, SledStore,
    StoredRecord,
};
