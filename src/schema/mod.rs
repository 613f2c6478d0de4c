//! Schema model: typed field trees describing the shape of a dataset.
//!
//! Pure data plus validation; no I/O happens here. Field names become
//! storage path keys, so sibling names must stay unique after case
//! normalization and identifiers may not contain path separators.

pub mod mapper;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::ProviderKind;
use crate::error::{DataKeepError, DataKeepResult};

/// Value type of a single field slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

/// A typed slot in a dataset, possibly owning nested fields.
///
/// Object and Array fields carry an ordered child list; the model is a tree
/// by construction, so acyclicity needs no separate check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub field_id: String,
    pub name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Field>,
}

impl Field {
    pub fn new(field_id: impl Into<String>, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            field_id: field_id.into(),
            name: name.into(),
            data_type,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Field>) -> Self {
        self.children = children;
        self
    }
}

/// Named schema: an ordered sequence of field definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub dataset_id: String,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Dataset {
    pub fn new(dataset_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    /// Validates the field tree: unique sibling ids, no case-normalized
    /// name collisions, children only under Object/Array fields.
    pub fn validate(&self) -> DataKeepResult<()> {
        validate_identifier(&self.dataset_id, "dataset id")?;
        validate_fields(&self.fields, &self.dataset_id)
    }

    /// Relative document paths declared by this schema, camelCased the way
    /// the document mapper emits them.
    pub fn declared_paths(&self) -> HashSet<String> {
        let mut paths = HashSet::new();
        collect_paths(&self.fields, "", &mut paths);
        paths
    }
}

/// Container of datasets bound to one storage provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub database_id: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    pub access_mode: AccessMode,
    /// Whether documents may carry fields the schema does not declare.
    pub allow_undeclared: bool,
}

/// How content access is gated for a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Every authenticated actor may read and write content.
    Open,
    /// Content access is resolved against permission entries.
    Custom,
}

impl Database {
    pub fn new(database_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            database_id: database_id.into(),
            provider,
            datasets: Vec::new(),
            access_mode: AccessMode::Custom,
            allow_undeclared: false,
        }
    }

    pub fn with_datasets(mut self, datasets: Vec<Dataset>) -> Self {
        self.datasets = datasets;
        self
    }

    pub fn with_access_mode(mut self, access_mode: AccessMode) -> Self {
        self.access_mode = access_mode;
        self
    }

    pub fn with_allow_undeclared(mut self, allow_undeclared: bool) -> Self {
        self.allow_undeclared = allow_undeclared;
        self
    }

    pub fn validate(&self) -> DataKeepResult<()> {
        validate_identifier(&self.database_id, "database id")?;
        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if !seen.insert(dataset.dataset_id.as_str()) {
                return Err(DataKeepError::AlreadyExists(format!(
                    "Duplicate dataset id '{}' in database '{}'",
                    dataset.dataset_id, self.database_id
                )));
            }
            dataset.validate()?;
        }
        Ok(())
    }

    pub fn dataset(&self, dataset_id: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.dataset_id == dataset_id)
    }
}

/// Identifiers end up inside storage keys and uri paths.
pub(crate) fn validate_identifier(id: &str, what: &str) -> DataKeepResult<()> {
    if id.is_empty() {
        return Err(DataKeepError::SchemaViolation(format!("Empty {}", what)));
    }
    if id.contains('/') || id.contains(':') {
        return Err(DataKeepError::SchemaViolation(format!(
            "Invalid {} '{}': '/' and ':' are reserved",
            what, id
        )));
    }
    Ok(())
}

fn validate_fields(fields: &[Field], scope: &str) -> DataKeepResult<()> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for field in fields {
        validate_identifier(&field.field_id, "field id")?;
        validate_identifier(&field.name, "field name")?;
        if !ids.insert(field.field_id.as_str()) {
            return Err(DataKeepError::AlreadyExists(format!(
                "Duplicate field id '{}' under '{}'",
                field.field_id, scope
            )));
        }
        if !names.insert(field.name.to_lowercase()) {
            return Err(DataKeepError::SchemaViolation(format!(
                "Field name '{}' under '{}' collides after case normalization",
                field.name, scope
            )));
        }
        match field.data_type {
            DataType::Object | DataType::Array => {
                validate_fields(&field.children, &format!("{}/{}", scope, field.name))?;
            }
            _ if !field.children.is_empty() => {
                return Err(DataKeepError::SchemaViolation(format!(
                    "Scalar field '{}' under '{}' cannot own child fields",
                    field.name, scope
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn collect_paths(fields: &[Field], prefix: &str, out: &mut HashSet<String>) {
    for field in fields {
        let segment = mapper::camel_case(&field.name);
        let path = if prefix.is_empty() {
            segment
        } else {
            format!("{}/{}", prefix, segment)
        };
        collect_paths(&field.children, &path, out);
        out.insert(path);
    }
}
