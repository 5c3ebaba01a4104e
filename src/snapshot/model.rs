//! Schema snapshot value type
//!
//! A snapshot is immutable once built. Every map is a `BTreeMap`, so the
//! serialized form has a stable key order and the content hash does not depend
//! on the order the inspector reported columns or tables in.

use crate::error::{malformed_error, AppResult};
use crate::introspection::{ColumnDef, ConstraintDef, ForeignKeyDef, IndexDef, TableInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Snapshot format tag written alongside every snapshot
pub const METADATA_VERSION: &str = "1.0";

/// Structural record for one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStructure {
    pub columns: BTreeMap<String, ColumnDef>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexDef>,
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, ForeignKeyDef>,
    #[serde(default)]
    pub constraints: BTreeMap<String, ConstraintDef>,
}

impl From<TableInfo> for TableStructure {
    fn from(info: TableInfo) -> Self {
        Self {
            columns: info.columns.into_iter().map(|c| (c.name.clone(), c)).collect(),
            indexes: info.indexes.into_iter().map(|i| (i.name.clone(), i)).collect(),
            foreign_keys: info
                .foreign_keys
                .into_iter()
                .map(|fk| (fk.constraint_name.clone(), fk))
                .collect(),
            constraints: info
                .constraints
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }
}

impl TableStructure {
    /// Names of indexes, constraints and foreign keys that reference `column`
    pub fn dependents_of(&self, column: &str) -> Vec<String> {
        let mut dependents: Vec<String> = Vec::new();
        dependents.extend(
            self.indexes
                .values()
                .filter(|i| i.columns.iter().any(|c| c == column))
                .map(|i| i.name.clone()),
        );
        dependents.extend(
            self.constraints
                .values()
                .filter(|c| c.columns.iter().any(|c| c == column))
                .map(|c| c.name.clone()),
        );
        dependents.extend(
            self.foreign_keys
                .values()
                .filter(|fk| fk.columns.iter().any(|c| c == column))
                .map(|fk| fk.constraint_name.clone()),
        );
        dependents
    }

    /// Check internal consistency: map keys match names, referenced columns exist
    pub fn validate(&self, table: &str) -> AppResult<()> {
        if self.columns.is_empty() {
            return Err(malformed_error(format!("table {} has no columns", table)));
        }
        for (key, column) in &self.columns {
            if key != &column.name {
                return Err(malformed_error(format!(
                    "column key '{}' does not match column name '{}' in table {}",
                    key, column.name, table
                )));
            }
            if column.data_type.trim().is_empty() {
                return Err(malformed_error(format!(
                    "column {}.{} has no data type",
                    table, column.name
                )));
            }
        }
        let known: BTreeSet<&str> = self.columns.keys().map(String::as_str).collect();
        for (key, index) in &self.indexes {
            if key != &index.name {
                return Err(malformed_error(format!(
                    "index key '{}' does not match index name '{}' in table {}",
                    key, index.name, table
                )));
            }
            if let Some(missing) = index.columns.iter().find(|c| !known.contains(c.as_str())) {
                return Err(malformed_error(format!(
                    "index {} on {} references unknown column {}",
                    index.name, table, missing
                )));
            }
        }
        for (key, fk) in &self.foreign_keys {
            if key != &fk.constraint_name {
                return Err(malformed_error(format!(
                    "foreign key key '{}' does not match constraint name '{}' in table {}",
                    key, fk.constraint_name, table
                )));
            }
            if let Some(missing) = fk.columns.iter().find(|c| !known.contains(c.as_str())) {
                return Err(malformed_error(format!(
                    "foreign key {} on {} references unknown column {}",
                    fk.constraint_name, table, missing
                )));
            }
        }
        for (key, constraint) in &self.constraints {
            if key != &constraint.name {
                return Err(malformed_error(format!(
                    "constraint key '{}' does not match constraint name '{}' in table {}",
                    key, constraint.name, table
                )));
            }
        }
        Ok(())
    }
}

/// Complete schema snapshot at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub timestamp: DateTime<Utc>,
    pub schema_hash: String,
    pub tables: BTreeMap<String, TableStructure>,
    pub metadata_version: String,
}

impl SchemaSnapshot {
    /// Build a snapshot from a table map, computing its hash
    pub fn new(tables: BTreeMap<String, TableStructure>, timestamp: DateTime<Utc>) -> Self {
        let schema_hash = Self::compute_hash(&tables);
        Self {
            timestamp,
            schema_hash,
            tables,
            metadata_version: METADATA_VERSION.to_string(),
        }
    }

    /// Build a snapshot straight from inspector output
    pub fn from_tables(tables: impl IntoIterator<Item = TableInfo>, timestamp: DateTime<Utc>) -> Self {
        let map = tables
            .into_iter()
            .map(|t| (t.name.clone(), TableStructure::from(t)))
            .collect();
        Self::new(map, timestamp)
    }

    /// Compute checksum from schema content
    pub fn compute_hash(tables: &BTreeMap<String, TableStructure>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(tables).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    /// Same structure as `other`, judged by content hash
    pub fn same_structure(&self, other: &SchemaSnapshot) -> bool {
        self.schema_hash == other.schema_hash
    }

    /// Reject snapshots whose hash or table records are inconsistent
    pub fn validate(&self) -> AppResult<()> {
        let expected = Self::compute_hash(&self.tables);
        if expected != self.schema_hash {
            return Err(malformed_error(format!(
                "schema hash {} does not match content (expected {})",
                self.schema_hash, expected
            )));
        }
        for (name, table) in &self.tables {
            if name.trim().is_empty() {
                return Err(malformed_error("snapshot contains an unnamed table"));
            }
            table.validate(name)?;
        }
        Ok(())
    }

    pub fn table_names(&self) -> BTreeSet<&str> {
        self.tables.keys().map(String::as_str).collect()
    }
}
