//! Schema change events
//!
//! One [`SchemaChange`] is one atomic structural difference between two
//! snapshots. The payload is a tagged variant per change kind.

use crate::introspection::{ColumnDef, ConstraintDef, ForeignKeyDef, IndexDef};
use crate::snapshot::model::TableStructure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of structural change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    TableAdded,
    TableRemoved,
    TableRenamed,
    ColumnAdded,
    ColumnRemoved,
    ColumnModified,
    ColumnRenamed,
    IndexAdded,
    IndexRemoved,
    ConstraintAdded,
    ConstraintRemoved,
    ForeignKeyAdded,
    ForeignKeyRemoved,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::TableAdded => "table_added",
            ChangeType::TableRemoved => "table_removed",
            ChangeType::TableRenamed => "table_renamed",
            ChangeType::ColumnAdded => "column_added",
            ChangeType::ColumnRemoved => "column_removed",
            ChangeType::ColumnModified => "column_modified",
            ChangeType::ColumnRenamed => "column_renamed",
            ChangeType::IndexAdded => "index_added",
            ChangeType::IndexRemoved => "index_removed",
            ChangeType::ConstraintAdded => "constraint_added",
            ChangeType::ConstraintRemoved => "constraint_removed",
            ChangeType::ForeignKeyAdded => "foreign_key_added",
            ChangeType::ForeignKeyRemoved => "foreign_key_removed",
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            ChangeType::TableRemoved
                | ChangeType::ColumnRemoved
                | ChangeType::IndexRemoved
                | ChangeType::ConstraintRemoved
                | ChangeType::ForeignKeyRemoved
        )
    }

    pub fn is_index(&self) -> bool {
        matches!(self, ChangeType::IndexAdded | ChangeType::IndexRemoved)
    }

    /// Ordinal 1 (low) to 4 (critical)
    pub fn default_priority(&self) -> Priority {
        match self {
            ChangeType::TableRemoved => Priority::Critical,
            ChangeType::TableAdded
            | ChangeType::TableRenamed
            | ChangeType::ColumnRemoved
            | ChangeType::ColumnModified
            | ChangeType::ColumnRenamed => Priority::High,
            ChangeType::ColumnAdded
            | ChangeType::ConstraintAdded
            | ChangeType::ConstraintRemoved
            | ChangeType::ForeignKeyAdded
            | ChangeType::ForeignKeyRemoved => Priority::Medium,
            ChangeType::IndexAdded | ChangeType::IndexRemoved => Priority::Low,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing priority of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Column field compared by the diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnField {
    DataType,
    Nullable,
    DefaultValue,
    PrimaryKey,
    Autoincrement,
}

/// One field-level difference on a modified column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldModification {
    pub field: ColumnField,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Change payload, one variant per change kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeDetails {
    TableAdded {
        table: TableStructure,
    },
    TableRemoved {
        table: TableStructure,
    },
    TableRenamed {
        old_name: String,
        new_name: String,
        table: TableStructure,
    },
    ColumnAdded {
        column: ColumnDef,
        breaking_change: bool,
    },
    ColumnRemoved {
        column: ColumnDef,
        dependent_constraints: Vec<String>,
    },
    ColumnModified {
        column_name: String,
        old: ColumnDef,
        new: ColumnDef,
        modifications: Vec<FieldModification>,
        breaking_change: bool,
    },
    ColumnRenamed {
        old_name: String,
        new_name: String,
        column: ColumnDef,
    },
    IndexAdded {
        index: IndexDef,
    },
    IndexRemoved {
        index: IndexDef,
    },
    ConstraintAdded {
        constraint: ConstraintDef,
    },
    ConstraintRemoved {
        constraint: ConstraintDef,
    },
    ForeignKeyAdded {
        foreign_key: ForeignKeyDef,
    },
    ForeignKeyRemoved {
        foreign_key: ForeignKeyDef,
    },
}

impl ChangeDetails {
    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangeDetails::TableAdded { .. } => ChangeType::TableAdded,
            ChangeDetails::TableRemoved { .. } => ChangeType::TableRemoved,
            ChangeDetails::TableRenamed { .. } => ChangeType::TableRenamed,
            ChangeDetails::ColumnAdded { .. } => ChangeType::ColumnAdded,
            ChangeDetails::ColumnRemoved { .. } => ChangeType::ColumnRemoved,
            ChangeDetails::ColumnModified { .. } => ChangeType::ColumnModified,
            ChangeDetails::ColumnRenamed { .. } => ChangeType::ColumnRenamed,
            ChangeDetails::IndexAdded { .. } => ChangeType::IndexAdded,
            ChangeDetails::IndexRemoved { .. } => ChangeType::IndexRemoved,
            ChangeDetails::ConstraintAdded { .. } => ChangeType::ConstraintAdded,
            ChangeDetails::ConstraintRemoved { .. } => ChangeType::ConstraintRemoved,
            ChangeDetails::ForeignKeyAdded { .. } => ChangeType::ForeignKeyAdded,
            ChangeDetails::ForeignKeyRemoved { .. } => ChangeType::ForeignKeyRemoved,
        }
    }

    /// The explicit breaking flag carried by the payload. Renames always break
    /// consumers that address the object by name.
    pub fn breaking_change(&self) -> bool {
        match self {
            ChangeDetails::ColumnAdded { breaking_change, .. }
            | ChangeDetails::ColumnModified { breaking_change, .. } => *breaking_change,
            ChangeDetails::TableRenamed { .. } | ChangeDetails::ColumnRenamed { .. } => true,
            _ => false,
        }
    }

    /// Name of the object inside the table (column, index, constraint), if any
    pub fn object_name(&self) -> Option<&str> {
        match self {
            ChangeDetails::TableAdded { .. }
            | ChangeDetails::TableRemoved { .. }
            | ChangeDetails::TableRenamed { .. } => None,
            ChangeDetails::ColumnAdded { column, .. } | ChangeDetails::ColumnRemoved { column, .. } => {
                Some(column.name.as_str())
            }
            ChangeDetails::ColumnModified { column_name, .. } => Some(column_name.as_str()),
            ChangeDetails::ColumnRenamed { new_name, .. } => Some(new_name.as_str()),
            ChangeDetails::IndexAdded { index } | ChangeDetails::IndexRemoved { index } => {
                Some(index.name.as_str())
            }
            ChangeDetails::ConstraintAdded { constraint }
            | ChangeDetails::ConstraintRemoved { constraint } => Some(constraint.name.as_str()),
            ChangeDetails::ForeignKeyAdded { foreign_key }
            | ChangeDetails::ForeignKeyRemoved { foreign_key } => {
                Some(foreign_key.constraint_name.as_str())
            }
        }
    }
}

/// One atomic structural difference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChange {
    pub change_id: String,
    pub table_name: String,
    pub change_details: ChangeDetails,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
}

impl SchemaChange {
    pub fn new(table_name: impl Into<String>, details: ChangeDetails, timestamp: DateTime<Utc>) -> Self {
        let table_name = table_name.into();
        let change_type = details.change_type();
        let change_id = Self::compute_id(change_type, &table_name, details.object_name(), timestamp);
        Self {
            change_id,
            table_name,
            priority: change_type.default_priority(),
            change_details: details,
            timestamp,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_details.change_type()
    }

    /// Deterministic id: identical (type, table, object, timestamp) give identical ids
    pub fn compute_id(
        change_type: ChangeType,
        table: &str,
        object: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(change_type.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(table.as_bytes());
        hasher.update(b":");
        hasher.update(object.unwrap_or("").as_bytes());
        hasher.update(b":");
        hasher.update(timestamp.to_rfc3339().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    /// Short human-readable description
    pub fn describe(&self) -> String {
        match self.change_details.object_name() {
            Some(object) => format!("{} {}.{}", self.change_type(), self.table_name, object),
            None => format!("{} {}", self.change_type(), self.table_name),
        }
    }
}
