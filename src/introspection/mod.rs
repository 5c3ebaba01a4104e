//! Schema Introspection Module
//!
//! The read side of the pipeline: something that can list tables and describe
//! each one. The monitor only ever talks to a [`SchemaInspector`]; the
//! PostgreSQL implementation and the in-memory one are interchangeable.

pub mod memory;
pub mod postgres;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryInspector;
pub use postgres::PostgresInspector;

/// Column definition as reported by the inspector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub autoincrement: bool,
}

impl ColumnDef {
    /// Convenience constructor for a nullable column without default
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            is_primary_key: false,
            autoincrement: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    /// Adding this column to a populated table fails without a backfill
    pub fn requires_backfill(&self) -> bool {
        !self.nullable && self.default_value.is_none() && !self.autoincrement
    }
}

/// Index representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    #[serde(default)]
    pub is_primary: bool,
}

/// Foreign key relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyDef {
    pub constraint_name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    #[serde(default = "default_rule")]
    pub on_update: String,
    #[serde(default = "default_rule")]
    pub on_delete: String,
}

fn default_rule() -> String {
    "NO ACTION".to_string()
}

/// Constraint kinds tracked besides primary and foreign keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Unique,
    Check,
}

/// Named unique/check constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDef {
    pub name: String,
    pub kind: ConstraintKind,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expression: Option<String>,
}

/// Everything the inspector knows about one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDef>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKeyDef) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn constraint(mut self, constraint: ConstraintDef) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Black-box schema reader consumed by the monitor
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    /// Names of every user table
    async fn get_all_tables(&self) -> AppResult<Vec<String>>;

    /// Full structural description of one table
    async fn analyze_table(&self, name: &str) -> AppResult<TableInfo>;
}
