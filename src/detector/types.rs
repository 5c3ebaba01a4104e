//! Change analysis records produced by the detector

use crate::introspection::ColumnDef;
use crate::snapshot::change::{ChangeType, SchemaChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How much a change can hurt existing consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactLevel::Minimal => "minimal",
            ImpactLevel::Low => "low",
            ImpactLevel::Medium => "medium",
            ImpactLevel::High => "high",
            ImpactLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment approach for applying a table's changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    DirectMigration,
    RollingMigration,
    BlueGreenDeployment,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::DirectMigration => "direct_migration",
            MigrationStrategy::RollingMigration => "rolling_migration",
            MigrationStrategy::BlueGreenDeployment => "blue_green_deployment",
        }
    }
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative effort estimate for a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

/// Summary kind of everything that happened to one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableChangeKind {
    TableCreation,
    TableRemoval,
    TableRename,
    SchemaModification,
}

/// Analysis of one column-level change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnChange {
    pub column_name: String,
    pub change_type: ChangeType,
    pub old_definition: Option<ColumnDef>,
    pub new_definition: Option<ColumnDef>,
    pub impact_level: ImpactLevel,
    pub backward_compatible: bool,
    pub migration_required: bool,
    pub suggested_migration: Option<String>,
}

/// Analysis of one index, constraint or foreign key change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectChange {
    pub name: String,
    pub change_type: ChangeType,
    pub impact_level: ImpactLevel,
    pub backward_compatible: bool,
}

/// Every change touching one table, with the derived strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChange {
    pub table_name: String,
    pub change_type: TableChangeKind,
    pub column_changes: Vec<ColumnChange>,
    pub index_changes: Vec<ObjectChange>,
    pub constraint_changes: Vec<ObjectChange>,
    pub relationship_changes: Vec<ObjectChange>,
    pub overall_impact: ImpactLevel,
    pub migration_strategy: MigrationStrategy,
}

/// Full result of comparing two snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaComparison {
    pub old_hash: String,
    pub new_hash: String,
    pub changes: Vec<SchemaChange>,
    pub table_changes: Vec<TableChange>,
    pub impact_summary: BTreeMap<ImpactLevel, usize>,
    pub breaking_changes: Vec<SchemaChange>,
    pub migration_required: bool,
    pub estimated_effort: Effort,
    pub compared_at: DateTime<Utc>,
}

impl SchemaComparison {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn impact_count(&self, level: ImpactLevel) -> usize {
        self.impact_summary.get(&level).copied().unwrap_or(0)
    }
}
