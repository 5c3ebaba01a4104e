//! Change Detector
//!
//! Turns raw structural changes into a risk-ranked analysis:
//! - Impact classification per change (minimal → critical)
//! - Breaking-change extraction
//! - Per-table grouping with a migration strategy
//! - Effort estimate over a whole comparison
//!
//! Everything here is a pure function of its input. Only malformed snapshots
//! produce an error.

pub mod compat;
pub mod types;

pub use compat::{is_column_modification_breaking, is_type_change_breaking};
pub use types::{
    ColumnChange, Effort, ImpactLevel, MigrationStrategy, ObjectChange, SchemaComparison,
    TableChange, TableChangeKind,
};

use crate::error::AppResult;
use crate::snapshot::change::{ChangeDetails, ChangeType, ColumnField, SchemaChange};
use crate::snapshot::diff::{DiffEngine, DiffOptions};
use crate::snapshot::model::SchemaSnapshot;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// CHANGE DETECTOR
// =============================================================================

/// Stateless analysis service over snapshots and change lists
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    options: DiffOptions,
}

impl ChangeDetector {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    /// Diff two snapshots and classify every resulting change.
    ///
    /// Both snapshots are validated first; inconsistent input is rejected with
    /// [`AppError::MalformedSnapshot`](crate::error::AppError::MalformedSnapshot).
    pub fn compare_schemas(
        &self,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
    ) -> AppResult<SchemaComparison> {
        old.validate()?;
        new.validate()?;

        let compared_at = Utc::now();
        let changes = DiffEngine::diff(old, new, self.options, compared_at);

        let mut impact_summary: BTreeMap<ImpactLevel, usize> = BTreeMap::new();
        for change in &changes {
            *impact_summary.entry(Self::classify_impact(change)).or_insert(0) += 1;
        }

        let breaking_changes: Vec<SchemaChange> = changes
            .iter()
            .filter(|c| Self::is_breaking(c))
            .cloned()
            .collect();

        let migration_required = changes.iter().any(|c| {
            matches!(
                c.change_type(),
                ChangeType::TableRemoved
                    | ChangeType::ColumnRemoved
                    | ChangeType::IndexRemoved
                    | ChangeType::ConstraintRemoved
                    | ChangeType::ForeignKeyRemoved
                    | ChangeType::ColumnModified
            )
        });

        let estimated_effort = Self::estimate_effort(&impact_summary, changes.len());
        let table_changes = Self::analyze_changes(&changes);

        debug!(
            changes = changes.len(),
            breaking = breaking_changes.len(),
            effort = ?estimated_effort,
            "Compared schemas"
        );

        Ok(SchemaComparison {
            old_hash: old.schema_hash.clone(),
            new_hash: new.schema_hash.clone(),
            changes,
            table_changes,
            impact_summary,
            breaking_changes,
            migration_required,
            estimated_effort,
            compared_at,
        })
    }

    /// Group a raw change list by table and analyze each group
    pub fn analyze_changes(changes: &[SchemaChange]) -> Vec<TableChange> {
        let mut by_table: BTreeMap<&str, Vec<&SchemaChange>> = BTreeMap::new();
        for change in changes {
            by_table.entry(change.table_name.as_str()).or_default().push(change);
        }

        by_table
            .into_iter()
            .map(|(table, group)| Self::analyze_table(table, &group))
            .collect()
    }

    fn analyze_table(table: &str, changes: &[&SchemaChange]) -> TableChange {
        let mut column_changes = Vec::new();
        let mut index_changes = Vec::new();
        let mut constraint_changes = Vec::new();
        let mut relationship_changes = Vec::new();

        for change in changes {
            if let Some(column) = Self::analyze_column_change(change) {
                column_changes.push(column);
                continue;
            }
            let Some(name) = change.change_details.object_name() else {
                continue;
            };
            let object = ObjectChange {
                name: name.to_string(),
                change_type: change.change_type(),
                impact_level: Self::classify_impact(change),
                backward_compatible: Self::is_backward_compatible(change),
            };
            match change.change_type() {
                ChangeType::IndexAdded | ChangeType::IndexRemoved => index_changes.push(object),
                ChangeType::ConstraintAdded | ChangeType::ConstraintRemoved => {
                    constraint_changes.push(object)
                }
                ChangeType::ForeignKeyAdded | ChangeType::ForeignKeyRemoved => {
                    relationship_changes.push(object)
                }
                _ => {}
            }
        }

        let kinds: Vec<ChangeType> = changes.iter().map(|c| c.change_type()).collect();
        let change_type = if kinds.contains(&ChangeType::TableRemoved) {
            TableChangeKind::TableRemoval
        } else if kinds.contains(&ChangeType::TableAdded) {
            TableChangeKind::TableCreation
        } else if kinds.contains(&ChangeType::TableRenamed) {
            TableChangeKind::TableRename
        } else {
            TableChangeKind::SchemaModification
        };

        let overall_impact = changes
            .iter()
            .map(|c| Self::classify_impact(c))
            .max()
            .unwrap_or(ImpactLevel::Minimal);

        let owned: Vec<SchemaChange> = changes.iter().map(|c| (*c).clone()).collect();

        TableChange {
            table_name: table.to_string(),
            change_type,
            column_changes,
            index_changes,
            constraint_changes,
            relationship_changes,
            overall_impact,
            migration_strategy: Self::determine_migration_strategy(&owned),
        }
    }

    /// Default impact per change type, raised to at least HIGH when the
    /// change is explicitly flagged breaking
    pub fn classify_impact(change: &SchemaChange) -> ImpactLevel {
        let base = match change.change_type() {
            ChangeType::TableRemoved => ImpactLevel::Critical,
            ChangeType::ColumnRemoved | ChangeType::TableRenamed | ChangeType::ColumnRenamed => {
                ImpactLevel::High
            }
            ChangeType::ColumnModified
            | ChangeType::ForeignKeyRemoved
            | ChangeType::ConstraintAdded => ImpactLevel::Medium,
            ChangeType::TableAdded
            | ChangeType::ColumnAdded
            | ChangeType::ForeignKeyAdded
            | ChangeType::ConstraintRemoved => ImpactLevel::Low,
            ChangeType::IndexAdded | ChangeType::IndexRemoved => ImpactLevel::Minimal,
        };

        if change.change_details.breaking_change() {
            base.max(ImpactLevel::High)
        } else {
            base
        }
    }

    /// Table, column or foreign key removal, or an explicit breaking flag
    pub fn is_breaking(change: &SchemaChange) -> bool {
        matches!(
            change.change_type(),
            ChangeType::TableRemoved | ChangeType::ColumnRemoved | ChangeType::ForeignKeyRemoved
        ) || change.change_details.breaking_change()
    }

    /// Existing consumers keep working. Any removal is incompatible, even the
    /// non-breaking ones (indexes, constraints).
    pub fn is_backward_compatible(change: &SchemaChange) -> bool {
        !change.change_type().is_removal() && !Self::is_breaking(change)
    }

    /// Column-level view of a change; `None` for non-column changes
    pub fn analyze_column_change(change: &SchemaChange) -> Option<ColumnChange> {
        let (column_name, old_definition, new_definition, migration_required) =
            match &change.change_details {
                ChangeDetails::ColumnAdded {
                    column,
                    breaking_change,
                } => (column.name.clone(), None, Some(column.clone()), *breaking_change),
                ChangeDetails::ColumnRemoved { column, .. } => {
                    (column.name.clone(), Some(column.clone()), None, true)
                }
                ChangeDetails::ColumnModified {
                    column_name,
                    old,
                    new,
                    ..
                } => (column_name.clone(), Some(old.clone()), Some(new.clone()), true),
                ChangeDetails::ColumnRenamed {
                    new_name, column, ..
                } => (new_name.clone(), Some(column.clone()), Some(column.clone()), true),
                _ => return None,
            };

        Some(ColumnChange {
            column_name,
            change_type: change.change_type(),
            old_definition,
            new_definition,
            impact_level: Self::classify_impact(change),
            backward_compatible: Self::is_backward_compatible(change),
            migration_required,
            suggested_migration: Self::suggest_migration(change),
        })
    }

    /// Any breaking change ⇒ blue/green; any modify/remove ⇒ rolling; else direct
    pub fn determine_migration_strategy(changes: &[SchemaChange]) -> MigrationStrategy {
        if changes.iter().any(Self::is_breaking) {
            return MigrationStrategy::BlueGreenDeployment;
        }
        let data_affecting = changes.iter().any(|c| {
            c.change_type() == ChangeType::ColumnModified || c.change_type().is_removal()
        });
        if data_affecting {
            MigrationStrategy::RollingMigration
        } else {
            MigrationStrategy::DirectMigration
        }
    }

    /// Effort from the impact histogram and total change count
    pub fn estimate_effort(impact_summary: &BTreeMap<ImpactLevel, usize>, total: usize) -> Effort {
        let count = |level: ImpactLevel| impact_summary.get(&level).copied().unwrap_or(0);

        if count(ImpactLevel::Critical) > 0 || count(ImpactLevel::High) > 2 || total > 20 {
            Effort::High
        } else if count(ImpactLevel::Medium) > 5 || total > 10 {
            Effort::Medium
        } else {
            Effort::Low
        }
    }

    /// Human-readable migration hint for column changes
    pub fn suggest_migration(change: &SchemaChange) -> Option<String> {
        let table = &change.table_name;
        match &change.change_details {
            ChangeDetails::ColumnAdded {
                column,
                breaking_change: true,
            } => Some(format!(
                "Add {}.{} as nullable, backfill existing rows, then set NOT NULL",
                table, column.name
            )),
            ChangeDetails::ColumnRemoved {
                column,
                dependent_constraints,
            } => {
                if dependent_constraints.is_empty() {
                    Some(format!(
                        "Stop reading {}.{} in application code before dropping it",
                        table, column.name
                    ))
                } else {
                    Some(format!(
                        "Drop dependent objects ({}) and stop reading {}.{} before dropping it",
                        dependent_constraints.join(", "),
                        table,
                        column.name
                    ))
                }
            }
            ChangeDetails::ColumnModified {
                column_name,
                modifications,
                breaking_change,
                ..
            } => {
                let touches = |field: ColumnField| modifications.iter().any(|m| m.field == field);
                if touches(ColumnField::Nullable) && *breaking_change {
                    Some(format!(
                        "Backfill NULL values in {}.{} before adding NOT NULL",
                        table, column_name
                    ))
                } else if touches(ColumnField::DataType) && *breaking_change {
                    Some(format!(
                        "Add a new column for {}.{}, copy converted data, then swap",
                        table, column_name
                    ))
                } else if touches(ColumnField::DataType) {
                    Some(format!("ALTER COLUMN {}.{} TYPE in place", table, column_name))
                } else {
                    None
                }
            }
            ChangeDetails::ColumnRenamed { old_name, new_name, .. } => Some(format!(
                "Keep {}.{} readable (view or dual-write) until consumers move to {}",
                table, old_name, new_name
            )),
            _ => None,
        }
    }
}
