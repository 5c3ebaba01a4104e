//! Schema Diff Engine
//!
//! The core comparison engine that detects changes between schema snapshots.
//! Tables, columns, indexes, constraints and foreign keys are each compared by
//! name: set difference for additions/removals, field comparison for the
//! names present on both sides.

use crate::detector::compat::is_column_modification_breaking;
use crate::introspection::ColumnDef;
use crate::snapshot::change::{ChangeDetails, ColumnField, FieldModification, SchemaChange};
use crate::snapshot::model::{SchemaSnapshot, TableStructure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Knobs for the diff
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOptions {
    /// Collapse structurally identical remove/add pairs into renames
    pub detect_renames: bool,
}

/// The diff engine that compares schema snapshots
pub struct DiffEngine;

impl DiffEngine {
    /// Compare two schema snapshots and return all differences, stamped with `timestamp`
    pub fn diff(
        from: &SchemaSnapshot,
        to: &SchemaSnapshot,
        options: DiffOptions,
        timestamp: DateTime<Utc>,
    ) -> Vec<SchemaChange> {
        if from.same_structure(to) {
            return Vec::new();
        }

        let mut changes = Vec::new();
        Self::diff_tables(&from.tables, &to.tables, options, timestamp, &mut changes);
        changes
    }

    fn diff_tables(
        from_tables: &BTreeMap<String, TableStructure>,
        to_tables: &BTreeMap<String, TableStructure>,
        options: DiffOptions,
        ts: DateTime<Utc>,
        changes: &mut Vec<SchemaChange>,
    ) {
        let from_keys: BTreeSet<&String> = from_tables.keys().collect();
        let to_keys: BTreeSet<&String> = to_tables.keys().collect();

        let mut removed: Vec<&String> = from_keys.difference(&to_keys).copied().collect();
        let mut added: Vec<&String> = to_keys.difference(&from_keys).copied().collect();

        if options.detect_renames {
            let mut renamed = Vec::new();
            for old_name in &removed {
                let old_table = &from_tables[*old_name];
                let candidate = added
                    .iter()
                    .position(|new_name| &to_tables[*new_name] == old_table);
                if let Some(pos) = candidate {
                    let new_name = added.remove(pos);
                    renamed.push(*old_name);
                    changes.push(SchemaChange::new(
                        new_name.clone(),
                        ChangeDetails::TableRenamed {
                            old_name: (*old_name).clone(),
                            new_name: new_name.clone(),
                            table: old_table.clone(),
                        },
                        ts,
                    ));
                }
            }
            removed.retain(|name| !renamed.contains(name));
        }

        for name in added {
            changes.push(SchemaChange::new(
                name.clone(),
                ChangeDetails::TableAdded {
                    table: to_tables[name].clone(),
                },
                ts,
            ));
        }

        for name in removed {
            changes.push(SchemaChange::new(
                name.clone(),
                ChangeDetails::TableRemoved {
                    table: from_tables[name].clone(),
                },
                ts,
            ));
        }

        for name in from_keys.intersection(&to_keys) {
            let from_table = &from_tables[*name];
            let to_table = &to_tables[*name];
            if from_table == to_table {
                continue;
            }
            Self::diff_columns(name, from_table, to_table, options, ts, changes);
            Self::diff_indexes(name, from_table, to_table, ts, changes);
            Self::diff_constraints(name, from_table, to_table, ts, changes);
            Self::diff_foreign_keys(name, from_table, to_table, ts, changes);
        }
    }

    fn diff_columns(
        table: &str,
        from: &TableStructure,
        to: &TableStructure,
        options: DiffOptions,
        ts: DateTime<Utc>,
        changes: &mut Vec<SchemaChange>,
    ) {
        let from_keys: BTreeSet<&String> = from.columns.keys().collect();
        let to_keys: BTreeSet<&String> = to.columns.keys().collect();

        let mut removed: Vec<&String> = from_keys.difference(&to_keys).copied().collect();
        let mut added: Vec<&String> = to_keys.difference(&from_keys).copied().collect();

        if options.detect_renames {
            let mut renamed = Vec::new();
            for old_name in &removed {
                let old_col = &from.columns[*old_name];
                let candidate = added
                    .iter()
                    .position(|new_name| same_definition(old_col, &to.columns[*new_name]));
                if let Some(pos) = candidate {
                    let new_name = added.remove(pos);
                    renamed.push(*old_name);
                    changes.push(SchemaChange::new(
                        table,
                        ChangeDetails::ColumnRenamed {
                            old_name: (*old_name).clone(),
                            new_name: new_name.clone(),
                            column: to.columns[new_name].clone(),
                        },
                        ts,
                    ));
                }
            }
            removed.retain(|name| !renamed.contains(name));
        }

        for name in added {
            let column = to.columns[name].clone();
            let breaking_change = column.requires_backfill();
            changes.push(SchemaChange::new(
                table,
                ChangeDetails::ColumnAdded {
                    column,
                    breaking_change,
                },
                ts,
            ));
        }

        for name in removed {
            changes.push(SchemaChange::new(
                table,
                ChangeDetails::ColumnRemoved {
                    column: from.columns[name].clone(),
                    dependent_constraints: from.dependents_of(name),
                },
                ts,
            ));
        }

        for name in from_keys.intersection(&to_keys) {
            let old = &from.columns[*name];
            let new = &to.columns[*name];
            let modifications = Self::compare_columns(old, new);
            if modifications.is_empty() {
                continue;
            }
            changes.push(SchemaChange::new(
                table,
                ChangeDetails::ColumnModified {
                    column_name: (*name).clone(),
                    old: old.clone(),
                    new: new.clone(),
                    modifications,
                    breaking_change: is_column_modification_breaking(old, new),
                },
                ts,
            ));
        }
    }

    /// Field-level diff over type, nullability, default, primary key and autoincrement
    fn compare_columns(from: &ColumnDef, to: &ColumnDef) -> Vec<FieldModification> {
        let mut modifications = Vec::new();

        if from.data_type != to.data_type {
            modifications.push(FieldModification {
                field: ColumnField::DataType,
                old: Some(from.data_type.clone()),
                new: Some(to.data_type.clone()),
            });
        }
        if from.nullable != to.nullable {
            modifications.push(FieldModification {
                field: ColumnField::Nullable,
                old: Some(from.nullable.to_string()),
                new: Some(to.nullable.to_string()),
            });
        }
        if from.default_value != to.default_value {
            modifications.push(FieldModification {
                field: ColumnField::DefaultValue,
                old: from.default_value.clone(),
                new: to.default_value.clone(),
            });
        }
        if from.is_primary_key != to.is_primary_key {
            modifications.push(FieldModification {
                field: ColumnField::PrimaryKey,
                old: Some(from.is_primary_key.to_string()),
                new: Some(to.is_primary_key.to_string()),
            });
        }
        if from.autoincrement != to.autoincrement {
            modifications.push(FieldModification {
                field: ColumnField::Autoincrement,
                old: Some(from.autoincrement.to_string()),
                new: Some(to.autoincrement.to_string()),
            });
        }

        modifications
    }

    fn diff_indexes(
        table: &str,
        from: &TableStructure,
        to: &TableStructure,
        ts: DateTime<Utc>,
        changes: &mut Vec<SchemaChange>,
    ) {
        // A redefined index is reported as dropped and recreated
        for (name, index) in &from.indexes {
            if to.indexes.get(name) != Some(index) {
                changes.push(SchemaChange::new(
                    table,
                    ChangeDetails::IndexRemoved { index: index.clone() },
                    ts,
                ));
            }
        }
        for (name, index) in &to.indexes {
            if from.indexes.get(name) != Some(index) {
                changes.push(SchemaChange::new(
                    table,
                    ChangeDetails::IndexAdded { index: index.clone() },
                    ts,
                ));
            }
        }
    }

    fn diff_constraints(
        table: &str,
        from: &TableStructure,
        to: &TableStructure,
        ts: DateTime<Utc>,
        changes: &mut Vec<SchemaChange>,
    ) {
        for (name, constraint) in &from.constraints {
            if to.constraints.get(name) != Some(constraint) {
                changes.push(SchemaChange::new(
                    table,
                    ChangeDetails::ConstraintRemoved {
                        constraint: constraint.clone(),
                    },
                    ts,
                ));
            }
        }
        for (name, constraint) in &to.constraints {
            if from.constraints.get(name) != Some(constraint) {
                changes.push(SchemaChange::new(
                    table,
                    ChangeDetails::ConstraintAdded {
                        constraint: constraint.clone(),
                    },
                    ts,
                ));
            }
        }
    }

    fn diff_foreign_keys(
        table: &str,
        from: &TableStructure,
        to: &TableStructure,
        ts: DateTime<Utc>,
        changes: &mut Vec<SchemaChange>,
    ) {
        for (name, fk) in &from.foreign_keys {
            if to.foreign_keys.get(name) != Some(fk) {
                changes.push(SchemaChange::new(
                    table,
                    ChangeDetails::ForeignKeyRemoved {
                        foreign_key: fk.clone(),
                    },
                    ts,
                ));
            }
        }
        for (name, fk) in &to.foreign_keys {
            if from.foreign_keys.get(name) != Some(fk) {
                changes.push(SchemaChange::new(
                    table,
                    ChangeDetails::ForeignKeyAdded {
                        foreign_key: fk.clone(),
                    },
                    ts,
                ));
            }
        }
    }
}

/// Column definitions equal in everything except the name
fn same_definition(a: &ColumnDef, b: &ColumnDef) -> bool {
    a.data_type == b.data_type
        && a.nullable == b.nullable
        && a.default_value == b.default_value
        && a.is_primary_key == b.is_primary_key
        && a.autoincrement == b.autoincrement
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{ConstraintDef, ConstraintKind, ForeignKeyDef, IndexDef, TableInfo};
    use crate::snapshot::change::ChangeType;
    use pretty_assertions::assert_eq;

    fn users() -> TableInfo {
        TableInfo::new("users")
            .column(ColumnDef::new("id", "INTEGER").primary_key().autoincrement())
            .column(ColumnDef::new("email", "VARCHAR(255)").not_null())
            .column(ColumnDef::new("phone", "VARCHAR(32)"))
    }

    fn products() -> TableInfo {
        TableInfo::new("products")
            .column(ColumnDef::new("id", "INTEGER").primary_key().autoincrement())
            .column(ColumnDef::new("name", "TEXT").not_null())
    }

    fn orders() -> TableInfo {
        TableInfo::new("orders")
            .column(ColumnDef::new("id", "INTEGER").primary_key().autoincrement())
            .column(ColumnDef::new("user_id", "INTEGER").not_null())
            .foreign_key(ForeignKeyDef {
                constraint_name: "orders_user_fk".to_string(),
                columns: vec!["user_id".to_string()],
                referenced_table: "users".to_string(),
                referenced_columns: vec!["id".to_string()],
                on_update: "NO ACTION".to_string(),
                on_delete: "CASCADE".to_string(),
            })
    }

    fn snapshot(tables: Vec<TableInfo>) -> SchemaSnapshot {
        SchemaSnapshot::from_tables(tables, Utc::now())
    }

    fn diff(a: &SchemaSnapshot, b: &SchemaSnapshot) -> Vec<SchemaChange> {
        DiffEngine::diff(a, b, DiffOptions::default(), Utc::now())
    }

    fn types(changes: &[SchemaChange]) -> Vec<(ChangeType, String)> {
        changes
            .iter()
            .map(|c| (c.change_type(), c.table_name.clone()))
            .collect()
    }

    #[test]
    fn test_identical_snapshots_short_circuit() {
        let a = snapshot(vec![users(), products()]);
        let b = snapshot(vec![products(), users()]);
        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn test_table_added() {
        let a = snapshot(vec![users(), products()]);
        let b = snapshot(vec![users(), products(), orders()]);

        let changes = diff(&a, &b);
        assert_eq!(types(&changes), vec![(ChangeType::TableAdded, "orders".to_string())]);
        assert_eq!(changes[0].priority.ordinal(), 3);
    }

    #[test]
    fn test_diff_symmetry() {
        let a = snapshot(vec![users()]);
        let b = snapshot(vec![users(), products(), orders()]);

        let added: BTreeSet<String> = diff(&a, &b)
            .into_iter()
            .filter(|c| c.change_type() == ChangeType::TableAdded)
            .map(|c| c.table_name)
            .collect();
        let removed: BTreeSet<String> = diff(&b, &a)
            .into_iter()
            .filter(|c| c.change_type() == ChangeType::TableRemoved)
            .map(|c| c.table_name)
            .collect();

        assert_eq!(added, removed);
        assert_eq!(added.len(), 2);
    }

    #[test]
    fn test_column_removed_lists_dependents() {
        let with_index = users().index(IndexDef {
            name: "idx_users_phone".to_string(),
            columns: vec!["phone".to_string()],
            is_unique: false,
            is_primary: false,
        });
        let mut without_phone = users();
        without_phone.columns.retain(|c| c.name != "phone");

        let changes = diff(&snapshot(vec![with_index]), &snapshot(vec![without_phone]));

        let removal = changes
            .iter()
            .find(|c| c.change_type() == ChangeType::ColumnRemoved)
            .expect("column removal");
        assert_eq!(removal.table_name, "users");
        assert_eq!(removal.priority.ordinal(), 3);
        match &removal.change_details {
            ChangeDetails::ColumnRemoved {
                column,
                dependent_constraints,
            } => {
                assert_eq!(column.name, "phone");
                assert_eq!(dependent_constraints, &vec!["idx_users_phone".to_string()]);
            }
            other => panic!("unexpected details: {:?}", other),
        }
        assert!(changes.iter().any(|c| c.change_type() == ChangeType::IndexRemoved));
    }

    #[test]
    fn test_required_column_without_default_is_breaking() {
        let b = users().column(ColumnDef::new("tenant_id", "INTEGER").not_null());
        let changes = diff(&snapshot(vec![users()]), &snapshot(vec![b]));

        assert_eq!(changes.len(), 1);
        assert!(changes[0].change_details.breaking_change());
    }

    #[test]
    fn test_column_modified_field_diff() {
        let mut altered = users();
        for column in altered.columns.iter_mut() {
            if column.name == "phone" {
                column.data_type = "INTEGER".to_string();
                column.default_value = Some("0".to_string());
            }
        }

        let changes = diff(&snapshot(vec![users()]), &snapshot(vec![altered]));
        assert_eq!(changes.len(), 1);
        match &changes[0].change_details {
            ChangeDetails::ColumnModified {
                modifications,
                breaking_change,
                ..
            } => {
                let fields: Vec<ColumnField> = modifications.iter().map(|m| m.field).collect();
                assert_eq!(fields, vec![ColumnField::DataType, ColumnField::DefaultValue]);
                assert!(*breaking_change);
            }
            other => panic!("unexpected details: {:?}", other),
        }
    }

    #[test]
    fn test_redefined_foreign_key_is_remove_then_add() {
        let mut b = orders();
        b.foreign_keys[0].on_delete = "RESTRICT".to_string();

        let changes = diff(
            &snapshot(vec![users(), orders()]),
            &snapshot(vec![users(), b]),
        );
        assert_eq!(
            types(&changes),
            vec![
                (ChangeType::ForeignKeyRemoved, "orders".to_string()),
                (ChangeType::ForeignKeyAdded, "orders".to_string()),
            ]
        );
    }

    #[test]
    fn test_constraint_swap_is_removed_then_added() {
        let a = users().constraint(ConstraintDef {
            name: "uq_users_email".to_string(),
            kind: ConstraintKind::Unique,
            columns: vec!["email".to_string()],
            expression: None,
        });
        let b = users().constraint(ConstraintDef {
            name: "ck_users_phone".to_string(),
            kind: ConstraintKind::Check,
            columns: vec!["phone".to_string()],
            expression: Some("CHECK ((length(phone) > 6))".to_string()),
        });

        let changes = diff(&snapshot(vec![a]), &snapshot(vec![b]));
        assert_eq!(
            types(&changes),
            vec![
                (ChangeType::ConstraintRemoved, "users".to_string()),
                (ChangeType::ConstraintAdded, "users".to_string()),
            ]
        );
        assert_eq!(changes[0].change_details.object_name(), Some("uq_users_email"));
        assert_eq!(changes[1].change_details.object_name(), Some("ck_users_phone"));
    }

    #[test]
    fn test_rename_detection_is_opt_in() {
        let mut renamed = products();
        renamed.name = "catalog_items".to_string();

        let a = snapshot(vec![users(), products()]);
        let b = snapshot(vec![users(), renamed]);

        let plain = diff(&a, &b);
        assert_eq!(plain.len(), 2);

        let with_renames = DiffEngine::diff(
            &a,
            &b,
            DiffOptions {
                detect_renames: true,
            },
            Utc::now(),
        );
        assert_eq!(
            types(&with_renames),
            vec![(ChangeType::TableRenamed, "catalog_items".to_string())]
        );
    }

    #[test]
    fn test_column_rename_detection() {
        let mut b = users();
        for column in b.columns.iter_mut() {
            if column.name == "phone" {
                column.name = "mobile".to_string();
            }
        }
        let changes = DiffEngine::diff(
            &snapshot(vec![users()]),
            &snapshot(vec![b]),
            DiffOptions {
                detect_renames: true,
            },
            Utc::now(),
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type(), ChangeType::ColumnRenamed);
    }
}
