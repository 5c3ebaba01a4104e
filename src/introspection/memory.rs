//! In-memory schema inspector
//!
//! Holds a mutable table map so hosts without a live database (and tests) can
//! drive the monitor. Mutations are visible on the next snapshot.

use super::{ColumnDef, SchemaInspector, TableInfo};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Inspector backed by an in-process table map
#[derive(Default)]
pub struct InMemoryInspector {
    tables: RwLock<BTreeMap<String, TableInfo>>,
    /// When set, every call fails as if the database were unreachable
    unavailable: AtomicBool,
}

impl InMemoryInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: impl IntoIterator<Item = TableInfo>) -> Self {
        let map = tables.into_iter().map(|t| (t.name.clone(), t)).collect();
        Self {
            tables: RwLock::new(map),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Create or replace a table
    pub async fn put_table(&self, table: TableInfo) {
        let mut tables = self.tables.write().await;
        tables.insert(table.name.clone(), table);
    }

    pub async fn drop_table(&self, name: &str) -> Option<TableInfo> {
        let mut tables = self.tables.write().await;
        tables.remove(name)
    }

    pub async fn add_column(&self, table: &str, column: ColumnDef) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| AppError::NotFound(format!("Table {} not found", table)))?;
        entry.columns.push(column);
        Ok(())
    }

    pub async fn drop_column(&self, table: &str, column: &str) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| AppError::NotFound(format!("Table {} not found", table)))?;
        entry.columns.retain(|c| c.name != column);
        Ok(())
    }

    /// Simulate the database going away (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Inspector("database unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaInspector for InMemoryInspector {
    async fn get_all_tables(&self) -> AppResult<Vec<String>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.keys().cloned().collect())
    }

    async fn analyze_table(&self, name: &str) -> AppResult<TableInfo> {
        self.check_available()?;
        let tables = self.tables.read().await;
        tables
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Inspector(format!("Table {} disappeared during inspection", name)))
    }
}
