//! Evolution task model
//!
//! A task is one batch of schema changes driven through a fixed phase
//! ordering. Phase and status only move forward; the helpers here enforce it.

use crate::evolution::testing::TestResults;
use crate::snapshot::change::{ChangeType, SchemaChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Pipeline phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionPhase {
    Detection,
    Analysis,
    Generation,
    Testing,
    Validation,
    Deployment,
}

impl EvolutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionPhase::Detection => "detection",
            EvolutionPhase::Analysis => "analysis",
            EvolutionPhase::Generation => "generation",
            EvolutionPhase::Testing => "testing",
            EvolutionPhase::Validation => "validation",
            EvolutionPhase::Deployment => "deployment",
        }
    }
}

impl fmt::Display for EvolutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionStatus {
    Idle,
    Processing,
    Testing,
    Completed,
    Failed,
    Rollback,
}

impl EvolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionStatus::Idle => "idle",
            EvolutionStatus::Processing => "processing",
            EvolutionStatus::Testing => "testing",
            EvolutionStatus::Completed => "completed",
            EvolutionStatus::Failed => "failed",
            EvolutionStatus::Rollback => "rollback",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvolutionStatus::Completed | EvolutionStatus::Failed | EvolutionStatus::Rollback
        )
    }

    /// Running, i.e. past approval and not yet terminal
    pub fn is_running(&self) -> bool {
        matches!(self, EvolutionStatus::Processing | EvolutionStatus::Testing)
    }
}

impl fmt::Display for EvolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseResult {
    Completed,
    Failed(String),
}

/// Reporting-only bucketing of a task's changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAnalysis {
    pub structural: usize,
    pub data: usize,
    pub constraint: usize,
    pub index: usize,
    pub tables: BTreeSet<String>,
}

impl ChangeAnalysis {
    pub fn from_changes(changes: &[SchemaChange]) -> Self {
        let mut analysis = Self::default();
        for change in changes {
            analysis.tables.insert(change.table_name.clone());
            match change.change_type() {
                ChangeType::TableAdded
                | ChangeType::TableRemoved
                | ChangeType::TableRenamed
                | ChangeType::ColumnAdded
                | ChangeType::ColumnRemoved
                | ChangeType::ColumnRenamed => analysis.structural += 1,
                ChangeType::ColumnModified => analysis.data += 1,
                ChangeType::ConstraintAdded
                | ChangeType::ConstraintRemoved
                | ChangeType::ForeignKeyAdded
                | ChangeType::ForeignKeyRemoved => analysis.constraint += 1,
                ChangeType::IndexAdded | ChangeType::IndexRemoved => analysis.index += 1,
            }
        }
        analysis
    }
}

/// Unit of work driven through the phase pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionTask {
    pub task_id: String,
    pub changes: Vec<SchemaChange>,
    pub phase: EvolutionPhase,
    pub status: EvolutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub generated_files: Vec<PathBuf>,
    pub test_results: Option<TestResults>,
    pub analysis: Option<ChangeAnalysis>,
}

impl EvolutionTask {
    pub fn new(changes: Vec<SchemaChange>) -> Self {
        let created_at = Utc::now();
        Self {
            task_id: Self::generate_id(created_at),
            changes,
            phase: EvolutionPhase::Detection,
            status: EvolutionStatus::Idle,
            created_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            generated_files: Vec::new(),
            test_results: None,
            analysis: None,
        }
    }

    /// `evo_<yyyymmddHHMMSS>_<8 hex>`
    fn generate_id(at: DateTime<Utc>) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!("evo_{}_{}", at.format("%Y%m%d%H%M%S"), &random[..8])
    }

    /// Distinct table names touched by this task, in first-seen order
    pub fn tables(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.changes
            .iter()
            .filter(|c| seen.insert(c.table_name.clone()))
            .map(|c| c.table_name.clone())
            .collect()
    }

    /// Advance to `phase`; refuses to move backwards
    pub fn advance_to(&mut self, phase: EvolutionPhase) -> bool {
        if phase < self.phase {
            return false;
        }
        self.phase = phase;
        true
    }

    pub fn mark_started(&mut self) {
        self.status = EvolutionStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = EvolutionStatus::Failed;
        self.error_message = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// No-op once the task is terminal; a failed task never becomes completed
    pub fn mark_completed(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = EvolutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }
}
