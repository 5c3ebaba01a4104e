//! Test phase collaborators

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

static PASSED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) passed").expect("valid regex"));
static FAILED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) failed").expect("valid regex"));
static SKIPPED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) (?:skipped|ignored)").expect("valid regex"));
static COVERAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^TOTAL\s.*?(\d+(?:\.\d+)?)%\s*$").expect("valid regex"));

/// Summary of one test run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Line coverage percent, when the runner reports it
    pub coverage: Option<f64>,
    pub duration_ms: u64,
}

impl TestResults {
    /// Parse pytest/cargo style summary lines. Counts from repeated summary
    /// lines (one per test binary) are summed.
    pub fn parse_summary(output: &str) -> Option<Self> {
        let sum = |re: &Regex| -> Option<u32> {
            let mut found = false;
            let mut total = 0u32;
            for caps in re.captures_iter(output) {
                if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
                    found = true;
                    total = total.saturating_add(n);
                }
            }
            found.then_some(total)
        };

        let passed = sum(&PASSED_RE);
        let failed = sum(&FAILED_RE);
        if passed.is_none() && failed.is_none() {
            return None;
        }
        let passed = passed.unwrap_or(0);
        let failed = failed.unwrap_or(0);
        let skipped = sum(&SKIPPED_RE).unwrap_or(0);
        let coverage = COVERAGE_RE
            .captures_iter(output)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());

        Some(Self {
            total: passed + failed + skipped,
            passed,
            failed,
            skipped,
            coverage,
            duration_ms: 0,
        })
    }
}

/// Runs the test suite covering a task's generated files
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, generated_files: &[PathBuf]) -> AppResult<TestResults>;
}

/// Runs an external command and parses its summary output
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandTestRunner {
    /// Build from a program-plus-arguments list
    pub fn from_command(command: &[String]) -> AppResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AppError::Config("test command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run_tests(&self, generated_files: &[PathBuf]) -> AppResult<TestResults> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(
            program = %self.program,
            files = generated_files.len(),
            "Running test command"
        );

        let started = Instant::now();
        let output = cmd.output().await.map_err(|e| {
            AppError::Internal(format!("Failed to run test command '{}': {}", self.program, e))
        })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut results = match TestResults::parse_summary(&text) {
            Some(results) => results,
            None if output.status.success() => TestResults::default(),
            // No summary and a failing exit: count the run itself as one failure
            None => TestResults {
                total: 1,
                failed: 1,
                ..TestResults::default()
            },
        };
        if !output.status.success() && results.failed == 0 {
            results.failed = 1;
            results.total = results.total.max(results.passed + 1);
        }
        results.duration_ms = duration_ms;
        Ok(results)
    }
}
