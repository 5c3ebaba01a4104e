//! Evolution Engine
//!
//! Binds schema monitoring to code regeneration. Detected change batches
//! become [`EvolutionTask`]s which are driven through
//! analysis → generation → testing → validation → deployment by a bounded set
//! of workers, with rollback of generated files on failure.

use crate::config::{EvolutionConfig, NotificationConfig};
use crate::detector::ChangeDetector;
use crate::error::{not_found_error, AppError, AppResult};
use crate::evolution::notify::{NotificationSink, WebhookNotifier};
use crate::evolution::producers::{CodeProducer, ManifestProducer, ProducerKind};
use crate::evolution::state::{EngineState, EngineStats, TASK_HISTORY_LIMIT};
use crate::evolution::task::{
    ChangeAnalysis, EvolutionPhase, EvolutionStatus, EvolutionTask, PhaseResult,
};
use crate::evolution::testing::{CommandTestRunner, TestRunner};
use crate::evolution::validation::{SourceValidator, SyntaxValidator};
use crate::snapshot::change::{Priority, SchemaChange};
use crate::snapshot::monitor::{BatchChangeHandler, HandlerId, SchemaMonitor};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CANCELLED_MESSAGE: &str = "Task cancelled by user";

// =============================================================================
// BUILDER
// =============================================================================

/// Assembles an [`EvolutionEngine`] around a monitor and its collaborators
pub struct EvolutionEngineBuilder {
    monitor: Arc<SchemaMonitor>,
    config: EvolutionConfig,
    notifications: NotificationConfig,
    producers: Vec<Arc<dyn CodeProducer>>,
    test_runner: Option<Arc<dyn TestRunner>>,
    validator: Option<Arc<dyn SourceValidator>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl EvolutionEngineBuilder {
    pub fn notifications(mut self, notifications: NotificationConfig) -> Self {
        self.notifications = notifications;
        self
    }

    /// Add a producer. When none are added, a [`ManifestProducer`] is used
    /// for every enabled kind.
    pub fn producer(mut self, producer: Arc<dyn CodeProducer>) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn test_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.test_runner = Some(runner);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn SourceValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the configuration, wire defaults, restore persisted stats and
    /// subscribe to the monitor's batch callback
    pub async fn build(self) -> AppResult<EvolutionEngine> {
        self.config.validate()?;
        self.notifications.validate()?;

        let enabled = |kind: ProducerKind| match kind {
            ProducerKind::Model => self.config.generate_models,
            ProducerKind::View => self.config.generate_views,
            ProducerKind::Api => self.config.generate_apis,
            ProducerKind::Test => self.config.generate_tests,
        };

        let producers: Vec<Arc<dyn CodeProducer>> = if self.producers.is_empty() {
            [ProducerKind::Model, ProducerKind::View, ProducerKind::Api, ProducerKind::Test]
                .into_iter()
                .filter(|kind| enabled(*kind))
                .map(|kind| Arc::new(ManifestProducer::new(kind)) as Arc<dyn CodeProducer>)
                .collect()
        } else {
            self.producers
                .iter()
                .filter(|p| enabled(p.kind()))
                .cloned()
                .collect()
        };

        let test_runner: Option<Arc<dyn TestRunner>> = match (self.test_runner, &self.config.test_command) {
            (Some(runner), _) => Some(runner),
            (None, Some(command)) => Some(Arc::new(CommandTestRunner::from_command(command)?)),
            (None, None) => None,
        };
        if self.config.run_tests && test_runner.is_none() {
            return Err(AppError::Config(
                "tests are enabled but no test runner or TEST_COMMAND is configured".to_string(),
            ));
        }

        let notifier: Arc<dyn NotificationSink> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(WebhookNotifier::new(self.notifications.webhook_url.clone())?),
        };
        let validator: Arc<dyn SourceValidator> =
            self.validator.unwrap_or_else(|| Arc::new(SyntaxValidator));

        let state_dir = self.monitor.config().state_dir.clone();
        let (stats, history) = match EngineState::load(&state_dir).await {
            Ok(Some(state)) => {
                info!(
                    last_run = %state.last_run,
                    tasks = state.task_history.len(),
                    "Restored engine state"
                );
                (state.stats, state.task_history.into())
            }
            Ok(None) => (EngineStats::default(), VecDeque::new()),
            Err(e) => {
                warn!("Could not load engine state, starting fresh: {}", e);
                (EngineStats::default(), VecDeque::new())
            }
        };

        let inner = Arc::new(EngineInner {
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_evolutions)),
            monitor: self.monitor,
            config: self.config,
            notifications: self.notifications,
            producers,
            test_runner,
            validator,
            notifier,
            state_dir,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(history),
            stats: RwLock::new(stats),
            workers: Mutex::new(JoinSet::new()),
            running: AtomicBool::new(false),
            intake: OnceCell::new(),
        });

        let intake = inner
            .monitor
            .add_batch_change_handler(Arc::new(ChangeIntake {
                inner: Arc::downgrade(&inner),
            }))
            .await;
        let _ = inner.intake.set(intake);

        Ok(EvolutionEngine { inner })
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Orchestrates evolution tasks for one monitored database
#[derive(Clone)]
pub struct EvolutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    monitor: Arc<SchemaMonitor>,
    config: EvolutionConfig,
    notifications: NotificationConfig,
    producers: Vec<Arc<dyn CodeProducer>>,
    test_runner: Option<Arc<dyn TestRunner>>,
    validator: Arc<dyn SourceValidator>,
    notifier: Arc<dyn NotificationSink>,
    state_dir: PathBuf,
    semaphore: Arc<Semaphore>,
    active: RwLock<HashMap<String, EvolutionTask>>,
    history: RwLock<VecDeque<EvolutionTask>>,
    stats: RwLock<EngineStats>,
    workers: Mutex<JoinSet<()>>,
    running: AtomicBool,
    /// The monitor registration of this engine's [`ChangeIntake`]
    intake: OnceCell<HandlerId>,
}

/// Batch handler registered on the monitor; holds the engine weakly
struct ChangeIntake {
    inner: Weak<EngineInner>,
}

#[async_trait]
impl BatchChangeHandler for ChangeIntake {
    async fn on_changes(&self, changes: &[SchemaChange]) -> AppResult<()> {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_schema_changes(changes.to_vec()).await;
        }
        Ok(())
    }
}

impl EvolutionEngine {
    pub fn builder(monitor: Arc<SchemaMonitor>, config: EvolutionConfig) -> EvolutionEngineBuilder {
        EvolutionEngineBuilder {
            monitor,
            config,
            notifications: NotificationConfig::default(),
            producers: Vec::new(),
            test_runner: None,
            validator: None,
            notifier: None,
        }
    }

    pub fn monitor(&self) -> &Arc<SchemaMonitor> {
        &self.inner.monitor
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start monitoring. With auto-evolution on, one check runs immediately
    /// and any changes it finds are processed. No-op when already running.
    pub async fn start_engine(&self) -> AppResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Evolution engine already running");
            return Ok(());
        }

        if self.inner.config.auto_evolution {
            match self.inner.poll_monitor().await {
                Ok(changes) if !changes.is_empty() => {
                    self.inner.on_schema_changes(changes).await;
                }
                Ok(_) => {}
                Err(e) => warn!("Initial schema check failed: {}", e),
            }
        }

        let interval = self.inner.monitor.config().check_interval();
        self.inner.monitor.start_monitoring(interval).await;
        info!(
            auto_evolution = self.inner.config.auto_evolution,
            require_approval = self.inner.config.require_approval,
            max_concurrent = self.inner.config.max_concurrent_evolutions,
            "🚀 Evolution engine started"
        );
        Ok(())
    }

    /// Stop monitoring, wait for running tasks, persist engine state.
    /// No-op when not running.
    pub async fn stop_engine(&self) -> AppResult<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.monitor.stop_monitoring().await;
        self.inner.drain_workers().await;
        self.inner.save_state().await?;
        info!("🛑 Evolution engine stopped");
        Ok(())
    }

    /// Run an evolution right away, bypassing filtering and approval. Without
    /// explicit changes, a forced monitor check supplies them (other handlers
    /// still see them). `None` when there is nothing to do.
    pub async fn force_evolution(
        &self,
        changes: Option<Vec<SchemaChange>>,
    ) -> AppResult<Option<EvolutionTask>> {
        let changes = match changes {
            Some(changes) => changes,
            None => self.inner.poll_monitor().await?,
        };
        if changes.is_empty() {
            debug!("Forced evolution found nothing to do");
            return Ok(None);
        }

        let task = EvolutionTask::new(changes);
        Ok(Some(self.inner.start_new_task(task).await))
    }

    /// Filter a change batch and create a task for what remains
    pub async fn on_schema_changes(&self, changes: Vec<SchemaChange>) -> Option<EvolutionTask> {
        self.inner.on_schema_changes(changes).await
    }

    /// Promote an idle task awaiting approval and start it
    pub async fn approve_task(&self, task_id: &str) -> AppResult<EvolutionTask> {
        let task = {
            let mut active = self.inner.active.write().await;
            let task = active
                .get_mut(task_id)
                .ok_or_else(|| not_found_error(format!("Task {} not found", task_id)))?;
            if task.status != EvolutionStatus::Idle {
                return Err(AppError::InvalidState(format!(
                    "Task {} is {}, only idle tasks can be approved",
                    task_id, task.status
                )));
            }
            task.mark_started();
            task.clone()
        };

        info!(task_id = %task_id, "Task approved");
        self.inner.spawn_worker(task_id.to_string()).await;
        Ok(task)
    }

    /// Discard an idle task awaiting approval
    pub async fn reject_task(&self, task_id: &str) -> AppResult<EvolutionTask> {
        let task = {
            let mut active = self.inner.active.write().await;
            let mut task = active
                .remove(task_id)
                .ok_or_else(|| not_found_error(format!("Task {} not found", task_id)))?;
            if task.status != EvolutionStatus::Idle {
                let status = task.status;
                active.insert(task_id.to_string(), task);
                return Err(AppError::InvalidState(format!(
                    "Task {} is {}, only idle tasks can be rejected",
                    task_id, status
                )));
            }
            task.mark_failed("Rejected during approval");
            task
        };

        self.inner.stats.write().await.tasks_rejected += 1;
        self.inner.record_history(task.clone()).await;
        info!(task_id = %task_id, "Task rejected");
        Ok(task)
    }

    /// Cancel a running task. Takes effect before its next phase starts.
    /// Returns false for unknown or non-running tasks.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        {
            let mut active = self.inner.active.write().await;
            let Some(task) = active.get_mut(task_id) else {
                return false;
            };
            if !task.status.is_running() {
                return false;
            }
            task.mark_failed(CANCELLED_MESSAGE);
        }

        self.inner.stats.write().await.tasks_cancelled += 1;
        info!(task_id = %task_id, "Task cancelled");
        true
    }

    /// Tasks currently tracked (idle, queued or running), oldest first
    pub async fn get_active_tasks(&self) -> Vec<EvolutionTask> {
        let mut tasks: Vec<EvolutionTask> = self.inner.active.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Look a task up among active tasks, then in the terminal history
    pub async fn get_task_status(&self, task_id: &str) -> Option<EvolutionTask> {
        if let Some(task) = self.inner.active.read().await.get(task_id) {
            return Some(task.clone());
        }
        self.inner
            .history
            .read()
            .await
            .iter()
            .rev()
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    /// Most recent `limit` terminal tasks, oldest first
    pub async fn get_task_history(&self, limit: usize) -> Vec<EvolutionTask> {
        let history = self.inner.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn get_stats(&self) -> EngineStats {
        self.inner.stats.read().await.clone()
    }

    /// Wait until every spawned worker has finished
    pub async fn wait_for_idle(&self) {
        self.inner.drain_workers().await;
    }
}

impl EngineInner {
    /// One monitor tick that notifies every handler except our own intake
    async fn poll_monitor(&self) -> AppResult<Vec<SchemaChange>> {
        match self.intake.get() {
            Some(intake) => self.monitor.force_check_except(*intake).await,
            None => self.monitor.check_and_record().await,
        }
    }

    fn accepts(&self, change: &SchemaChange) -> bool {
        if !self.config.auto_evolution && change.priority == Priority::Low {
            return false;
        }
        if !self.config.generate_models && change.change_type().is_index() {
            return false;
        }
        true
    }

    async fn on_schema_changes(self: &Arc<Self>, changes: Vec<SchemaChange>) -> Option<EvolutionTask> {
        let received = changes.len();
        let accepted: Vec<SchemaChange> = changes.into_iter().filter(|c| self.accepts(c)).collect();
        if accepted.is_empty() {
            debug!(received, "No schema changes accepted for evolution");
            return None;
        }

        let task = EvolutionTask::new(accepted);
        if !self.config.require_approval {
            return Some(self.start_new_task(task).await);
        }

        info!(
            task_id = %task.task_id,
            changes = task.changes.len(),
            "Evolution task awaiting approval"
        );
        self.active.write().await.insert(task.task_id.clone(), task.clone());
        self.stats.write().await.tasks_created += 1;

        if self.notifications.on_approval {
            let message = format!(
                "Schema evolution requires approval: {} change(s) on {}",
                task.changes.len(),
                task.tables().join(", ")
            );
            self.send_notification(&message, &task).await;
        }
        Some(task)
    }

    async fn start_new_task(self: &Arc<Self>, mut task: EvolutionTask) -> EvolutionTask {
        task.mark_started();
        let task_id = task.task_id.clone();
        info!(task_id = %task_id, changes = task.changes.len(), "Starting evolution task");

        self.active.write().await.insert(task_id.clone(), task.clone());
        self.stats.write().await.tasks_created += 1;
        self.spawn_worker(task_id).await;
        task
    }

    async fn spawn_worker(self: &Arc<Self>, task_id: String) {
        let inner = Arc::clone(self);
        let mut workers = self.workers.lock().await;
        while workers.try_join_next().is_some() {}
        workers.spawn(async move { inner.run_task(task_id).await });
    }

    async fn drain_workers(&self) {
        loop {
            let mut workers = std::mem::take(&mut *self.workers.lock().await);
            if workers.is_empty() {
                break;
            }
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!("Evolution worker ended abnormally: {}", e);
                }
            }
        }
    }

    async fn run_task(self: Arc<Self>, task_id: String) {
        let outcome = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(_permit) => {
                let inner = Arc::clone(&self);
                let id = task_id.clone();
                match tokio::spawn(async move { inner.execute_phases(&id).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => PhaseResult::Failed("Evolution task panicked".to_string()),
                    Err(e) => PhaseResult::Failed(format!("Evolution task aborted: {}", e)),
                }
            }
            Err(e) => PhaseResult::Failed(format!("Worker pool closed: {}", e)),
        };
        self.finish_task(&task_id, outcome).await;
    }

    async fn execute_phases(&self, task_id: &str) -> PhaseResult {
        let mut phases = vec![EvolutionPhase::Analysis, EvolutionPhase::Generation];
        if self.config.run_tests {
            phases.push(EvolutionPhase::Testing);
        }
        phases.extend([EvolutionPhase::Validation, EvolutionPhase::Deployment]);

        for phase in phases {
            if let Err(reason) = self.enter_phase(task_id, phase).await {
                return PhaseResult::Failed(reason);
            }
            debug!(task_id = %task_id, phase = %phase, "Entering phase");

            let result = match phase {
                EvolutionPhase::Analysis => self.analysis_phase(task_id).await,
                EvolutionPhase::Generation => self.generation_phase(task_id).await,
                EvolutionPhase::Testing => self.testing_phase(task_id).await,
                EvolutionPhase::Validation => self.validation_phase(task_id).await,
                EvolutionPhase::Deployment => self.deployment_phase(task_id).await,
                EvolutionPhase::Detection => Ok(PhaseResult::Completed),
            };

            match result {
                Ok(PhaseResult::Completed) => {}
                Ok(PhaseResult::Failed(reason)) => return PhaseResult::Failed(reason),
                Err(e) => return PhaseResult::Failed(format!("{} phase error: {}", phase, e)),
            }
        }
        PhaseResult::Completed
    }

    /// Move the task forward; `Err` carries the reason when it was cancelled
    async fn enter_phase(&self, task_id: &str, phase: EvolutionPhase) -> Result<(), String> {
        let mut active = self.active.write().await;
        let task = active
            .get_mut(task_id)
            .ok_or_else(|| format!("Task {} disappeared", task_id))?;
        if task.status == EvolutionStatus::Failed {
            return Err(task
                .error_message
                .clone()
                .unwrap_or_else(|| CANCELLED_MESSAGE.to_string()));
        }
        task.advance_to(phase);
        if phase == EvolutionPhase::Testing {
            task.status = EvolutionStatus::Testing;
        }
        Ok(())
    }

    async fn task_snapshot(&self, task_id: &str) -> AppResult<EvolutionTask> {
        self.active
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| not_found_error(format!("Task {} not found", task_id)))
    }

    async fn update_task(&self, task_id: &str, update: impl FnOnce(&mut EvolutionTask)) {
        if let Some(task) = self.active.write().await.get_mut(task_id) {
            update(task);
        }
    }

    // -------------------------------------------------------------------------
    // Phases
    // -------------------------------------------------------------------------

    async fn analysis_phase(&self, task_id: &str) -> AppResult<PhaseResult> {
        let task = self.task_snapshot(task_id).await?;

        if let Some(snapshot) = self.monitor.current_snapshot().await {
            if let Err(e) = snapshot.validate() {
                return Ok(PhaseResult::Failed(format!("Cannot assess changes: {}", e)));
            }
        }

        let analysis = ChangeAnalysis::from_changes(&task.changes);
        let table_changes = ChangeDetector::analyze_changes(&task.changes);
        let highest = table_changes.iter().map(|t| t.overall_impact).max();
        info!(
            task_id = %task_id,
            structural = analysis.structural,
            data = analysis.data,
            constraint = analysis.constraint,
            index = analysis.index,
            impact = ?highest,
            "Analyzed changes"
        );

        self.update_task(task_id, |t| t.analysis = Some(analysis)).await;
        Ok(PhaseResult::Completed)
    }

    async fn generation_phase(&self, task_id: &str) -> AppResult<PhaseResult> {
        let task = self.task_snapshot(task_id).await?;
        let Some(snapshot) = self.monitor.current_snapshot().await else {
            warn!(task_id = %task_id, "No schema snapshot available, nothing to generate");
            return Ok(PhaseResult::Completed);
        };

        for table in task.tables() {
            let Some(structure) = snapshot.tables.get(&table) else {
                debug!(task_id = %task_id, table = %table, "Table no longer present, skipping generation");
                continue;
            };
            for producer in &self.producers {
                match producer.produce(&table, structure, &self.config.output_dir).await {
                    Ok(files) => {
                        debug!(
                            task_id = %task_id,
                            table = %table,
                            kind = %producer.kind(),
                            files = files.len(),
                            "Generated files"
                        );
                        self.update_task(task_id, |t| t.generated_files.extend(files)).await;
                    }
                    Err(e) => warn!(
                        task_id = %task_id,
                        table = %table,
                        kind = %producer.kind(),
                        "Code producer failed: {}",
                        e
                    ),
                }
            }
        }
        Ok(PhaseResult::Completed)
    }

    async fn testing_phase(&self, task_id: &str) -> AppResult<PhaseResult> {
        let Some(runner) = &self.test_runner else {
            return Ok(PhaseResult::Failed("No test runner configured".to_string()));
        };
        let files = self.task_snapshot(task_id).await?.generated_files;

        let timeout = self.config.test_timeout();
        let results = match tokio::time::timeout(timeout, runner.run_tests(&files)).await {
            Ok(results) => results?,
            Err(_) => {
                return Ok(PhaseResult::Failed(format!(
                    "Tests timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        info!(
            task_id = %task_id,
            passed = results.passed,
            failed = results.failed,
            coverage = ?results.coverage,
            "Test run finished"
        );
        self.update_task(task_id, |t| t.test_results = Some(results.clone())).await;

        if results.failed > 0 {
            return Ok(PhaseResult::Failed(format!(
                "{} out of {} tests failed",
                results.failed, results.total
            )));
        }
        let minimum = self.config.min_test_coverage;
        if minimum > 0.0 {
            match results.coverage {
                Some(coverage) if coverage < minimum => {
                    return Ok(PhaseResult::Failed(format!(
                        "Test coverage {:.1}% is below the required {:.1}%",
                        coverage, minimum
                    )))
                }
                Some(_) => {}
                None => {
                    return Ok(PhaseResult::Failed(format!(
                        "Test coverage was not reported, {:.1}% required",
                        minimum
                    )))
                }
            }
        }
        Ok(PhaseResult::Completed)
    }

    async fn validation_phase(&self, task_id: &str) -> AppResult<PhaseResult> {
        let files = self.task_snapshot(task_id).await?.generated_files;
        for path in &files {
            let contents = match tokio::fs::read_to_string(path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(PhaseResult::Failed(format!(
                        "Generated file missing: {}",
                        path.display()
                    )))
                }
                Err(e) => return Err(e.into()),
            };
            if let PhaseResult::Failed(reason) = self.validator.validate(path, &contents).await {
                return Ok(PhaseResult::Failed(reason));
            }
        }
        debug!(task_id = %task_id, files = files.len(), "Validated generated files");
        Ok(PhaseResult::Completed)
    }

    async fn deployment_phase(&self, task_id: &str) -> AppResult<PhaseResult> {
        // Files are written in place by the generation phase
        debug!(task_id = %task_id, "Deployment complete");
        Ok(PhaseResult::Completed)
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    async fn finish_task(&self, task_id: &str, outcome: PhaseResult) {
        let (outcome, files) = {
            let mut active = self.active.write().await;
            let Some(task) = active.get_mut(task_id) else {
                error!(task_id = %task_id, "Finished task is no longer tracked");
                return;
            };
            // A cancellation after the last phase check still wins
            let outcome = match outcome {
                PhaseResult::Completed if task.status == EvolutionStatus::Failed => {
                    let reason = task.error_message.clone();
                    PhaseResult::Failed(reason.unwrap_or_else(|| CANCELLED_MESSAGE.to_string()))
                }
                other => other,
            };
            match &outcome {
                PhaseResult::Completed => task.mark_completed(),
                PhaseResult::Failed(reason) => {
                    if task.status != EvolutionStatus::Failed {
                        task.mark_failed(reason.clone());
                    }
                }
            }
            (outcome, task.generated_files.clone())
        };

        let failed = matches!(outcome, PhaseResult::Failed(_));
        let rolled_back = failed && self.config.enable_rollback;
        if rolled_back {
            Self::rollback(task_id, &files).await;
        }

        let task = {
            let mut active = self.active.write().await;
            let Some(mut task) = active.remove(task_id) else {
                return;
            };
            if rolled_back {
                task.status = EvolutionStatus::Rollback;
            }
            let mut history = self.history.write().await;
            history.push_back(task.clone());
            while history.len() > TASK_HISTORY_LIMIT {
                history.pop_front();
            }
            task
        };

        {
            let mut stats = self.stats.write().await;
            stats.changes_processed += task.changes.len() as u64;
            if failed {
                stats.tasks_failed += 1;
                if rolled_back {
                    stats.tasks_rolled_back += 1;
                }
            } else {
                stats.tasks_completed += 1;
                stats.files_generated += task.generated_files.len() as u64;
            }
        }

        match &outcome {
            PhaseResult::Completed => {
                info!(
                    task_id = %task_id,
                    files = task.generated_files.len(),
                    "✅ Evolution task completed"
                );
                if self.notifications.on_success {
                    let message = format!(
                        "Schema evolution completed: {} change(s), {} file(s) generated",
                        task.changes.len(),
                        task.generated_files.len()
                    );
                    self.send_notification(&message, &task).await;
                }
            }
            PhaseResult::Failed(_) => {
                let reason = task.error_message.clone().unwrap_or_default();
                error!(
                    task_id = %task_id,
                    phase = %task.phase,
                    rolled_back,
                    "❌ Evolution task failed: {}",
                    reason
                );
                if self.notifications.on_failure {
                    let message = format!("Schema evolution failed: {}", reason);
                    self.send_notification(&message, &task).await;
                }
            }
        }
    }

    async fn rollback(task_id: &str, files: &[PathBuf]) {
        for path in files {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(task_id = %task_id, path = %path.display(), "Removed generated file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    task_id = %task_id,
                    path = %path.display(),
                    "Failed to remove generated file: {}",
                    e
                ),
            }
        }
        info!(task_id = %task_id, files = files.len(), "Rolled back generated files");
    }

    async fn record_history(&self, task: EvolutionTask) {
        let mut history = self.history.write().await;
        history.push_back(task);
        while history.len() > TASK_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    async fn send_notification(&self, message: &str, task: &EvolutionTask) {
        if let Err(e) = self.notifier.notify(message, task).await {
            warn!(task_id = %task.task_id, "Notification failed: {}", e);
        }
    }

    async fn save_state(&self) -> AppResult<()> {
        let state = EngineState {
            last_run: Utc::now(),
            config: self.config.clone(),
            stats: self.stats.read().await.clone(),
            task_history: self.history.read().await.iter().cloned().collect(),
        };
        state.save(&self.state_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::evolution::testing::TestResults;
    use crate::introspection::{ColumnDef, InMemoryInspector, IndexDef, TableInfo};
    use crate::snapshot::change::ChangeType;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    struct FixedRunner(TestResults);

    #[async_trait]
    impl TestRunner for FixedRunner {
        async fn run_tests(&self, _files: &[PathBuf]) -> AppResult<TestResults> {
            Ok(self.0.clone())
        }
    }

    /// Blocks until released, so a test can act while the task is mid-run
    struct GatedRunner {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TestRunner for GatedRunner {
        async fn run_tests(&self, _files: &[PathBuf]) -> AppResult<TestResults> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(TestResults {
                total: 1,
                passed: 1,
                ..TestResults::default()
            })
        }
    }

    /// Never finishes within a test's lifetime
    struct StalledRunner;

    #[async_trait]
    impl TestRunner for StalledRunner {
        async fn run_tests(&self, _files: &[PathBuf]) -> AppResult<TestResults> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(TestResults::default())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn notify(&self, message: &str, _task: &EvolutionTask) -> AppResult<()> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn counting_handler(calls: &Arc<AtomicUsize>) -> Arc<dyn crate::snapshot::ChangeHandler> {
        let calls = calls.clone();
        Arc::new(move |_: &SchemaChange| -> AppResult<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    /// Claims a file it never writes
    struct GhostProducer;

    #[async_trait]
    impl CodeProducer for GhostProducer {
        fn kind(&self) -> ProducerKind {
            ProducerKind::Model
        }

        async fn produce(
            &self,
            table: &str,
            _structure: &crate::snapshot::model::TableStructure,
            output_dir: &Path,
        ) -> AppResult<Vec<PathBuf>> {
            Ok(vec![output_dir.join(format!("{}.py", table))])
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        output: PathBuf,
        inspector: Arc<InMemoryInspector>,
        monitor: Arc<SchemaMonitor>,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let inspector = Arc::new(InMemoryInspector::with_tables(vec![
                TableInfo::new("users")
                    .column(ColumnDef::new("id", "INTEGER").primary_key().autoincrement())
                    .column(ColumnDef::new("email", "VARCHAR(255)").not_null()),
                TableInfo::new("products")
                    .column(ColumnDef::new("id", "INTEGER").primary_key().autoincrement()),
            ]));
            let monitor = SchemaMonitor::open(
                inspector.clone(),
                MonitorConfig {
                    check_interval_secs: 3600,
                    state_dir: dir.path().join("state"),
                    ..MonitorConfig::default()
                },
            )
            .await
            .unwrap();
            monitor.check_for_changes().await.unwrap();
            Self {
                output: dir.path().join("generated"),
                _dir: dir,
                inspector,
                monitor,
            }
        }

        fn config(&self) -> EvolutionConfig {
            EvolutionConfig {
                require_approval: false,
                run_tests: false,
                output_dir: self.output.clone(),
                ..EvolutionConfig::default()
            }
        }

        async fn add_orders(&self) {
            self.inspector
                .put_table(
                    TableInfo::new("orders")
                        .column(ColumnDef::new("id", "INTEGER").primary_key().autoincrement())
                        .column(ColumnDef::new("total", "DECIMAL(10,2)")),
                )
                .await;
        }
    }

    #[tokio::test]
    async fn test_successful_evolution_generates_and_completes() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(h.monitor.clone(), h.config())
            .build()
            .await
            .unwrap();

        h.add_orders().await;
        let task = engine.force_evolution(None).await.unwrap().unwrap();
        assert_eq!(task.status, EvolutionStatus::Processing);
        engine.wait_for_idle().await;

        let done = engine.get_task_status(&task.task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Completed);
        assert_eq!(done.phase, EvolutionPhase::Deployment);
        assert_eq!(done.generated_files.len(), 4);
        assert!(done.generated_files.iter().all(|f| f.exists()));
        assert!(done.analysis.is_some());
        assert!(engine.get_active_tasks().await.is_empty());

        let stats = engine.get_stats().await;
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.files_generated, 4);
    }

    #[tokio::test]
    async fn test_force_evolution_with_nothing_to_do() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(h.monitor.clone(), h.config())
            .build()
            .await
            .unwrap();
        assert!(engine.force_evolution(None).await.unwrap().is_none());
        assert!(engine.force_evolution(Some(vec![])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_approval_keeps_task_idle_until_approved() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                require_approval: true,
                ..h.config()
            },
        )
        .build()
        .await
        .unwrap();

        h.add_orders().await;
        h.monitor.force_check().await.unwrap();

        let pending = engine.get_active_tasks().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, EvolutionStatus::Idle);
        assert_eq!(pending[0].phase, EvolutionPhase::Detection);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let still = engine.get_task_status(&pending[0].task_id).await.unwrap();
        assert_eq!(still.status, EvolutionStatus::Idle);
        assert!(!h.output.exists());

        let approved = engine.approve_task(&pending[0].task_id).await.unwrap();
        assert_eq!(approved.status, EvolutionStatus::Processing);
        engine.wait_for_idle().await;

        let done = engine.get_task_status(&pending[0].task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Completed);
        assert_err!(engine.approve_task(&pending[0].task_id).await);
    }

    #[tokio::test]
    async fn test_reject_idle_task() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                require_approval: true,
                ..h.config()
            },
        )
        .build()
        .await
        .unwrap();

        h.add_orders().await;
        h.monitor.force_check().await.unwrap();
        let pending = engine.get_active_tasks().await;

        let rejected = engine.reject_task(&pending[0].task_id).await.unwrap();
        assert_eq!(rejected.status, EvolutionStatus::Failed);
        assert!(engine.get_active_tasks().await.is_empty());
        assert!(matches!(
            engine.reject_task("evo_missing").await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(engine.get_stats().await.tasks_rejected, 1);
    }

    #[tokio::test]
    async fn test_failing_tests_roll_back_generated_files() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                run_tests: true,
                ..h.config()
            },
        )
        .test_runner(Arc::new(FixedRunner(TestResults {
            total: 10,
            passed: 8,
            failed: 2,
            ..TestResults::default()
        })))
        .build()
        .await
        .unwrap();

        h.add_orders().await;
        let task = engine.force_evolution(None).await.unwrap().unwrap();
        engine.wait_for_idle().await;

        let done = engine.get_task_status(&task.task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Rollback);
        assert_eq!(done.phase, EvolutionPhase::Testing);
        assert!(done
            .error_message
            .as_deref()
            .unwrap()
            .contains("2 out of 10 tests failed"));
        assert!(!done.generated_files.is_empty());
        assert!(done.generated_files.iter().all(|f| !f.exists()));

        let stats = engine.get_stats().await;
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_rolled_back, 1);
    }

    #[tokio::test]
    async fn test_failure_without_rollback_keeps_files() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                run_tests: true,
                enable_rollback: false,
                min_test_coverage: 80.0,
                ..h.config()
            },
        )
        .test_runner(Arc::new(FixedRunner(TestResults {
            total: 3,
            passed: 3,
            coverage: Some(42.0),
            ..TestResults::default()
        })))
        .build()
        .await
        .unwrap();

        h.add_orders().await;
        let task = engine.force_evolution(None).await.unwrap().unwrap();
        engine.wait_for_idle().await;

        let done = engine.get_task_status(&task.task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Failed);
        assert!(done.error_message.unwrap().contains("below the required"));
        assert!(done.generated_files.iter().all(|f| f.exists()));
    }

    #[tokio::test]
    async fn test_missing_generated_file_fails_validation() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(h.monitor.clone(), h.config())
            .producer(Arc::new(GhostProducer))
            .build()
            .await
            .unwrap();

        h.add_orders().await;
        let task = engine.force_evolution(None).await.unwrap().unwrap();
        engine.wait_for_idle().await;

        let done = engine.get_task_status(&task.task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Rollback);
        assert_eq!(done.phase, EvolutionPhase::Validation);
        assert!(done.error_message.unwrap().contains("Generated file missing"));
    }

    #[tokio::test]
    async fn test_cancel_takes_effect_before_next_phase() {
        let h = Harness::new().await;
        let runner = Arc::new(GatedRunner {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                run_tests: true,
                ..h.config()
            },
        )
        .test_runner(runner.clone())
        .build()
        .await
        .unwrap();

        assert!(!engine.cancel_task("evo_unknown").await);

        h.add_orders().await;
        let task = engine.force_evolution(None).await.unwrap().unwrap();
        runner.entered.notified().await;

        assert!(engine.cancel_task(&task.task_id).await);
        assert!(!engine.cancel_task(&task.task_id).await);
        runner.release.notify_one();
        engine.wait_for_idle().await;

        let done = engine.get_task_status(&task.task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Rollback);
        assert_eq!(done.phase, EvolutionPhase::Testing);
        assert_eq!(done.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(done.generated_files.iter().all(|f| !f.exists()));
        assert_eq!(engine.get_stats().await.tasks_cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_after_last_phase_check_still_fails() {
        let h = Harness::new().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = EvolutionEngine::builder(h.monitor.clone(), h.config())
            .notifier(notifier.clone())
            .build()
            .await
            .unwrap();

        let mut task = EvolutionTask::new(vec![]);
        task.mark_started();
        task.advance_to(EvolutionPhase::Deployment);
        let task_id = task.task_id.clone();
        engine.inner.active.write().await.insert(task_id.clone(), task);

        assert!(matches!(
            engine.reject_task(&task_id).await,
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(engine.get_active_tasks().await.len(), 1);

        assert!(engine.cancel_task(&task_id).await);
        engine.inner.finish_task(&task_id, PhaseResult::Completed).await;

        let done = engine.get_task_status(&task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Rollback);
        assert_eq!(done.error_message.as_deref(), Some(CANCELLED_MESSAGE));

        let stats = engine.get_stats().await;
        assert_eq!(stats.tasks_cancelled, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_completed, 0);
        assert_eq!(
            notifier.messages(),
            vec![format!("Schema evolution failed: {}", CANCELLED_MESSAGE)]
        );
    }

    #[tokio::test]
    async fn test_testing_phase_times_out() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                run_tests: true,
                test_timeout_secs: 1,
                ..h.config()
            },
        )
        .test_runner(Arc::new(StalledRunner))
        .build()
        .await
        .unwrap();

        h.add_orders().await;
        let task = engine.force_evolution(None).await.unwrap().unwrap();
        engine.wait_for_idle().await;

        let done = engine.get_task_status(&task.task_id).await.unwrap();
        assert_eq!(done.status, EvolutionStatus::Rollback);
        assert_eq!(done.phase, EvolutionPhase::Testing);
        assert_eq!(done.error_message.as_deref(), Some("Tests timed out after 1s"));
        assert!(done.test_results.is_none());
        assert!(done.generated_files.iter().all(|f| !f.exists()));
    }

    #[tokio::test]
    async fn test_forced_evolution_reaches_other_handlers_once() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(h.monitor.clone(), h.config())
            .build()
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        h.monitor.add_change_handler(counting_handler(&calls)).await;

        h.add_orders().await;
        let task = engine.force_evolution(None).await.unwrap().unwrap();
        engine.wait_for_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.changes.len(), 1);
        assert_eq!(engine.get_stats().await.tasks_created, 1);
        assert_eq!(engine.get_task_history(10).await.len(), 1);
        assert!(h.monitor.force_check().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_intake_filters_low_priority_and_index_changes() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                generate_models: false,
                ..h.config()
            },
        )
        .build()
        .await
        .unwrap();

        let index_change = SchemaChange::new(
            "users",
            crate::snapshot::change::ChangeDetails::IndexAdded {
                index: IndexDef {
                    name: "idx_users_email".to_string(),
                    columns: vec!["email".to_string()],
                    is_unique: true,
                    is_primary: false,
                },
            },
            Utc::now(),
        );
        assert_eq!(index_change.change_type(), ChangeType::IndexAdded);
        assert!(engine.on_schema_changes(vec![index_change.clone()]).await.is_none());

        let permissive = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                auto_evolution: true,
                ..h.config()
            },
        )
        .build()
        .await
        .unwrap();
        let task = permissive.on_schema_changes(vec![index_change]).await.unwrap();
        assert_eq!(task.changes.len(), 1);
        permissive.wait_for_idle().await;
    }

    #[tokio::test]
    async fn test_tests_enabled_without_runner_is_config_error() {
        let h = Harness::new().await;
        let result = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                run_tests: true,
                test_command: None,
                ..h.config()
            },
        )
        .build()
        .await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent_and_persist_state() {
        let h = Harness::new().await;
        let engine = EvolutionEngine::builder(
            h.monitor.clone(),
            EvolutionConfig {
                auto_evolution: true,
                ..h.config()
            },
        )
        .build()
        .await
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        h.monitor.add_change_handler(counting_handler(&calls)).await;

        h.add_orders().await;
        assert_ok!(engine.start_engine().await);
        assert_ok!(engine.start_engine().await);
        assert!(engine.is_running());

        assert_ok!(engine.stop_engine().await);
        assert_ok!(engine.stop_engine().await);
        assert!(!engine.is_running());
        assert!(!h.monitor.is_running().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let history = engine.get_task_history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, EvolutionStatus::Completed);

        let state = EngineState::load(&h.monitor.config().state_dir)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.stats.tasks_completed, 1);
        assert_eq!(state.task_history.len(), 1);
    }
}
