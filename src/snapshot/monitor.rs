//! Schema Monitor
//!
//! Keeps a continuously updated view of the current schema and emits change
//! events when it moves. One background task polls the inspector; each tick
//! runs detection, handler dispatch and history persistence strictly in that
//! order before the next sleep begins.

use crate::config::MonitorConfig;
use crate::error::AppResult;
use crate::introspection::SchemaInspector;
use crate::snapshot::change::SchemaChange;
use crate::snapshot::diff::{DiffEngine, DiffOptions};
use crate::snapshot::model::{SchemaSnapshot, TableStructure};
use crate::snapshot::store::SnapshotStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Invoked once per individual change
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_change(&self, change: &SchemaChange) -> AppResult<()>;
}

/// Invoked once per batch of changes from a tick
#[async_trait]
pub trait BatchChangeHandler: Send + Sync {
    async fn on_changes(&self, changes: &[SchemaChange]) -> AppResult<()>;
}

#[async_trait]
impl<F> ChangeHandler for F
where
    F: Fn(&SchemaChange) -> AppResult<()> + Send + Sync + 'static,
{
    async fn on_change(&self, change: &SchemaChange) -> AppResult<()> {
        self(change)
    }
}

#[async_trait]
impl<F> BatchChangeHandler for F
where
    F: Fn(&[SchemaChange]) -> AppResult<()> + Send + Sync + 'static,
{
    async fn on_changes(&self, changes: &[SchemaChange]) -> AppResult<()> {
        self(changes)
    }
}

/// Returned on registration; identifies a handler for [`SchemaMonitor::force_check_except`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy)]
enum Dispatch {
    All,
    Except(HandlerId),
    Skip,
}

struct PollingWorker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic snapshotting and diffing of the database schema
pub struct SchemaMonitor {
    inspector: Arc<dyn SchemaInspector>,
    store: SnapshotStore,
    config: MonitorConfig,
    current: RwLock<Option<Arc<SchemaSnapshot>>>,
    history: RwLock<VecDeque<SchemaChange>>,
    change_handlers: RwLock<Vec<(HandlerId, Arc<dyn ChangeHandler>)>>,
    batch_handlers: RwLock<Vec<(HandlerId, Arc<dyn BatchChangeHandler>)>>,
    next_handler_id: AtomicU64,
    worker: Mutex<Option<PollingWorker>>,
    /// One tick at a time, whether from the loop or a forced check
    tick_lock: Mutex<()>,
}

impl SchemaMonitor {
    /// Create a monitor and restore the persisted baseline and history
    pub async fn open(inspector: Arc<dyn SchemaInspector>, config: MonitorConfig) -> AppResult<Arc<Self>> {
        config.validate()?;
        let store = SnapshotStore::new(config.state_dir.clone());

        let current = match store.load_current().await {
            Ok(Some(snapshot)) => match snapshot.validate() {
                Ok(()) => {
                    info!(hash = %snapshot.schema_hash, "Restored schema baseline");
                    Some(Arc::new(snapshot))
                }
                Err(e) => {
                    warn!("Ignoring persisted snapshot: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Could not load persisted snapshot, starting without baseline: {}", e);
                None
            }
        };

        let mut history: VecDeque<SchemaChange> = match store.load_history().await {
            Ok(list) => list.into(),
            Err(e) => {
                warn!("Could not load change history, starting empty: {}", e);
                VecDeque::new()
            }
        };
        while history.len() > config.history_limit {
            history.pop_front();
        }

        Ok(Arc::new(Self {
            inspector,
            store,
            config,
            current: RwLock::new(current),
            history: RwLock::new(history),
            change_handlers: RwLock::new(Vec::new()),
            batch_handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(0),
            worker: Mutex::new(None),
            tick_lock: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            detect_renames: self.config.detect_renames,
        }
    }

    /// Query the inspector and build a snapshot. Does not touch monitor state.
    pub async fn take_snapshot(&self) -> AppResult<SchemaSnapshot> {
        let names = self.inspector.get_all_tables().await?;
        let mut tables = BTreeMap::new();
        for name in names {
            let info = self.inspector.analyze_table(&name).await?;
            tables.insert(name, TableStructure::from(info));
        }
        let snapshot = SchemaSnapshot::new(tables, Utc::now());
        debug!(
            hash = %snapshot.schema_hash,
            tables = snapshot.tables.len(),
            "Took schema snapshot"
        );
        Ok(snapshot)
    }

    /// The stored current snapshot, if a baseline exists
    pub async fn current_snapshot(&self) -> Option<Arc<SchemaSnapshot>> {
        self.current.read().await.clone()
    }

    /// Diff a fresh snapshot against the stored one. The first call only
    /// establishes the baseline and reports nothing.
    pub async fn check_for_changes(&self) -> AppResult<Vec<SchemaChange>> {
        let fresh = self.take_snapshot().await?;
        let baseline = self.current_snapshot().await;

        let changes = match &baseline {
            None => {
                info!(
                    hash = %fresh.schema_hash,
                    tables = fresh.tables.len(),
                    "Established schema baseline"
                );
                Vec::new()
            }
            Some(previous) => DiffEngine::diff(previous, &fresh, self.diff_options(), fresh.timestamp),
        };

        if baseline.is_none() || !changes.is_empty() {
            let fresh = Arc::new(fresh);
            {
                let mut current = self.current.write().await;
                *current = Some(fresh.clone());
            }
            if let Err(e) = self.store.save_current(&fresh).await {
                error!("Failed to persist schema snapshot: {}", e);
            }
        }

        Ok(changes)
    }

    /// One poll tick: detect, record, dispatch to handlers, persist history
    pub async fn force_check(&self) -> AppResult<Vec<SchemaChange>> {
        self.tick(Dispatch::All).await
    }

    /// A full tick that leaves out one handler, for a caller that is itself
    /// registered and consumes the returned changes directly
    pub async fn force_check_except(&self, skip: HandlerId) -> AppResult<Vec<SchemaChange>> {
        self.tick(Dispatch::Except(skip)).await
    }

    /// Like [`force_check`](Self::force_check) but without handler dispatch
    pub async fn check_and_record(&self) -> AppResult<Vec<SchemaChange>> {
        self.tick(Dispatch::Skip).await
    }

    async fn tick(&self, dispatch: Dispatch) -> AppResult<Vec<SchemaChange>> {
        let _tick = self.tick_lock.lock().await;

        let changes = self.check_for_changes().await?;
        if changes.is_empty() {
            return Ok(changes);
        }

        info!(changes = changes.len(), "Detected schema changes");
        self.record_history(&changes).await;

        match dispatch {
            Dispatch::All => self.dispatch(&changes, None).await,
            Dispatch::Except(id) => self.dispatch(&changes, Some(id)).await,
            Dispatch::Skip => {}
        }

        self.persist_history().await;
        Ok(changes)
    }

    async fn record_history(&self, changes: &[SchemaChange]) {
        let mut history = self.history.write().await;
        let known: HashSet<String> = history.iter().map(|c| c.change_id.clone()).collect();
        for change in changes {
            if !known.contains(&change.change_id) {
                history.push_back(change.clone());
            }
        }
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    async fn persist_history(&self) {
        let snapshot: Vec<SchemaChange> = {
            let history = self.history.read().await;
            history.iter().cloned().collect()
        };
        if let Err(e) = self.store.save_history(&snapshot).await {
            error!("Failed to persist change history: {}", e);
        }
    }

    /// Run every handler; failures and panics are logged, never propagated
    async fn dispatch(&self, changes: &[SchemaChange], skip: Option<HandlerId>) {
        let keep = |id: &HandlerId| Some(*id) != skip;
        let change_handlers: Vec<Arc<dyn ChangeHandler>> = self
            .change_handlers
            .read()
            .await
            .iter()
            .filter(|(id, _)| keep(id))
            .map(|(_, h)| h.clone())
            .collect();
        let batch_handlers: Vec<Arc<dyn BatchChangeHandler>> = self
            .batch_handlers
            .read()
            .await
            .iter()
            .filter(|(id, _)| keep(id))
            .map(|(_, h)| h.clone())
            .collect();

        for change in changes {
            for handler in &change_handlers {
                let handler = handler.clone();
                let change = change.clone();
                let outcome = tokio::spawn(async move { handler.on_change(&change).await }).await;
                log_handler_outcome("change", outcome);
            }
        }

        if batch_handlers.is_empty() {
            return;
        }
        let batch: Arc<Vec<SchemaChange>> = Arc::new(changes.to_vec());
        for handler in &batch_handlers {
            let handler = handler.clone();
            let batch = batch.clone();
            let outcome = tokio::spawn(async move { handler.on_changes(&batch).await }).await;
            log_handler_outcome("batch", outcome);
        }
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn add_change_handler(&self, handler: Arc<dyn ChangeHandler>) -> HandlerId {
        let id = self.next_handler_id();
        self.change_handlers.write().await.push((id, handler));
        id
    }

    pub async fn add_batch_change_handler(&self, handler: Arc<dyn BatchChangeHandler>) -> HandlerId {
        let id = self.next_handler_id();
        self.batch_handlers.write().await.push((id, handler));
        id
    }

    /// Most recent `limit` changes, oldest first
    pub async fn get_change_history(&self, limit: usize) -> Vec<SchemaChange> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the polling loop. No-op when already running.
    pub async fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let mut worker = self.worker.lock().await;
        if let Some(existing) = worker.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Schema monitoring already running");
                return;
            }
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::clone(self);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Schema monitoring started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if let Err(e) = monitor.tick(Dispatch::All).await {
                    error!("Schema check failed, retrying after {:?}: {}", interval, e);
                }
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Schema monitoring stopped");
        });

        *worker = Some(PollingWorker { stop_tx, handle });
    }

    /// Signal the loop to exit and wait (bounded) for it. No-op when not running.
    pub async fn stop_monitoring(&self) {
        let worker = self.worker.lock().await.take();
        let Some(worker) = worker else {
            return;
        };

        let _ = worker.stop_tx.send(true);
        let mut handle = worker.handle;
        match tokio::time::timeout(self.config.stop_timeout(), &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Schema monitoring task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Schema monitoring did not stop within {:?}, aborting",
                    self.config.stop_timeout()
                );
                handle.abort();
            }
        }
    }
}

fn log_handler_outcome(kind: &str, outcome: Result<AppResult<()>, tokio::task::JoinError>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Schema {} handler failed: {}", kind, e),
        Err(e) if e.is_panic() => error!("Schema {} handler panicked", kind),
        Err(e) => warn!("Schema {} handler did not complete: {}", kind, e),
    }
}

impl std::fmt::Debug for SchemaMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMonitor")
            .field("state_dir", &self.store.dir())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::introspection::{ColumnDef, InMemoryInspector, TableInfo};
    use crate::snapshot::change::ChangeType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

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
            .column(ColumnDef::new("total", "DECIMAL(10,2)"))
    }

    fn config(dir: &std::path::Path) -> MonitorConfig {
        MonitorConfig {
            check_interval_secs: 1,
            state_dir: dir.to_path_buf(),
            ..MonitorConfig::default()
        }
    }

    async fn monitor_with(
        dir: &std::path::Path,
        tables: Vec<TableInfo>,
    ) -> (Arc<InMemoryInspector>, Arc<SchemaMonitor>) {
        let inspector = Arc::new(InMemoryInspector::with_tables(tables));
        let monitor = SchemaMonitor::open(inspector.clone(), config(dir)).await.unwrap();
        (inspector, monitor)
    }

    #[tokio::test]
    async fn test_first_check_establishes_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let (_inspector, monitor) = monitor_with(dir.path(), vec![users(), products()]).await;

        assert!(monitor.check_for_changes().await.unwrap().is_empty());
        assert!(monitor.current_snapshot().await.is_some());
        assert!(monitor.check_for_changes().await.unwrap().is_empty());
        assert!(dir.path().join("current_snapshot.json").exists());
    }

    #[tokio::test]
    async fn test_consecutive_snapshots_hash_equal() {
        let dir = tempfile::tempdir().unwrap();
        let (_inspector, monitor) = monitor_with(dir.path(), vec![users()]).await;

        let a = monitor.take_snapshot().await.unwrap();
        let b = monitor.take_snapshot().await.unwrap();
        assert_eq!(a.schema_hash, b.schema_hash);
        assert!(monitor.current_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_force_check_reports_added_table() {
        let dir = tempfile::tempdir().unwrap();
        let (inspector, monitor) = monitor_with(dir.path(), vec![users(), products()]).await;
        assert_ok!(monitor.force_check().await);

        inspector.put_table(orders()).await;
        let changes = monitor.force_check().await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type(), ChangeType::TableAdded);
        assert_eq!(changes[0].table_name, "orders");
        assert_eq!(changes[0].priority.ordinal(), 3);

        let history = monitor.get_change_history(10).await;
        assert_eq!(history.len(), 1);
        assert!(dir.path().join("change_history.json").exists());
    }

    #[tokio::test]
    async fn test_handlers_receive_changes_and_errors_are_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let (inspector, monitor) = monitor_with(dir.path(), vec![users()]).await;

        let per_change = Arc::new(AtomicUsize::new(0));
        let batches = Arc::new(AtomicUsize::new(0));

        let counter = per_change.clone();
        monitor
            .add_change_handler(Arc::new(move |_: &SchemaChange| -> AppResult<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        monitor
            .add_change_handler(Arc::new(|_: &SchemaChange| -> AppResult<()> {
                Err(AppError::Internal("handler blew up".to_string()))
            }))
            .await;
        monitor
            .add_batch_change_handler(Arc::new(|_: &[SchemaChange]| -> AppResult<()> {
                panic!("panicking batch handler")
            }))
            .await;
        let counter = batches.clone();
        monitor
            .add_batch_change_handler(Arc::new(move |changes: &[SchemaChange]| -> AppResult<()> {
                assert_eq!(changes.len(), 2);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;

        monitor.force_check().await.unwrap();
        inspector.put_table(products()).await;
        inspector.put_table(orders()).await;

        let changes = monitor.force_check().await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(per_change.load(Ordering::SeqCst), 2);
        assert_eq!(batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_and_record_skips_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let (inspector, monitor) = monitor_with(dir.path(), vec![users()]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor
            .add_batch_change_handler(Arc::new(move |_: &[SchemaChange]| -> AppResult<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;

        monitor.check_and_record().await.unwrap();
        inspector.drop_table("users").await;
        let changes = monitor.check_and_record().await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.get_change_history(5).await.len(), 1);
    }

    #[tokio::test]
    async fn test_force_check_except_skips_only_that_handler() {
        let dir = tempfile::tempdir().unwrap();
        let (inspector, monitor) = monitor_with(dir.path(), vec![users()]).await;

        let skipped = Arc::new(AtomicUsize::new(0));
        let others = Arc::new(AtomicUsize::new(0));

        let counter = skipped.clone();
        let own = monitor
            .add_batch_change_handler(Arc::new(move |_: &[SchemaChange]| -> AppResult<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        let counter = others.clone();
        monitor
            .add_batch_change_handler(Arc::new(move |_: &[SchemaChange]| -> AppResult<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        let counter = others.clone();
        let per_change = monitor
            .add_change_handler(Arc::new(move |_: &SchemaChange| -> AppResult<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        assert_ne!(own, per_change);

        monitor.force_check_except(own).await.unwrap();
        inspector.put_table(orders()).await;
        let changes = monitor.force_check_except(own).await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        assert_eq!(others.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded_newest_retained() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = Arc::new(InMemoryInspector::with_tables(vec![users()]));
        let monitor = SchemaMonitor::open(
            inspector.clone(),
            MonitorConfig {
                history_limit: 2,
                ..config(dir.path())
            },
        )
        .await
        .unwrap();

        monitor.force_check().await.unwrap();
        for name in ["a", "b", "c"] {
            inspector
                .put_table(TableInfo::new(name).column(ColumnDef::new("id", "INTEGER")))
                .await;
            monitor.force_check().await.unwrap();
        }

        let history = monitor.get_change_history(10).await;
        let tables: Vec<&str> = history.iter().map(|c| c.table_name.as_str()).collect();
        assert_eq!(tables, vec!["b", "c"]);
        assert_eq!(monitor.get_change_history(1).await[0].table_name, "c");
    }

    #[tokio::test]
    async fn test_baseline_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (inspector, monitor) = monitor_with(dir.path(), vec![users()]).await;
        monitor.force_check().await.unwrap();
        drop(monitor);

        inspector.drop_column("users", "phone").await.unwrap();
        let reopened = SchemaMonitor::open(inspector.clone(), config(dir.path()))
            .await
            .unwrap();
        let changes = reopened.force_check().await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type(), ChangeType::ColumnRemoved);
    }

    #[tokio::test]
    async fn test_inspector_failure_does_not_stop_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (inspector, monitor) = monitor_with(dir.path(), vec![users()]).await;
        inspector.set_unavailable(true);

        monitor.start_monitoring(Duration::from_millis(20)).await;
        monitor.start_monitoring(Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(monitor.is_running().await);

        inspector.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(monitor.current_snapshot().await.is_some());

        monitor.stop_monitoring().await;
        assert!(!monitor.is_running().await);
        monitor.stop_monitoring().await;
    }
}
