//! Process-wide progress registry.
//!
//! Every engine operation registers under its operation key (always a
//! container name) before doing any work. Two rules hold:
//!
//! 1. Single writer per key: [`ProgressRegistry::begin`] hands out an
//!    exclusive [`ProgressLease`]; a second `begin` for an active key fails
//!    with `already_running`.
//! 2. Cancellation is cooperative: [`ProgressRegistry::cancel`] latches the
//!    flag and trips the entry's `CancellationToken`; the engine observes it
//!    at stage boundaries and inside suspension points.
//!
//! Terminal records (completed/failed/error/cancelled) linger for a short
//! grace window so pollers can read the final state, then are evicted.

use crate::error::{ErrorKind, PilotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long terminal records stay readable before eviction.
pub const TERMINAL_LINGER: Duration = Duration::from_secs(3);

/// Operation stage, shared by deployments and migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    BackingUp,
    Building,
    Exporting,
    Stopping,
    Creating,
    Importing,
    MigratingData,
    Validating,
    Switching,
    CleaningUp,
    Completed,
    Failed,
    Error,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Completed | Stage::Failed | Stage::Error | Stage::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Starting => "starting",
            Stage::BackingUp => "backing_up",
            Stage::Building => "building",
            Stage::Exporting => "exporting",
            Stage::Stopping => "stopping",
            Stage::Creating => "creating",
            Stage::Importing => "importing",
            Stage::MigratingData => "migrating_data",
            Stage::Validating => "validating",
            Stage::Switching => "switching",
            Stage::CleaningUp => "cleaning_up",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one operation's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub stage: Stage,
    /// 0..=100, monotonically non-decreasing until a terminal stage.
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub cancel_requested: bool,
    /// Error kind for failed/error terminals, so callers can render a final
    /// status without reading logs.
    pub error_kind: Option<ErrorKind>,
}

impl ProgressRecord {
    fn new(message: impl Into<String>) -> Self {
        Self {
            stage: Stage::Starting,
            progress: 0,
            message: message.into(),
            timestamp: Utc::now(),
            cancel_requested: false,
            error_kind: None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    record: Mutex<ProgressRecord>,
    tx: watch::Sender<ProgressRecord>,
    cancel: CancellationToken,
    cancel_requested: AtomicBool,
    active: AtomicBool,
}

impl Entry {
    fn new(record: ProgressRecord) -> Self {
        let (tx, _rx) = watch::channel(record.clone());
        Self {
            record: Mutex::new(record),
            tx,
            cancel: CancellationToken::new(),
            cancel_requested: AtomicBool::new(false),
            active: AtomicBool::new(true),
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut ProgressRecord)) {
        let mut record = self.record.lock().expect("progress record poisoned");
        f(&mut record);
        record.timestamp = Utc::now();
        record.cancel_requested = self.cancel_requested.load(Ordering::SeqCst);
        // send_replace publishes even while nobody subscribes, so a late
        // subscriber still observes the latest state.
        let _ = self.tx.send_replace(record.clone());
    }

    fn snapshot(&self) -> ProgressRecord {
        self.record.lock().expect("progress record poisoned").clone()
    }
}

/// Process-wide mapping from operation key to progress entry.
#[derive(Default, Debug)]
pub struct ProgressRegistry {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl ProgressRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the exclusive lease for `key`.
    ///
    /// Fails with `already_running` while another lease for the key is
    /// active. A lingering terminal record is replaced.
    pub fn begin(self: &Arc<Self>, key: &str, message: impl Into<String>) -> Result<ProgressLease> {
        let mut entries = self.entries.lock().expect("progress registry poisoned");
        if let Some(existing) = entries.get(key) {
            if existing.active.load(Ordering::SeqCst) {
                return Err(PilotError::already_running(key));
            }
        }
        let entry = Arc::new(Entry::new(ProgressRecord::new(message)));
        entries.insert(key.to_string(), Arc::clone(&entry));
        debug!(key, "progress lease acquired");
        Ok(ProgressLease {
            key: key.to_string(),
            entry,
            registry: Arc::clone(self),
            terminated: false,
        })
    }

    /// Latch a cancel request. Returns false if the key is unknown.
    pub fn cancel(&self, key: &str) -> bool {
        let entries = self.entries.lock().expect("progress registry poisoned");
        match entries.get(key) {
            Some(entry) => {
                entry.cancel_requested.store(true, Ordering::SeqCst);
                entry.cancel.cancel();
                entry.mutate(|_| {});
                debug!(key, "cancel requested");
                true
            }
            None => false,
        }
    }

    /// Current record for a key, if present.
    pub fn get(&self, key: &str) -> Option<ProgressRecord> {
        let entries = self.entries.lock().expect("progress registry poisoned");
        entries.get(key).map(|e| e.snapshot())
    }

    /// All non-terminal records.
    pub fn active(&self) -> Vec<(String, ProgressRecord)> {
        let entries = self.entries.lock().expect("progress registry poisoned");
        entries
            .iter()
            .filter_map(|(key, entry)| {
                let record = entry.snapshot();
                (!record.stage.is_terminal()).then(|| (key.clone(), record))
            })
            .collect()
    }

    /// Push channel for a key. The receiver yields every update.
    pub fn subscribe(&self, key: &str) -> Option<watch::Receiver<ProgressRecord>> {
        let entries = self.entries.lock().expect("progress registry poisoned");
        entries.get(key).map(|e| e.tx.subscribe())
    }

    fn evict_later(self: Arc<Self>, key: String, entry: Arc<Entry>) {
        tokio::spawn(async move {
            tokio::time::sleep(TERMINAL_LINGER).await;
            let mut entries = self.entries.lock().expect("progress registry poisoned");
            // Only evict our own generation; a newer operation may have
            // replaced the entry during the linger window.
            if let Some(current) = entries.get(&key) {
                if Arc::ptr_eq(current, &entry) {
                    entries.remove(&key);
                    debug!(key, "terminal progress record evicted");
                }
            }
        });
    }
}

/// Exclusive writer handle for one operation key.
///
/// Held for the lifetime of the operation; dropping it without reaching a
/// terminal stage records an internal error so the key never leaks.
#[derive(Debug)]
pub struct ProgressLease {
    key: String,
    entry: Arc<Entry>,
    registry: Arc<ProgressRegistry>,
    terminated: bool,
}

impl ProgressLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Non-terminal stage update. Progress is clamped so the published value
    /// never decreases.
    pub fn update(&self, stage: Stage, progress: u8, message: impl Into<String>) {
        let message = message.into();
        debug!(key = %self.key, %stage, progress, "{message}");
        self.entry.mutate(|record| {
            record.stage = stage;
            record.progress = record.progress.max(progress.min(100));
            record.message = message;
        });
    }

    /// True once a cancel has been requested for this key.
    pub fn cancel_requested(&self) -> bool {
        self.entry.cancel_requested.load(Ordering::SeqCst)
    }

    /// Token tripped by [`ProgressRegistry::cancel`]; suspension points
    /// select against it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.entry.cancel.clone()
    }

    pub fn complete(mut self, message: impl Into<String>) {
        self.terminate(Stage::Completed, Some(100), None, message.into());
    }

    pub fn fail(mut self, kind: ErrorKind, message: impl Into<String>) {
        self.terminate(Stage::Failed, None, Some(kind), message.into());
    }

    pub fn error(mut self, kind: ErrorKind, message: impl Into<String>) {
        self.terminate(Stage::Error, None, Some(kind), message.into());
    }

    pub fn cancelled(mut self, message: impl Into<String>) {
        self.terminate(Stage::Cancelled, None, None, message.into());
    }

    fn terminate(
        &mut self,
        stage: Stage,
        progress: Option<u8>,
        kind: Option<ErrorKind>,
        message: String,
    ) {
        debug!(key = %self.key, %stage, "{message}");
        self.entry.mutate(|record| {
            record.stage = stage;
            if let Some(progress) = progress {
                record.progress = record.progress.max(progress);
            }
            record.error_kind = kind;
            record.message = message;
        });
        self.entry.active.store(false, Ordering::SeqCst);
        self.terminated = true;
        Arc::clone(&self.registry).evict_later(self.key.clone(), Arc::clone(&self.entry));
    }
}

impl Drop for ProgressLease {
    fn drop(&mut self) {
        if !self.terminated {
            self.terminate(
                Stage::Error,
                None,
                Some(ErrorKind::InvariantViolation),
                "operation aborted without a terminal state".to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_begin_for_active_key_fails() {
        let registry = ProgressRegistry::new();
        let _lease = registry.begin("grafana", "starting").unwrap();
        let err = registry.begin("grafana", "again").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    }

    #[tokio::test]
    async fn different_keys_run_in_parallel() {
        let registry = ProgressRegistry::new();
        let _a = registry.begin("a", "x").unwrap();
        let _b = registry.begin("b", "y").unwrap();
        assert_eq!(registry.active().len(), 2);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let registry = ProgressRegistry::new();
        let lease = registry.begin("app", "starting").unwrap();
        lease.update(Stage::Building, 20, "building");
        lease.update(Stage::Creating, 70, "creating");
        // A stale lower value must not move the published progress backwards.
        lease.update(Stage::Creating, 10, "late update");
        assert_eq!(registry.get("app").unwrap().progress, 70);
    }

    #[tokio::test]
    async fn cancel_latches_and_trips_token() {
        let registry = ProgressRegistry::new();
        let lease = registry.begin("app", "starting").unwrap();
        assert!(!lease.cancel_requested());
        assert!(registry.cancel("app"));
        assert!(lease.cancel_requested());
        assert!(lease.cancellation_token().is_cancelled());
        assert!(registry.get("app").unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn cancel_unknown_key_returns_false() {
        let registry = ProgressRegistry::new();
        assert!(!registry.cancel("ghost"));
    }

    #[tokio::test]
    async fn terminal_record_lingers_then_evicts() {
        tokio::time::pause();
        let registry = ProgressRegistry::new();
        let lease = registry.begin("app", "starting").unwrap();
        lease.complete("done");
        let record = registry.get("app").unwrap();
        assert_eq!(record.stage, Stage::Completed);
        assert_eq!(record.progress, 100);

        tokio::time::advance(TERMINAL_LINGER + Duration::from_millis(100)).await;
        // Let the eviction task run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(registry.get("app").is_none());
    }

    #[tokio::test]
    async fn key_is_reusable_after_terminal() {
        let registry = ProgressRegistry::new();
        let lease = registry.begin("app", "one").unwrap();
        lease.fail(ErrorKind::ProbeFailed, "probe never came up");
        // The terminal record lingers but the key is claimable again.
        let lease = registry.begin("app", "two").unwrap();
        lease.complete("ok");
    }

    #[tokio::test]
    async fn dropped_lease_records_internal_error() {
        let registry = ProgressRegistry::new();
        {
            let _lease = registry.begin("app", "starting").unwrap();
        }
        let record = registry.get("app").unwrap();
        assert_eq!(record.stage, Stage::Error);
        assert_eq!(record.error_kind, Some(ErrorKind::InvariantViolation));
    }

    #[tokio::test]
    async fn subscribe_sees_updates() {
        let registry = ProgressRegistry::new();
        let lease = registry.begin("app", "starting").unwrap();
        let mut rx = registry.subscribe("app").unwrap();
        lease.update(Stage::Validating, 95, "probing");
        rx.changed().await.unwrap();
        let seen = rx.borrow().clone();
        assert_eq!(seen.stage, Stage::Validating);
        assert_eq!(seen.progress, 95);
    }

    #[tokio::test]
    async fn failed_terminal_carries_kind() {
        let registry = ProgressRegistry::new();
        let lease = registry.begin("app", "starting").unwrap();
        lease.update(Stage::Building, 20, "building");
        lease.fail(ErrorKind::Timeout, "build exceeded 20 minutes");
        let record = registry.get("app").unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(record.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(record.progress, 20);
    }
}
