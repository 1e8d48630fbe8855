//! Dead letter queue for operations that exhausted in-process recovery.
//!
//! Layout (one JSON file per entry, written atomically before the id is
//! returned to the caller):
//!
//! ```text
//! <dlq>/failed/<operation_id>.json         awaiting automatic retry
//! <dlq>/manual_review/<operation_id>.json  needs a human
//! <dlq>/resolved/<operation_id>.json       resolved by a human
//! ```
//!
//! Entries move from `failed/` to `manual_review/` once their retry budget is
//! spent. The new file is written before the old one is removed; on reopen a
//! duplicate in both directories is settled in favour of `manual_review/`.

pub mod entry;
pub mod replay;
pub mod worker;

pub use entry::{classify, Classification, FailedOperation, RetryStrategy, DLQ_SCHEMA_VERSION};
pub use replay::GraphReplayHandler;

use crate::config::DlqConfig;
use crate::error::{CoreError, ErrorKind, Result};
use crate::io;
use crate::paths;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Retry seam
// ---------------------------------------------------------------------------

/// Re-attempts a dead-lettered operation. Registered per `operation_type`.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, entry: &FailedOperation) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub failed_operations: usize,
    pub manual_review_queue: usize,
    pub background_processor_running: bool,
    pub paused: bool,
}

/// What one processing tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub escalated: usize,
}

#[derive(Debug, Default)]
struct Queues {
    failed: BTreeMap<String, FailedOperation>,
    manual: BTreeMap<String, FailedOperation>,
}

// ---------------------------------------------------------------------------
// DeadLetterQueue
// ---------------------------------------------------------------------------

pub struct DeadLetterQueue {
    dir: PathBuf,
    config: DlqConfig,
    queues: Mutex<Queues>,
    handlers: RwLock<HashMap<String, Arc<dyn RetryHandler>>>,
    /// Serializes ticks so an entry is never attempted twice concurrently.
    tick_lock: tokio::sync::Mutex<()>,
    paused: AtomicBool,
    worker: Mutex<Option<worker::WorkerHandle>>,
}

impl DeadLetterQueue {
    /// Open (or create) the queue rooted at `dir`, reloading persisted entries.
    pub fn open(dir: impl Into<PathBuf>, config: DlqConfig) -> Result<Self> {
        let dir = dir.into();
        let failed_dir = paths::dlq_failed_dir(&dir);
        let manual_dir = paths::dlq_manual_dir(&dir);
        io::ensure_dir(&failed_dir)?;
        io::ensure_dir(&manual_dir)?;
        io::ensure_dir(&paths::dlq_resolved_dir(&dir))?;

        let manual = load_dir(&manual_dir)?;
        let mut failed = load_dir(&failed_dir)?;
        for id in manual.keys() {
            if failed.remove(id).is_some() {
                warn!(operation_id = %id, "entry found in both queues; keeping manual review copy");
                io::remove_if_exists(&paths::dlq_entry_file(&failed_dir, id))?;
            }
        }
        if !failed.is_empty() || !manual.is_empty() {
            info!(
                failed = failed.len(),
                manual_review = manual.len(),
                "dead letter queue reloaded"
            );
        }

        Ok(Self {
            dir,
            config,
            queues: Mutex::new(Queues { failed, manual }),
            handlers: RwLock::new(HashMap::new()),
            tick_lock: tokio::sync::Mutex::new(()),
            paused: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn failed_dir(&self) -> PathBuf {
        paths::dlq_failed_dir(&self.dir)
    }

    fn manual_dir(&self) -> PathBuf {
        paths::dlq_manual_dir(&self.dir)
    }

    pub fn register_handler(&self, operation_type: impl Into<String>, handler: Arc<dyn RetryHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.insert(operation_type.into(), handler);
    }

    fn handler_for(&self, operation_type: &str) -> Option<Arc<dyn RetryHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(operation_type).cloned()
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// Capture a failed operation. The entry is on disk before this returns.
    ///
    /// `max_retries = None` uses the configured default. The retry strategy
    /// comes from `error.kind()`.
    pub fn add_failed_operation(
        &self,
        operation_type: impl Into<String>,
        payload: serde_json::Value,
        error: &CoreError,
        max_retries: Option<u32>,
    ) -> Result<String> {
        let kind = error.kind();
        let requested = max_retries.unwrap_or(self.config.default_max_retries);
        let class = classify(kind, requested, &self.config);
        let now = Utc::now();

        let entry = FailedOperation {
            schema_version: DLQ_SCHEMA_VERSION,
            operation_id: Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            payload,
            error_type: kind,
            error_message: error.to_string(),
            retry_count: 0,
            max_retries: class.max_retries,
            retry_strategy: class.strategy,
            manual_review: class.manual_review,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: entry::backoff(class.strategy, 0, &self.config)
                .filter(|_| !class.manual_review)
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d),
            resolved_at: None,
            resolution: None,
        };

        let dir = if entry.manual_review {
            self.manual_dir()
        } else {
            self.failed_dir()
        };
        io::write_json(&paths::dlq_entry_file(&dir, &entry.operation_id), &entry)?;

        let id = entry.operation_id.clone();
        if entry.manual_review {
            error!(
                operation_id = %id,
                operation_type = %entry.operation_type,
                error_type = %kind,
                "operation dead-lettered for manual review"
            );
            self.queues().manual.insert(id.clone(), entry);
        } else {
            warn!(
                operation_id = %id,
                operation_type = %entry.operation_type,
                error_type = %kind,
                strategy = %entry.retry_strategy,
                max_retries = entry.max_retries,
                "operation dead-lettered for retry"
            );
            self.queues().failed.insert(id.clone(), entry);
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn get_queue_status(&self) -> QueueStatus {
        let q = self.queues();
        QueueStatus {
            failed_operations: q.failed.len(),
            manual_review_queue: q.manual.len(),
            background_processor_running: self.processor_running(),
            paused: self.paused.load(Ordering::SeqCst),
        }
    }

    pub fn list_failed(&self) -> Vec<FailedOperation> {
        let mut out: Vec<_> = self.queues().failed.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn list_manual_review(&self) -> Vec<FailedOperation> {
        let mut out: Vec<_> = self.queues().manual.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn get(&self, operation_id: &str) -> Result<FailedOperation> {
        let q = self.queues();
        q.failed
            .get(operation_id)
            .or_else(|| q.manual.get(operation_id))
            .cloned()
            .ok_or_else(|| CoreError::DlqEntryNotFound(operation_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Manual resolution
    // -----------------------------------------------------------------------

    /// Mark a manual-review entry resolved. Returns `false` if it is not in
    /// the manual review queue.
    pub fn resolve_manual_operation(&self, operation_id: &str, note: impl Into<String>) -> Result<bool> {
        let Some(mut entry) = self.queues().manual.get(operation_id).cloned() else {
            return Ok(false);
        };
        entry.resolved_at = Some(Utc::now());
        entry.resolution = Some(note.into());

        let resolved_dir = paths::dlq_resolved_dir(&self.dir);
        io::write_json(&paths::dlq_entry_file(&resolved_dir, operation_id), &entry)?;
        io::remove_if_exists(&paths::dlq_entry_file(&self.manual_dir(), operation_id))?;
        if self.queues().manual.remove(operation_id).is_none() {
            // Resolved concurrently by another caller.
            return Ok(false);
        }

        info!(operation_id = %operation_id, "manual review entry resolved");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("dead letter processing paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("dead letter processing resumed");
    }

    /// Run one processing pass over every entry whose backoff has elapsed.
    ///
    /// Never returns an error: failed attempts and persistence problems are
    /// logged and the affected entries are retried on a later pass.
    pub async fn process_due(&self) -> TickReport {
        let _tick = self.tick_lock.lock().await;
        let mut report = TickReport::default();
        if self.paused.load(Ordering::SeqCst) {
            return report;
        }

        let now = Utc::now();
        let due: Vec<FailedOperation> = self
            .queues()
            .failed
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();

        for entry in due {
            report.attempted += 1;
            match self.attempt(&entry).await {
                Ok(()) => {
                    report.succeeded += 1;
                    self.settle_success(&entry.operation_id);
                }
                Err(e) => {
                    report.failed += 1;
                    if self.settle_failure(&entry.operation_id, &e) {
                        report.escalated += 1;
                    }
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                escalated = report.escalated,
                "dead letter tick finished"
            );
        }
        report
    }

    /// One isolated attempt: its own task (a panicking handler cannot take the
    /// loop down) and its own deadline.
    async fn attempt(&self, entry: &FailedOperation) -> Result<()> {
        let Some(handler) = self.handler_for(&entry.operation_type) else {
            return Err(CoreError::NoRetryHandler(entry.operation_type.clone()));
        };
        let owned = entry.clone();
        let task = tokio::spawn(async move { handler.retry(&owned).await });
        let abort = task.abort_handle();
        match tokio::time::timeout(self.config.attempt_timeout(), task).await {
            Ok(Ok(res)) => res,
            Ok(Err(join_err)) => Err(CoreError::Store(format!(
                "retry handler for '{}' did not complete: {join_err}",
                entry.operation_type
            ))),
            Err(_) => {
                abort.abort();
                Err(CoreError::Timeout(format!(
                    "retry of {} exceeded {}s",
                    entry.operation_id, self.config.attempt_timeout_secs
                )))
            }
        }
    }

    fn settle_success(&self, operation_id: &str) {
        if let Err(e) = io::remove_if_exists(&paths::dlq_entry_file(&self.failed_dir(), operation_id)) {
            // A stale file only costs one redundant retry after a restart.
            warn!(operation_id = %operation_id, error = %e, "could not remove retried entry file");
        }
        self.queues().failed.remove(operation_id);
        info!(operation_id = %operation_id, "dead-lettered operation succeeded on retry");
    }

    /// Returns `true` when the entry moved to manual review.
    ///
    /// Files are written without holding the queue lock; the tick lock keeps
    /// this the only writer of the entry.
    fn settle_failure(&self, operation_id: &str, err: &CoreError) -> bool {
        let Some(mut entry) = self.queues().failed.get(operation_id).cloned() else {
            return false;
        };
        // A missing handler is a deployment problem, not a transient one.
        let kind = match err {
            CoreError::NoRetryHandler(_) => ErrorKind::Internal,
            other => other.kind(),
        };
        entry.record_failure(kind, err.to_string(), Utc::now(), &self.config);

        if entry.manual_review {
            let manual_file = paths::dlq_entry_file(&self.manual_dir(), operation_id);
            if let Err(e) = io::write_json(&manual_file, &entry) {
                error!(operation_id = %operation_id, error = %e, "could not persist escalation; will retry next tick");
                return false;
            }
            if let Err(e) = io::remove_if_exists(&paths::dlq_entry_file(&self.failed_dir(), operation_id)) {
                warn!(operation_id = %operation_id, error = %e, "could not remove escalated entry from failed queue");
            }
            error!(
                operation_id = %operation_id,
                retry_count = entry.retry_count,
                error = %err,
                "retry budget exhausted, moved to manual review"
            );
            let mut q = self.queues();
            q.failed.remove(operation_id);
            q.manual.insert(operation_id.to_string(), entry);
            true
        } else {
            if let Err(e) = io::write_json(&paths::dlq_entry_file(&self.failed_dir(), operation_id), &entry) {
                error!(operation_id = %operation_id, error = %e, "could not persist retry bookkeeping");
            }
            warn!(
                operation_id = %operation_id,
                retry_count = entry.retry_count,
                max_retries = entry.max_retries,
                error = %err,
                "retry failed"
            );
            self.queues().failed.insert(operation_id.to_string(), entry);
            false
        }
    }
}

fn load_dir(dir: &Path) -> Result<BTreeMap<String, FailedOperation>> {
    let mut out = BTreeMap::new();
    for item in std::fs::read_dir(dir)? {
        let path = item?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match io::read_json::<FailedOperation>(&path) {
            Ok(entry) => {
                out.insert(entry.operation_id.clone(), entry);
            }
            Err(e) => {
                // Leave the file for an operator; a bad file must not hide the rest.
                error!(path = %path.display(), error = %e, "skipping unreadable dead letter entry");
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
