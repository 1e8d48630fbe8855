//! Best-effort stage events for long-running mutations.
//!
//! Delivery never influences the outcome of the mutation: a sink error is
//! logged and dropped by [`notify`].

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Validate,
    Analyze,
    Plan,
    Backup,
    Execute,
    Verify,
    Rollback,
    Completed,
    Failed,
}

impl std::fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressStage::Validate => "validate",
            ProgressStage::Analyze => "analyze",
            ProgressStage::Plan => "plan",
            ProgressStage::Backup => "backup",
            ProgressStage::Execute => "execute",
            ProgressStage::Verify => "verify",
            ProgressStage::Rollback => "rollback",
            ProgressStage::Completed => "completed",
            ProgressStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub document_id: String,
    pub stage: ProgressStage,
    pub progress_percent: u8,
    pub message: String,
    pub entities_found: usize,
    pub relationships_found: usize,
}

impl ProgressEvent {
    pub fn new(
        document_id: impl Into<String>,
        stage: ProgressStage,
        progress_percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            stage,
            progress_percent: progress_percent.min(100),
            message: message.into(),
            entities_found: 0,
            relationships_found: 0,
        }
    }

    pub fn with_counts(mut self, entities: usize, relationships: usize) -> Self {
        self.entities_found = entities;
        self.relationships_found = relationships;
        self
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent) -> Result<()>;
}

/// Emit `event`, logging and discarding any delivery failure.
pub fn notify(sink: &dyn ProgressSink, event: ProgressEvent) {
    if let Err(e) = sink.emit(&event) {
        warn!(
            document = %event.document_id,
            stage = %event.stage,
            error = %e,
            "progress notification dropped"
        );
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn emit(&self, _event: &ProgressEvent) -> Result<()> {
        Ok(())
    }
}

/// Writes each event as a structured `info!` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: &ProgressEvent) -> Result<()> {
        info!(
            document = %event.document_id,
            stage = %event.stage,
            percent = event.progress_percent,
            entities = event.entities_found,
            relationships = event.relationships_found,
            "{}",
            event.message
        );
        Ok(())
    }
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastProgress {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastProgress {
    fn emit(&self, event: &ProgressEvent) -> Result<()> {
        if self.tx.receiver_count() == 0 {
            return Ok(());
        }
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|e| CoreError::Store(format!("progress channel closed: {e}")))
    }
}
