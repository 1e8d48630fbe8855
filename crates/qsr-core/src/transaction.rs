//! Compensating transactions over the graph store.
//!
//! Operations are queued with a forward query and a compensation (one or more
//! queries that undo it), executed one at a time through a circuit breaker,
//! and either committed together or undone in reverse execution order.
//!
//! Lifecycle: `Active → Committed | RolledBack`. Finished transactions move
//! to a bounded history and reject further changes.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{CoreError, ErrorKind, Result};
use crate::graph::GraphQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const HISTORY_LIMIT: usize = 256;

// ---------------------------------------------------------------------------
// Executor seam
// ---------------------------------------------------------------------------

/// Runs one payload against the external system.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, payload: &GraphQuery) -> Result<Vec<serde_json::Value>>;
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => f.write_str("active"),
            TransactionState::Committed => f.write_str("committed"),
            TransactionState::RolledBack => f.write_str("rolled_back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    /// The forward payload has been handed to the executor and has not returned.
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub op_type: String,
    pub forward_payload: GraphQuery,
    /// Queries run in order to undo `forward_payload`.
    pub compensation_spec: Vec<GraphQuery>,
    pub status: OperationStatus,
    /// Position in execution order within the transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl Operation {
    fn succeeded(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub name: String,
    pub operations: Vec<Operation>,
    pub state: TransactionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One compensation query that failed during rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub transaction_id: Uuid,
    pub operation_id: Uuid,
    pub op_type: String,
    pub compensation: GraphQuery,
    pub error_kind: ErrorKind,
    pub error: String,
}

impl CompensationFailure {
    pub fn to_error(&self) -> CoreError {
        CoreError::Compensation {
            operation_id: self.operation_id.to_string(),
            message: self.error.clone(),
        }
    }
}

/// Result of commit or rollback. Expected failures are reported here, not as `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub transaction_id: Uuid,
    pub committed: bool,
    pub state: TransactionState,
    pub errors: Vec<String>,
    /// Operations whose compensation completed, in the order they were undone.
    pub compensated: Vec<Uuid>,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl CommitOutcome {
    pub fn rollback_performed(&self) -> bool {
        self.state == TransactionState::RolledBack
    }

    pub fn rollback_clean(&self) -> bool {
        self.compensation_failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TransactionManager
// ---------------------------------------------------------------------------

pub struct TransactionManager {
    breaker: Arc<CircuitBreaker>,
    compensation_timeout: Duration,
    active: Mutex<HashMap<Uuid, Transaction>>,
    history: Mutex<VecDeque<Transaction>>,
    seq: AtomicU64,
}

impl TransactionManager {
    pub fn new(breaker: Arc<CircuitBreaker>, compensation_timeout: Duration) -> Self {
        Self {
            breaker,
            compensation_timeout,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, Transaction>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<Transaction>> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Error for a transaction id that is not active: finished or unknown.
    fn not_active(&self, tx_id: Uuid) -> CoreError {
        match self.history().iter().find(|t| t.id == tx_id) {
            Some(t) => CoreError::InvalidTransactionState {
                transaction_id: tx_id.to_string(),
                state: t.state.to_string(),
            },
            None => CoreError::TransactionNotFound(tx_id.to_string()),
        }
    }

    pub fn begin_transaction(&self, name: impl Into<String>) -> Uuid {
        let tx = Transaction {
            id: Uuid::new_v4(),
            name: name.into(),
            operations: Vec::new(),
            state: TransactionState::Active,
            created_at: Utc::now(),
            finished_at: None,
        };
        let id = tx.id;
        info!(tx = %id, name = %tx.name, "transaction started");
        self.active().insert(id, tx);
        id
    }

    /// Queue an operation. Nothing runs until [`execute_operation`](Self::execute_operation).
    pub fn add_operation(
        &self,
        tx_id: Uuid,
        op_type: impl Into<String>,
        forward_payload: GraphQuery,
        compensation_spec: Vec<GraphQuery>,
    ) -> Result<Uuid> {
        let mut active = self.active();
        let Some(tx) = active.get_mut(&tx_id) else {
            drop(active);
            return Err(self.not_active(tx_id));
        };
        let op = Operation {
            id: Uuid::new_v4(),
            op_type: op_type.into(),
            forward_payload,
            compensation_spec,
            status: OperationStatus::Pending,
            executed_seq: None,
            result: None,
            error: None,
        };
        let id = op.id;
        tx.operations.push(op);
        Ok(id)
    }

    /// Run one queued operation through the breaker and record the outcome.
    ///
    /// The executor's error is returned unchanged; the caller decides whether
    /// to continue. The manager's lock is not held while the executor runs.
    pub async fn execute_operation(
        &self,
        tx_id: Uuid,
        op_id: Uuid,
        executor: &dyn OperationExecutor,
    ) -> Result<Vec<serde_json::Value>> {
        let payload = {
            let mut active = self.active();
            let Some(tx) = active.get_mut(&tx_id) else {
                drop(active);
                return Err(self.not_active(tx_id));
            };
            let op = tx
                .operations
                .iter_mut()
                .find(|o| o.id == op_id)
                .ok_or_else(|| CoreError::OperationNotFound {
                    transaction_id: tx_id.to_string(),
                    operation_id: op_id.to_string(),
                })?;
            if op.status != OperationStatus::Pending {
                return Err(CoreError::Validation(format!(
                    "operation {op_id} already executed"
                )));
            }
            // Claim the slot before releasing the lock so a concurrent call
            // cannot run the same operation twice.
            op.status = OperationStatus::Running;
            op.executed_seq = Some(self.seq.fetch_add(1, Ordering::SeqCst));
            op.forward_payload.clone()
        };

        let outcome = self.breaker.call(|| executor.execute(&payload)).await;

        let mut active = self.active();
        match active
            .get_mut(&tx_id)
            .and_then(|tx| tx.operations.iter_mut().find(|o| o.id == op_id))
        {
            Some(op) => match &outcome {
                Ok(records) => {
                    op.status = OperationStatus::Succeeded;
                    op.result = Some(records.clone());
                }
                Err(e) => {
                    warn!(tx = %tx_id, op = %op_id, op_type = %op.op_type, error = %e, "operation failed");
                    op.status = OperationStatus::Failed;
                    op.error = Some(OperationError {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            },
            None => {
                warn!(tx = %tx_id, op = %op_id, "transaction finished while operation was running");
            }
        }
        outcome
    }

    /// Commit if every queued operation executed cleanly, otherwise roll back.
    ///
    /// Returns `Err` only for programmer errors: an unknown or finished
    /// transaction, or one with an operation still running. In the last case
    /// the transaction stays active and can be committed once it settles.
    pub async fn commit_transaction(
        &self,
        tx_id: Uuid,
        compensator: &dyn OperationExecutor,
    ) -> Result<CommitOutcome> {
        let tx = self.take_active(tx_id)?;

        let errors: Vec<String> = tx
            .operations
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| match &o.error {
                Some(e) => format!("{} ({}): {}", o.op_type, o.id, e.message),
                None => format!("{} ({}): not executed", o.op_type, o.id),
            })
            .collect();

        if errors.is_empty() {
            return Ok(self.finish_committed(tx));
        }
        Ok(self.roll_back(tx, errors, compensator).await)
    }

    /// Roll back regardless of operation outcomes (e.g. post-execution verification failed).
    pub async fn rollback_transaction(
        &self,
        tx_id: Uuid,
        reason: impl Into<String>,
        compensator: &dyn OperationExecutor,
    ) -> Result<CommitOutcome> {
        let tx = self.take_active(tx_id)?;
        Ok(self.roll_back(tx, vec![reason.into()], compensator).await)
    }

    pub fn get_transaction(&self, tx_id: Uuid) -> Option<Transaction> {
        if let Some(tx) = self.active().get(&tx_id) {
            return Some(tx.clone());
        }
        self.history().iter().find(|t| t.id == tx_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn take_active(&self, tx_id: Uuid) -> Result<Transaction> {
        let mut active = self.active();
        let Some(tx) = active.get(&tx_id) else {
            drop(active);
            return Err(self.not_active(tx_id));
        };
        if let Some(op) = tx
            .operations
            .iter()
            .find(|o| o.status == OperationStatus::Running)
        {
            return Err(CoreError::OperationInFlight {
                transaction_id: tx_id.to_string(),
                operation_id: op.id.to_string(),
            });
        }
        active.remove(&tx_id).ok_or_else(|| CoreError::TransactionNotFound(tx_id.to_string()))
    }

    fn archive(&self, tx: Transaction) {
        let mut history = self.history();
        if history.len() >= HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(tx);
    }

    fn finish_committed(&self, mut tx: Transaction) -> CommitOutcome {
        tx.state = TransactionState::Committed;
        tx.finished_at = Some(Utc::now());
        info!(tx = %tx.id, name = %tx.name, operations = tx.operations.len(), "transaction committed");
        let outcome = CommitOutcome {
            transaction_id: tx.id,
            committed: true,
            state: tx.state,
            errors: Vec::new(),
            compensated: Vec::new(),
            compensation_failures: Vec::new(),
        };
        self.archive(tx);
        outcome
    }

    async fn roll_back(
        &self,
        mut tx: Transaction,
        errors: Vec<String>,
        compensator: &dyn OperationExecutor,
    ) -> CommitOutcome {
        warn!(tx = %tx.id, name = %tx.name, errors = errors.len(), "rolling back transaction");

        let mut done: Vec<&Operation> = tx.operations.iter().filter(|o| o.succeeded()).collect();
        done.sort_by_key(|o| std::cmp::Reverse(o.executed_seq));

        let mut compensated = Vec::new();
        let mut failures = Vec::new();
        for op in done {
            let mut clean = true;
            for step in &op.compensation_spec {
                let res = match tokio::time::timeout(
                    self.compensation_timeout,
                    compensator.execute(step),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => Err(CoreError::Timeout(format!(
                        "compensation {} exceeded {}ms",
                        step.op_name(),
                        self.compensation_timeout.as_millis()
                    ))),
                };
                if let Err(e) = res {
                    error!(
                        tx = %tx.id,
                        op = %op.id,
                        op_type = %op.op_type,
                        compensation = step.op_name(),
                        error = %e,
                        "compensation failed; external state may be inconsistent"
                    );
                    failures.push(CompensationFailure {
                        transaction_id: tx.id,
                        operation_id: op.id,
                        op_type: op.op_type.clone(),
                        compensation: step.clone(),
                        error_kind: e.kind(),
                        error: e.to_string(),
                    });
                    clean = false;
                }
            }
            if clean {
                compensated.push(op.id);
            }
        }

        tx.state = TransactionState::RolledBack;
        tx.finished_at = Some(Utc::now());
        info!(
            tx = %tx.id,
            compensated = compensated.len(),
            failed = failures.len(),
            "transaction rolled back"
        );
        let outcome = CommitOutcome {
            transaction_id: tx.id,
            committed: false,
            state: tx.state,
            errors,
            compensated,
            compensation_failures: failures,
        };
        self.archive(tx);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
