use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Closed classification of failures, set where the error originates.
///
/// Retry strategy selection in the DLQ reads this, never the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The graph store could not be reached or dropped the connection.
    Connection,
    /// A call or pool acquisition exceeded its deadline.
    Timeout,
    /// The request was malformed or rejected by the store's constraints.
    Validation,
    /// The store refused the request for authorization reasons.
    Permission,
    /// A circuit breaker rejected the call without invoking it.
    CircuitOpen,
    /// An undo action failed; external state may be inconsistent.
    Compensation,
    /// Anything else (local I/O, serialization, invariant violations).
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::CircuitOpen | ErrorKind::Internal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Compensation => "compensation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "connection" => Ok(ErrorKind::Connection),
            "timeout" => Ok(ErrorKind::Timeout),
            "validation" => Ok(ErrorKind::Validation),
            "permission" => Ok(ErrorKind::Permission),
            "circuit_open" => Ok(ErrorKind::CircuitOpen),
            "compensation" => Ok(ErrorKind::Compensation),
            "internal" => Ok(ErrorKind::Internal),
            _ => Err(CoreError::Validation(format!("unknown error kind '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not initialized: run 'qsrctl init'")]
    NotInitialized,

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("graph store connection failed: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("compensation failed for operation {operation_id}: {message}")]
    Compensation {
        operation_id: String,
        message: String,
    },

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("operation {operation_id} not found in transaction {transaction_id}")]
    OperationNotFound {
        transaction_id: String,
        operation_id: String,
    },

    #[error("transaction {transaction_id} is {state}, expected active")]
    InvalidTransactionState {
        transaction_id: String,
        state: String,
    },

    #[error("operation {operation_id} in transaction {transaction_id} is still running")]
    OperationInFlight {
        transaction_id: String,
        operation_id: String,
    },

    #[error("dead letter entry not found: {0}")]
    DlqEntryNotFound(String),

    #[error("no retry handler registered for operation type '{0}'")]
    NoRetryHandler(String),

    #[error("graph store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Build an error of the given kind; used when a store reports a failure.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Connection => CoreError::Connection(message),
            ErrorKind::Timeout => CoreError::Timeout(message),
            ErrorKind::Validation => CoreError::Validation(message),
            ErrorKind::Permission => CoreError::Permission(message),
            ErrorKind::CircuitOpen => CoreError::CircuitOpen(message),
            ErrorKind::Compensation => CoreError::Compensation {
                operation_id: String::new(),
                message,
            },
            ErrorKind::Internal => CoreError::Store(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            CoreError::Connection(_) => ErrorKind::Connection,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Permission(_) => ErrorKind::Permission,
            CoreError::Compensation { .. } => ErrorKind::Compensation,
            CoreError::NotInitialized
            | CoreError::TransactionNotFound(_)
            | CoreError::OperationNotFound { .. }
            | CoreError::InvalidTransactionState { .. }
            | CoreError::OperationInFlight { .. }
            | CoreError::DlqEntryNotFound(_)
            | CoreError::NoRetryHandler(_)
            | CoreError::Store(_)
            | CoreError::Io(_)
            | CoreError::Yaml(_)
            | CoreError::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
