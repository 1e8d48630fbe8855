use super::{FailedOperation, RetryHandler};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{CoreError, Result};
use crate::graph::{GraphPool, GraphQuery};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Replays a dead-lettered [`GraphQuery`] through the breaker and pool.
///
/// Register it for every operation type whose payload is a serialized query.
pub struct GraphReplayHandler {
    pool: GraphPool,
    breaker: Arc<CircuitBreaker>,
}

impl GraphReplayHandler {
    pub fn new(pool: GraphPool, breaker: Arc<CircuitBreaker>) -> Self {
        Self { pool, breaker }
    }
}

#[async_trait]
impl RetryHandler for GraphReplayHandler {
    async fn retry(&self, entry: &FailedOperation) -> Result<()> {
        let query: GraphQuery = serde_json::from_value(entry.payload.clone()).map_err(|e| {
            CoreError::Validation(format!(
                "payload of {} is not a graph query: {e}",
                entry.operation_id
            ))
        })?;
        debug!(operation_id = %entry.operation_id, op = query.op_name(), "replaying graph query");
        self.breaker
            .call(|| self.pool.execute(&query))
            .await
            .map(|_| ())
    }
}
