use super::{GraphQuery, GraphStore};
use crate::config::PoolConfig;
use crate::error::{CoreError, Result};
use crate::transaction::OperationExecutor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Bounded access to the graph store.
///
/// Each query acquires a slot for its own duration and releases it on every
/// exit path (the permit is dropped with the future). No caller holds a slot
/// across steps of a multi-step operation.
#[derive(Clone)]
pub struct GraphPool {
    store: Arc<dyn GraphStore>,
    slots: Arc<Semaphore>,
    max_connections: usize,
    acquire_timeout: Duration,
    query_timeout: Duration,
}

impl GraphPool {
    pub fn new(store: Arc<dyn GraphStore>, config: &PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        Self {
            store,
            slots: Arc::new(Semaphore::new(max)),
            max_connections: max,
            acquire_timeout: config.acquire_timeout(),
            query_timeout: config.query_timeout(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Run `query` with the pool's default query timeout.
    pub async fn execute(&self, query: &GraphQuery) -> Result<Vec<serde_json::Value>> {
        self.execute_with_timeout(query, self.query_timeout).await
    }

    /// Run `query` with an explicit deadline for the query itself.
    ///
    /// Acquisition has its own deadline; either expiring yields
    /// [`CoreError::Timeout`].
    pub async fn execute_with_timeout(
        &self,
        query: &GraphQuery,
        deadline: Duration,
    ) -> Result<Vec<serde_json::Value>> {
        let _slot = match tokio::time::timeout(self.acquire_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(CoreError::Connection("graph pool closed".to_string()));
            }
            Err(_) => {
                warn!(
                    op = query.op_name(),
                    max = self.max_connections,
                    "graph pool exhausted"
                );
                return Err(CoreError::Timeout(format!(
                    "no graph connection available within {}ms",
                    self.acquire_timeout.as_millis()
                )));
            }
        };

        debug!(op = query.op_name(), "executing graph query");
        match tokio::time::timeout(deadline, self.store.execute_query(query)).await {
            Ok(result) => result.into_result(),
            Err(_) => Err(CoreError::Timeout(format!(
                "{} exceeded {}ms",
                query.op_name(),
                deadline.as_millis()
            ))),
        }
    }

    /// Stop handing out slots; in-flight queries finish normally.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[async_trait]
impl OperationExecutor for GraphPool {
    async fn execute(&self, payload: &GraphQuery) -> Result<Vec<serde_json::Value>> {
        self.execute_with_timeout(payload, self.query_timeout).await
    }
}
