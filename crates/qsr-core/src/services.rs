//! Explicit wiring of the reliability core. No globals: callers own a
//! [`Services`] and pass it where needed.

use crate::circuit_breaker::{BreakerRegistry, CircuitBreaker};
use crate::config::{Config, WarnLevel};
use crate::dlq::{DeadLetterQueue, GraphReplayHandler};
use crate::error::{CoreError, Result};
use crate::graph::{GraphPool, GraphStore};
use crate::mutation::GraphMutationService;
use crate::paths;
use crate::progress::ProgressSink;
use crate::transaction::TransactionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Breaker name guarding the graph store.
pub const GRAPH_BREAKER: &str = "graph_store";
/// DLQ operation type for a single serialized [`crate::graph::GraphQuery`].
pub const GRAPH_QUERY_OP: &str = "graph_query";

pub struct Services {
    pub config: Config,
    pub breakers: BreakerRegistry,
    pub pool: GraphPool,
    pub transactions: Arc<TransactionManager>,
    pub dlq: Arc<DeadLetterQueue>,
    pub mutations: Arc<GraphMutationService>,
}

impl Services {
    /// Build every component for the project at `root` over `store`.
    ///
    /// The DLQ is reopened from `<root>/.qsr/dlq`, so entries captured
    /// before a restart are retried. The background processor is not
    /// started; call [`Services::start`]. A config with error-level
    /// warnings is rejected.
    pub fn bootstrap(root: &Path, config: Config, store: Arc<dyn GraphStore>) -> Result<Self> {
        Self::bootstrap_with_progress(root, config, store, None)
    }

    pub fn bootstrap_with_progress(
        root: &Path,
        config: Config,
        store: Arc<dyn GraphStore>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Self> {
        let mut invalid = Vec::new();
        for w in config.validate() {
            match w.level {
                WarnLevel::Error => invalid.push(w.message),
                WarnLevel::Warning => warn!(warning = %w.message, "config warning"),
            }
        }
        if !invalid.is_empty() {
            return Err(CoreError::Validation(format!(
                "invalid config: {}",
                invalid.join("; ")
            )));
        }

        let breakers = BreakerRegistry::new(config.breaker.clone());
        let breaker: Arc<CircuitBreaker> = breakers.get(GRAPH_BREAKER);
        let pool = GraphPool::new(store, &config.pool);
        let transactions = Arc::new(TransactionManager::new(
            breaker.clone(),
            config.pool.query_timeout(),
        ));
        let dlq = Arc::new(DeadLetterQueue::open(
            paths::dlq_dir(root),
            config.dlq.clone(),
        )?);
        dlq.register_handler(
            GRAPH_QUERY_OP,
            Arc::new(GraphReplayHandler::new(pool.clone(), breaker)),
        );

        let mut service = GraphMutationService::new(
            pool.clone(),
            transactions.clone(),
            dlq.clone(),
            config.mutation.clone(),
        );
        if let Some(sink) = progress {
            service = service.with_progress(sink);
        }
        let mutations = Arc::new(service);
        mutations.register_retry_handlers();

        let status = dlq.get_queue_status();
        info!(
            root = %root.display(),
            pending = status.failed_operations,
            manual_review = status.manual_review_queue,
            "reliability core ready"
        );

        Ok(Self {
            config,
            breakers,
            pool,
            transactions,
            dlq,
            mutations,
        })
    }

    /// Start background work (the DLQ retry loop).
    pub fn start(&self) {
        self.dlq.start_processor();
    }

    /// Stop background work and refuse new graph queries.
    pub async fn shutdown(&self) {
        self.dlq.shutdown().await;
        self.pool.close();
        info!("reliability core stopped");
    }
}
