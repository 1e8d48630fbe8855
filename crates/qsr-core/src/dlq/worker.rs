use super::DeadLetterQueue;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl DeadLetterQueue {
    /// Start the background retry loop. A second call while running is a no-op.
    ///
    /// The loop holds only a weak reference, so dropping the last `Arc` of
    /// the queue also ends it.
    pub fn start_processor(self: &Arc<Self>) {
        let mut slot = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|w| !w.join.is_finished()) {
            debug!("dead letter processor already running");
            return;
        }

        let token = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let interval = self.config.tick_interval();
        let join = tokio::spawn(run_loop(weak, token.clone(), interval));

        *slot = Some(WorkerHandle { token, join });
        info!(interval_secs = interval.as_secs(), "dead letter processor started");
    }

    /// Stop the background loop and wait for an in-flight tick to finish.
    pub async fn shutdown(&self) {
        let handle = {
            let mut slot = self.worker.lock().unwrap_or_else(|p| p.into_inner());
            slot.take()
        };
        let Some(handle) = handle else {
            return;
        };
        handle.token.cancel();
        if let Err(e) = handle.join.await {
            warn!(error = %e, "dead letter processor ended abnormally");
        }
        info!("dead letter processor stopped");
    }

    /// True while the loop task is alive, so a loop that died is not reported as running.
    pub(super) fn processor_running(&self) -> bool {
        let slot = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref().is_some_and(|w| !w.join.is_finished())
    }
}

async fn run_loop(queue: Weak<DeadLetterQueue>, token: CancellationToken, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Outside the select: a started pass always runs to completion.
        let Some(queue) = queue.upgrade() else {
            break;
        };
        queue.process_due().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::{FailedOperation, RetryHandler};
    use super::*;
    use crate::config::DlqConfig;
    use crate::error::{CoreError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Counting(Arc<AtomicU32>);

    #[async_trait]
    impl RetryHandler for Counting {
        async fn retry(&self, _entry: &FailedOperation) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue(dir: &TempDir) -> Arc<DeadLetterQueue> {
        let cfg = DlqConfig {
            tick_interval_secs: 1,
            base_backoff_secs: 0,
            ..DlqConfig::default()
        };
        Arc::new(DeadLetterQueue::open(dir.path().join("dlq"), cfg).unwrap())
    }

    #[tokio::test]
    async fn processor_drains_and_stops() {
        let dir = TempDir::new().unwrap();
        let dlq = queue(&dir);
        let calls = Arc::new(AtomicU32::new(0));
        dlq.register_handler("delete_entity", Arc::new(Counting(calls.clone())));
        dlq.add_failed_operation(
            "delete_entity",
            serde_json::json!({}),
            &CoreError::Connection("down".into()),
            None,
        )
        .unwrap();

        dlq.start_processor();
        assert!(dlq.get_queue_status().background_processor_running);

        // The first tick fires immediately.
        for _ in 0..100 {
            if dlq.get_queue_status().failed_operations == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dlq.get_queue_status().failed_operations, 0);

        dlq.shutdown().await;
        assert!(!dlq.get_queue_status().background_processor_running);
    }

    #[tokio::test]
    async fn zero_tick_interval_keeps_processor_alive() {
        let dir = TempDir::new().unwrap();
        let cfg = DlqConfig {
            tick_interval_secs: 0,
            base_backoff_secs: 0,
            ..DlqConfig::default()
        };
        let dlq = Arc::new(DeadLetterQueue::open(dir.path().join("dlq"), cfg).unwrap());
        dlq.start_processor();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dlq.get_queue_status().background_processor_running);
        dlq.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_a_dead_loop_as_stopped() {
        let dir = TempDir::new().unwrap();
        let dlq = queue(&dir);
        dlq.start_processor();
        {
            let slot = dlq.worker.lock().unwrap();
            slot.as_ref().unwrap().join.abort();
        }
        for _ in 0..100 {
            if !dlq.get_queue_status().background_processor_running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dlq.get_queue_status().background_processor_running);
        dlq.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_is_noop_and_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let dlq = queue(&dir);
        dlq.start_processor();
        dlq.start_processor();
        dlq.shutdown().await;
        dlq.shutdown().await;
        assert!(!dlq.get_queue_status().background_processor_running);
    }
}
