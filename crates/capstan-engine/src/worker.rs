//! Reconcile worker.
//!
//! Long-running loop per node: claim a batch of work items, process
//! them on a bounded pool, extend leases from a heartbeat ticker, and
//! ack with retry backoff on failure. Shutdown drains in-flight items
//! before returning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use capstan_queue::{AckOutcome, EnqueueRequest, WorkItem, WorkQueue};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::processor::{Dispatcher, Outcome};

/// Tuning knobs for one worker node.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Kinds this node claims; empty means every kind the dispatcher
    /// understands.
    pub kinds: Vec<String>,
    pub batch_size: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub max_concurrency: usize,
    /// Cap on the exponential retry backoff applied to failed items.
    pub max_retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            kinds: Vec::new(),
            batch_size: 10,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            max_concurrency: 4,
            max_retry_backoff: Duration::from_secs(300),
        }
    }
}

pub struct ReconcileWorker {
    queue: WorkQueue,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    in_flight: Arc<Mutex<Vec<WorkItem>>>,
}

impl ReconcileWorker {
    pub fn new(queue: WorkQueue, dispatcher: Dispatcher, config: WorkerConfig) -> Self {
        Self {
            queue,
            dispatcher: Arc::new(dispatcher),
            config,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run until the shutdown signal flips, then drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.config.worker_id,
            batch = self.config.batch_size,
            concurrency = self.config.max_concurrency,
            "reconcile worker started"
        );

        let heartbeat = self.spawn_heartbeat(shutdown.clone());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(n) => debug!(worker = %self.config.worker_id, items = n, "batch processed"),
                        Err(e) => warn!(worker = %self.config.worker_id, error = %e, "claim cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(worker = %self.config.worker_id, "reconcile worker shutting down");
                    break;
                }
            }
        }

        let _ = heartbeat.await;
    }

    /// Claim one batch and process it to completion. Returns the number
    /// of items processed.
    pub async fn run_once(&self) -> EngineResult<usize> {
        let kind_refs: Vec<&str> = self.config.kinds.iter().map(String::as_str).collect();
        let kinds = if kind_refs.is_empty() {
            Some(Dispatcher::kinds())
        } else {
            Some(kind_refs.as_slice())
        };

        let claimed = self.queue.claim(
            &self.config.worker_id,
            kinds,
            self.config.batch_size,
            self.config.lease,
        )?;
        if claimed.is_empty() {
            return Ok(0);
        }
        let count = claimed.len();

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.extend(claimed.iter().cloned());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = JoinSet::new();
        for item in claimed {
            let permit = semaphore.clone().acquire_owned();
            let dispatcher = self.dispatcher.clone();
            let queue = self.queue.clone();
            let in_flight = self.in_flight.clone();
            let worker_id = self.config.worker_id.clone();
            let max_backoff = self.config.max_retry_backoff;
            tasks.spawn(async move {
                let Ok(_permit) = permit.await else { return };
                finish_item(&queue, &dispatcher, &worker_id, &item, max_backoff).await;
                if let Ok(mut in_flight) = in_flight.lock() {
                    in_flight.retain(|held| held.scope_key() != item.scope_key());
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(count)
    }

    /// Lease extension ticker. Runs at a third of the lease duration so
    /// two ticks can be missed before a lease lapses.
    fn spawn_heartbeat(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let in_flight = self.in_flight.clone();
        let worker_id = self.config.worker_id.clone();
        let lease = self.config.lease;
        let tick = lease / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {
                        let held: Vec<WorkItem> = match in_flight.lock() {
                            Ok(items) => items.clone(),
                            Err(_) => continue,
                        };
                        if held.is_empty() {
                            continue;
                        }
                        match queue.heartbeat(&held, &worker_id, lease) {
                            Ok(extended) => debug!(worker = %worker_id, extended, "leases extended"),
                            Err(e) => warn!(worker = %worker_id, error = %e, "heartbeat failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

/// Process one item and ack its outcome.
async fn finish_item(
    queue: &WorkQueue,
    dispatcher: &Dispatcher,
    worker_id: &str,
    item: &WorkItem,
    max_backoff: Duration,
) {
    match dispatcher.process(item).await {
        Ok(Outcome::Done) => {
            if let Err(e) = queue.ack_success(item, worker_id) {
                warn!(scope = %item.scope_id, error = %e, "ack failed");
            }
        }
        Ok(Outcome::RequeueAt(at)) => {
            // Ack first; the enqueue then revives the terminal row. A
            // stale ack means another enqueue interleaved, and that
            // newer event wins.
            match queue.ack_success(item, worker_id) {
                Ok(AckOutcome::Acked) => {
                    let request = EnqueueRequest::new(
                        &item.workspace_id,
                        &item.kind,
                        &item.scope_type,
                        &item.scope_id,
                    )
                    .with_priority(item.priority)
                    .with_not_before(at);
                    if let Err(e) = queue.enqueue(request) {
                        warn!(scope = %item.scope_id, error = %e, "requeue failed");
                    }
                }
                Ok(AckOutcome::Stale) => {
                    debug!(scope = %item.scope_id, "requeue superseded by newer enqueue");
                }
                Err(e) => warn!(scope = %item.scope_id, error = %e, "ack failed"),
            }
        }
        Err(e) => {
            let backoff = retry_backoff(item.attempts, max_backoff);
            warn!(
                scope = %item.scope_id,
                kind = %item.kind,
                attempts = item.attempts,
                backoff_secs = backoff.as_secs(),
                error = %e,
                "work item failed"
            );
            if let Err(e) = queue.ack_failure(item, worker_id, &e.to_string(), Some(backoff)) {
                warn!(scope = %item.scope_id, error = %e, "failure ack failed");
            }
        }
    }
}

/// Exponential backoff: 1s doubling per attempt, capped.
fn retry_backoff(attempts: u32, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use capstan_queue::{ItemStatus, kinds};
    use capstan_store::Store;

    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "worker-test".to_string(),
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        }
    }

    fn worker() -> (ReconcileWorker, WorkQueue) {
        let store = Store::open_in_memory().unwrap();
        let queue = WorkQueue::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(store, queue.clone());
        (ReconcileWorker::new(queue.clone(), dispatcher, config()), queue)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(300);
        assert_eq!(retry_backoff(1, max), Duration::from_secs(1));
        assert_eq!(retry_backoff(2, max), Duration::from_secs(2));
        assert_eq!(retry_backoff(5, max), Duration::from_secs(16));
        assert_eq!(retry_backoff(30, max), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn run_once_completes_claimed_items() {
        let (worker, queue) = worker();
        queue
            .enqueue(EnqueueRequest::new(
                "ws-1",
                kinds::DEPLOYMENT_SELECTOR_EVAL,
                "deployment",
                "dep-missing",
            ))
            .unwrap();

        // A missing deployment is a clean no-op, not an error.
        assert_eq!(worker.run_once().await.unwrap(), 1);
        let item = queue
            .get("ws-1", kinds::DEPLOYMENT_SELECTOR_EVAL, "deployment", "dep-missing")
            .unwrap()
            .unwrap();
        assert_eq!(item.status, ItemStatus::Done);
    }

    #[tokio::test]
    async fn failed_item_returns_to_ready_with_backoff() {
        let (worker, queue) = worker();
        queue
            .enqueue(EnqueueRequest::new("ws-1", "mystery", "x", "x-1"))
            .unwrap();

        // Unknown kinds are not claimed by a kind-filtered worker.
        assert_eq!(worker.run_once().await.unwrap(), 0);

        let mut all_kinds_config = config();
        all_kinds_config.kinds = vec!["mystery".to_string()];
        let dispatcher = Dispatcher::new(Store::open_in_memory().unwrap(), queue.clone());
        let worker = ReconcileWorker::new(queue.clone(), dispatcher, all_kinds_config);
        assert_eq!(worker.run_once().await.unwrap(), 1);

        let item = queue.get("ws-1", "mystery", "x", "x-1").unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Ready);
        assert_eq!(item.attempts, 1);
        assert!(item.last_error.is_some());
        assert!(item.not_before > item.event_ts);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (worker, _queue) = worker();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
