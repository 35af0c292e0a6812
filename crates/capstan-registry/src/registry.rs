//! Partition ownership registry.
//!
//! Tracks which worker owns which Kafka partition. Registration is
//! newest-wins: a register call unconditionally claims its partitions,
//! and any worker left with none is dropped entirely. Lookups treat a
//! worker whose heartbeat is older than the timeout as gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};

/// A registered worker. Returned copies are defensive; mutating one
/// does not affect registry state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub worker_id: String,
    pub http_address: String,
    pub partitions: Vec<i32>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<String, WorkerInfo>,
    owners: HashMap<i32, String>,
}

/// Thread-safe in-memory worker registry.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<Inner>>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            heartbeat_timeout,
        }
    }

    /// Register a worker, unconditionally claiming its partitions.
    ///
    /// A previous owner of any claimed partition silently loses it; if
    /// that leaves the previous owner with no partitions it is removed
    /// entirely. Re-registration preserves `registered_at`.
    pub fn register(&self, worker_id: &str, http_address: &str, partitions: &[i32]) {
        let now = Utc::now();
        let mut inner = self.lock();

        // Drop this worker's previous assignments.
        inner.owners.retain(|_, owner| owner != worker_id);

        let mut displaced: Vec<String> = Vec::new();
        for &partition in partitions {
            if let Some(previous) = inner.owners.insert(partition, worker_id.to_string())
                && previous != worker_id
            {
                debug!(partition, from = %previous, to = %worker_id, "partition reassigned");
                displaced.push(previous);
            }
        }

        let registered_at = inner
            .workers
            .get(worker_id)
            .map(|w| w.registered_at)
            .unwrap_or(now);
        inner.workers.insert(
            worker_id.to_string(),
            WorkerInfo {
                worker_id: worker_id.to_string(),
                http_address: http_address.to_string(),
                partitions: partitions.to_vec(),
                registered_at,
                last_heartbeat: now,
            },
        );

        // A displaced worker that owns nothing anymore is gone.
        for previous in displaced {
            let still_owns = inner.owners.values().any(|owner| *owner == previous);
            if !still_owns && inner.workers.remove(&previous).is_some() {
                info!(worker = %previous, "worker displaced from all partitions");
            }
        }

        info!(worker = %worker_id, ?partitions, "worker registered");
    }

    /// Refresh a worker's heartbeat.
    pub fn heartbeat(&self, worker_id: &str) -> RegistryResult<()> {
        let mut inner = self.lock();
        match inner.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = Utc::now();
                Ok(())
            }
            None => {
                warn!(worker = %worker_id, "heartbeat from unknown worker");
                Err(RegistryError::WorkerNotFound(worker_id.to_string()))
            }
        }
    }

    /// The healthy worker owning a partition.
    pub fn get_worker_for_partition(&self, partition: i32) -> RegistryResult<WorkerInfo> {
        let inner = self.lock();
        let owner = inner
            .owners
            .get(&partition)
            .ok_or(RegistryError::NoWorker(partition))?;
        let worker = inner
            .workers
            .get(owner)
            .ok_or_else(|| RegistryError::WorkerNotFound(owner.clone()))?;
        if self.is_stale(worker) {
            return Err(RegistryError::WorkerNotFound(owner.clone()));
        }
        Ok(worker.clone())
    }

    /// All workers with a fresh heartbeat.
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let inner = self.lock();
        let mut workers: Vec<WorkerInfo> = inner
            .workers
            .values()
            .filter(|w| !self.is_stale(w))
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    /// Drop a worker and its partition assignments.
    pub fn unregister(&self, worker_id: &str) -> bool {
        let mut inner = self.lock();
        inner.owners.retain(|_, owner| owner != worker_id);
        let existed = inner.workers.remove(worker_id).is_some();
        if existed {
            info!(worker = %worker_id, "worker unregistered");
        }
        existed
    }

    /// Sweep out every worker whose heartbeat went stale. Returns the
    /// removed worker ids.
    pub fn cleanup_stale_workers(&self) -> Vec<String> {
        let stale: Vec<String> = {
            let inner = self.lock();
            inner
                .workers
                .values()
                .filter(|w| self.is_stale(w))
                .map(|w| w.worker_id.clone())
                .collect()
        };
        for worker_id in &stale {
            warn!(worker = %worker_id, "removing stale worker");
            self.unregister(worker_id);
        }
        stale
    }

    fn is_stale(&self, worker: &WorkerInfo) -> bool {
        let age = Utc::now() - worker.last_heartbeat;
        age.to_std().is_ok_and(|age| age >= self.heartbeat_timeout)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(Duration::from_secs(30))
    }

    #[test]
    fn newest_registration_wins_partition() {
        let reg = registry();
        reg.register("worker-a", "10.0.0.1:8080", &[0]);
        std::thread::sleep(Duration::from_millis(10));
        reg.register("worker-b", "10.0.0.2:8080", &[0]);

        let owner = reg.get_worker_for_partition(0).unwrap();
        assert_eq!(owner.worker_id, "worker-b");
        // worker-a lost its only partition and is gone entirely.
        assert!(matches!(
            reg.heartbeat("worker-a"),
            Err(RegistryError::WorkerNotFound(_))
        ));
    }

    #[test]
    fn displaced_worker_keeps_remaining_partitions() {
        let reg = registry();
        reg.register("worker-a", "10.0.0.1:8080", &[0, 1]);
        reg.register("worker-b", "10.0.0.2:8080", &[0]);

        assert_eq!(reg.get_worker_for_partition(0).unwrap().worker_id, "worker-b");
        assert_eq!(reg.get_worker_for_partition(1).unwrap().worker_id, "worker-a");
        assert!(reg.heartbeat("worker-a").is_ok());
    }

    #[test]
    fn reregistration_preserves_registered_at() {
        let reg = registry();
        reg.register("worker-a", "10.0.0.1:8080", &[0]);
        let first = reg.get_worker_for_partition(0).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        reg.register("worker-a", "10.0.0.1:8080", &[0, 1]);
        let second = reg.get_worker_for_partition(0).unwrap();

        assert_eq!(first.registered_at, second.registered_at);
        assert!(second.last_heartbeat > first.last_heartbeat);
    }

    #[test]
    fn reregistration_releases_dropped_partitions() {
        let reg = registry();
        reg.register("worker-a", "10.0.0.1:8080", &[0, 1]);
        reg.register("worker-a", "10.0.0.1:8080", &[1]);

        assert_eq!(
            reg.get_worker_for_partition(0),
            Err(RegistryError::NoWorker(0))
        );
        assert_eq!(reg.get_worker_for_partition(1).unwrap().worker_id, "worker-a");
    }

    #[test]
    fn unassigned_partition_errors_no_worker() {
        assert_eq!(
            registry().get_worker_for_partition(7),
            Err(RegistryError::NoWorker(7))
        );
    }

    #[test]
    fn stale_owner_reports_worker_not_found() {
        let reg = WorkerRegistry::new(Duration::from_millis(5));
        reg.register("worker-a", "10.0.0.1:8080", &[0]);
        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(
            reg.get_worker_for_partition(0),
            Err(RegistryError::WorkerNotFound(_))
        ));
        assert!(reg.list_workers().is_empty());
    }

    #[test]
    fn cleanup_sweeps_stale_workers() {
        let reg = WorkerRegistry::new(Duration::from_millis(5));
        reg.register("worker-a", "10.0.0.1:8080", &[0]);
        std::thread::sleep(Duration::from_millis(10));
        reg.register("worker-b", "10.0.0.2:8080", &[1]);

        assert_eq!(reg.cleanup_stale_workers(), vec!["worker-a".to_string()]);
        assert_eq!(
            reg.get_worker_for_partition(0),
            Err(RegistryError::NoWorker(0))
        );
        assert!(reg.heartbeat("worker-b").is_ok());
    }

    #[test]
    fn returned_info_is_a_defensive_copy() {
        let reg = registry();
        reg.register("worker-a", "10.0.0.1:8080", &[0]);

        let mut copy = reg.get_worker_for_partition(0).unwrap();
        copy.http_address = "tampered".to_string();
        copy.partitions.clear();

        let fresh = reg.get_worker_for_partition(0).unwrap();
        assert_eq!(fresh.http_address, "10.0.0.1:8080");
        assert_eq!(fresh.partitions, vec![0]);
    }

    #[test]
    fn unregister_drops_worker_and_ownership() {
        let reg = registry();
        reg.register("worker-a", "10.0.0.1:8080", &[0]);
        assert!(reg.unregister("worker-a"));
        assert!(!reg.unregister("worker-a"));
        assert_eq!(
            reg.get_worker_for_partition(0),
            Err(RegistryError::NoWorker(0))
        );
    }
}
