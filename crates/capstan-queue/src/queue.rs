//! WorkQueue — redb-backed queue operations.
//!
//! One write transaction per operation keeps enqueue-coalescing and
//! batch claims atomic across worker processes sharing the database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::item::{ItemStatus, WorkItem, scope_key};

/// `scope_key` → WorkItem
const WORK_ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("work_items");

/// `"next_id"` → u64
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

macro_rules! map_err {
    ($variant:ident) => {
        |e| QueueError::$variant(e.to_string())
    };
}

/// Outcome of an ack attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The item transitioned as requested.
    Acked,
    /// The caller's lease or token was stale; another owner governs.
    Stale,
}

/// Parameters for an enqueue. `priority` defaults to 0 and
/// `not_before` to now.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub workspace_id: String,
    pub kind: String,
    pub scope_type: String,
    pub scope_id: String,
    pub event_ts: DateTime<Utc>,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(workspace_id: &str, kind: &str, scope_type: &str, scope_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            kind: kind.to_string(),
            scope_type: scope_type.to_string(),
            scope_id: scope_id.to_string(),
            event_ts: Utc::now(),
            priority: 0,
            not_before: None,
        }
    }

    pub fn with_event_ts(mut self, event_ts: DateTime<Utc>) -> Self {
        self.event_ts = event_ts;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }
}

/// Durable scope-coalesced work queue.
#[derive(Clone)]
pub struct WorkQueue {
    db: Arc<Database>,
    max_attempts: u32,
}

impl WorkQueue {
    /// Open (or create) a persistent queue at the given path.
    pub fn open(path: &Path) -> QueueResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let queue = Self {
            db: Arc::new(db),
            max_attempts: 5,
        };
        queue.ensure_tables()?;
        debug!(?path, "work queue opened");
        Ok(queue)
    }

    /// Create an ephemeral in-memory queue (for testing).
    pub fn open_in_memory() -> QueueResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let queue = Self {
            db: Arc::new(db),
            max_attempts: 5,
        };
        queue.ensure_tables()?;
        Ok(queue)
    }

    /// Override the dead-letter threshold.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn ensure_tables(&self) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Enqueue ────────────────────────────────────────────────────

    /// Upsert the unique row for the request's scope.
    ///
    /// If a ready-or-leased row exists, fold into it: newest
    /// `event_ts`, smallest `not_before`, largest `priority`. A row in
    /// a terminal status is reset to a fresh `ready` item under the
    /// same id.
    pub fn enqueue(&self, request: EnqueueRequest) -> QueueResult<WorkItem> {
        if request.workspace_id.is_empty() || request.kind.is_empty() || request.scope_id.is_empty()
        {
            return Err(QueueError::InvalidRequest(
                "workspace_id, kind, and scope_id are required".to_string(),
            ));
        }

        let now = Utc::now();
        let not_before = request.not_before.unwrap_or(now);
        let key = scope_key(
            &request.workspace_id,
            &request.kind,
            &request.scope_type,
            &request.scope_id,
        );

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let item = {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            let existing: Option<WorkItem> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };

            let item = match existing {
                Some(mut row)
                    if matches!(row.status, ItemStatus::Ready | ItemStatus::Leased) =>
                {
                    // Coalesce into the pending row.
                    row.event_ts = row.event_ts.max(request.event_ts);
                    row.not_before = row.not_before.min(not_before);
                    row.priority = row.priority.max(request.priority);
                    row.updated_at = now;
                    row
                }
                Some(row) => {
                    // Terminal row: revive under the same id.
                    WorkItem {
                        id: row.id,
                        workspace_id: request.workspace_id,
                        kind: request.kind,
                        scope_type: request.scope_type,
                        scope_id: request.scope_id,
                        event_ts: request.event_ts,
                        priority: request.priority,
                        not_before,
                        status: ItemStatus::Ready,
                        attempts: 0,
                        lease_owner: None,
                        lease_expires_at: None,
                        last_error: None,
                        created_at: row.created_at,
                        updated_at: now,
                    }
                }
                None => {
                    let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
                    let next = counters
                        .get("next_id")
                        .map_err(map_err!(Read))?
                        .map(|g| g.value())
                        .unwrap_or(1);
                    counters
                        .insert("next_id", next + 1)
                        .map_err(map_err!(Write))?;
                    WorkItem {
                        id: next,
                        workspace_id: request.workspace_id,
                        kind: request.kind,
                        scope_type: request.scope_type,
                        scope_id: request.scope_id,
                        event_ts: request.event_ts,
                        priority: request.priority,
                        not_before,
                        status: ItemStatus::Ready,
                        attempts: 0,
                        lease_owner: None,
                        lease_expires_at: None,
                        last_error: None,
                        created_at: now,
                        updated_at: now,
                    }
                }
            };

            let bytes = serde_json::to_vec(&item).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            item
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(scope = %item.scope_key(), id = item.id, "work item enqueued");
        Ok(item)
    }

    // ── Claim & lease ──────────────────────────────────────────────

    /// Atomically claim up to `batch_size` ready items whose
    /// `not_before` has passed, ordered by `(priority desc, event_ts
    /// asc)`, optionally filtered to the given kinds.
    pub fn claim(
        &self,
        worker_id: &str,
        kinds: Option<&[&str]>,
        batch_size: usize,
        lease: Duration,
    ) -> QueueResult<Vec<WorkItem>> {
        let now = Utc::now();
        let lease_expires = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed = {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;

            let mut candidates: Vec<WorkItem> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let item: WorkItem =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if item.status != ItemStatus::Ready || item.not_before > now {
                    continue;
                }
                if let Some(kinds) = kinds
                    && !kinds.contains(&item.kind.as_str())
                {
                    continue;
                }
                candidates.push(item);
            }

            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.event_ts.cmp(&b.event_ts))
            });
            candidates.truncate(batch_size);

            let mut claimed = Vec::with_capacity(candidates.len());
            for mut item in candidates {
                item.status = ItemStatus::Leased;
                item.lease_owner = Some(worker_id.to_string());
                item.lease_expires_at = Some(lease_expires);
                item.attempts += 1;
                item.updated_at = now;
                let key = item.scope_key();
                let bytes = serde_json::to_vec(&item).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                claimed.push(item);
            }
            claimed
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    /// Extend leases for items still owned by this worker; items with
    /// a different owner are silently skipped.
    pub fn heartbeat(
        &self,
        items: &[WorkItem],
        worker_id: &str,
        extend_by: Duration,
    ) -> QueueResult<u32> {
        let new_expiry = Utc::now()
            + chrono::Duration::from_std(extend_by)
                .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut extended = 0;
        {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            for item in items {
                let key = item.scope_key();
                let current: Option<WorkItem> =
                    match table.get(key.as_str()).map_err(map_err!(Read))? {
                        Some(guard) => Some(
                            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                        ),
                        None => None,
                    };
                let Some(mut current) = current else { continue };
                if current.status != ItemStatus::Leased
                    || current.lease_owner.as_deref() != Some(worker_id)
                {
                    continue;
                }
                current.lease_expires_at = Some(new_expiry);
                let bytes = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                extended += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(extended)
    }

    // ── Acks ───────────────────────────────────────────────────────

    /// Complete an item. Succeeds only if the caller still owns the
    /// lease and no interleaved enqueue bumped the update token; a
    /// stale caller must not re-enqueue.
    pub fn ack_success(&self, item: &WorkItem, worker_id: &str) -> QueueResult<AckOutcome> {
        self.transition(item, worker_id, |current, now| {
            current.status = ItemStatus::Done;
            current.lease_owner = None;
            current.lease_expires_at = None;
            current.last_error = None;
            current.updated_at = now;
        })
    }

    /// Record a failure: back to `ready` with a delay, or `dead_letter`
    /// once attempts are exhausted.
    pub fn ack_failure(
        &self,
        item: &WorkItem,
        worker_id: &str,
        error: &str,
        retry_after: Option<Duration>,
    ) -> QueueResult<AckOutcome> {
        let max_attempts = self.max_attempts;
        let delay = retry_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);
        self.transition(item, worker_id, move |current, now| {
            current.last_error = Some(error.to_string());
            current.lease_owner = None;
            current.lease_expires_at = None;
            current.updated_at = now;
            if current.attempts >= max_attempts {
                warn!(scope = %current.scope_key(), attempts = current.attempts, "work item dead-lettered");
                current.status = ItemStatus::DeadLetter;
            } else {
                current.status = ItemStatus::Ready;
                current.not_before = now + delay;
            }
        })
    }

    fn transition(
        &self,
        item: &WorkItem,
        worker_id: &str,
        apply: impl FnOnce(&mut WorkItem, DateTime<Utc>),
    ) -> QueueResult<AckOutcome> {
        let now = Utc::now();
        let key = item.scope_key();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            let current: Option<WorkItem> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            match current {
                Some(mut current)
                    if current.status == ItemStatus::Leased
                        && current.lease_owner.as_deref() == Some(worker_id)
                        && current.updated_at == item.updated_at =>
                {
                    apply(&mut current, now);
                    let bytes = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
                    table
                        .insert(key.as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    AckOutcome::Acked
                }
                _ => {
                    debug!(scope = %key, worker = worker_id, "stale ack ignored");
                    AckOutcome::Stale
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    // ── Maintenance & introspection ────────────────────────────────

    /// Return expired leases to `ready`. Returns the number reclaimed.
    pub fn reclaim_expired(&self) -> QueueResult<u32> {
        let now = Utc::now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut reclaimed = 0;
        {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            let mut expired: Vec<WorkItem> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let item: WorkItem =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if item.status == ItemStatus::Leased
                    && item.lease_expires_at.is_some_and(|exp| exp < now)
                {
                    expired.push(item);
                }
            }
            for mut item in expired {
                warn!(scope = %item.scope_key(), owner = ?item.lease_owner, "reclaiming expired lease");
                item.status = ItemStatus::Ready;
                item.lease_owner = None;
                item.lease_expires_at = None;
                item.updated_at = now;
                let key = item.scope_key();
                let bytes = serde_json::to_vec(&item).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                reclaimed += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(reclaimed)
    }

    /// Fetch the current row for a scope, regardless of status.
    pub fn get(
        &self,
        workspace_id: &str,
        kind: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> QueueResult<Option<WorkItem>> {
        let key = scope_key(workspace_id, kind, scope_type, scope_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Number of items currently in `ready` status.
    pub fn len_ready(&self) -> QueueResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: WorkItem =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if item.status == ItemStatus::Ready {
                count += 1;
            }
        }
        Ok(count)
    }
}
