//! Work item row model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ready,
    Leased,
    Done,
    DeadLetter,
}

/// One coalesced unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: u64,
    pub workspace_id: String,
    pub kind: String,
    pub scope_type: String,
    pub scope_id: String,
    /// Timestamp of the newest event folded into this item.
    pub event_ts: DateTime<Utc>,
    pub priority: i32,
    /// Earliest instant the item may be claimed.
    pub not_before: DateTime<Utc>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every mutation; claim hands it out as the ack token.
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Coalescing key: at most one ready-or-leased row exists per key.
    pub fn scope_key(&self) -> String {
        scope_key(&self.workspace_id, &self.kind, &self.scope_type, &self.scope_id)
    }
}

/// Build the coalescing key for a scope. `|` cannot appear in ids, so
/// the key is unambiguous even when scope ids contain `:`.
pub(crate) fn scope_key(workspace_id: &str, kind: &str, scope_type: &str, scope_id: &str) -> String {
    format!("{workspace_id}|{kind}|{scope_type}|{scope_id}")
}
