//! Jobs, approvals, and verification records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{ReleaseId, VersionId};

// ── Approvals ──────────────────────────────────────────────────────

/// A user's approve/reject decision for a version. Unique per
/// `(version_id, user_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserApprovalRecord {
    pub version_id: VersionId,
    pub user_id: String,
    pub status: ApprovalStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

// ── Jobs ───────────────────────────────────────────────────────────

/// The externally-executed unit of convergence. This core only
/// dispatches jobs; agents run them and report status back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub release_id: ReleaseId,
    pub job_agent_id: Option<String>,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Successful,
    Failure,
    Cancelled,
    ActionRequired,
    InvalidIntegration,
}

impl JobStatus {
    /// Whether the job reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful
                | JobStatus::Failure
                | JobStatus::Cancelled
                | JobStatus::InvalidIntegration
        )
    }
}

// ── Verification ───────────────────────────────────────────────────

/// A verification attached to a job, made of one or more metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobVerification {
    pub id: String,
    pub job_id: String,
    pub status: VerificationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

/// One time-series probe within a verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationMetric {
    pub id: String,
    pub job_verification_id: String,
    pub name: String,
    /// Provider config, e.g. `{"type": "prometheus", "address": ...}`.
    pub provider: serde_json::Value,
    pub interval_seconds: u64,
    /// Number of measurements to take.
    pub count: u32,
    pub success_condition: String,
    pub success_threshold: Option<u32>,
    pub failure_condition: Option<String>,
    pub failure_threshold: Option<u32>,
}

/// One sample produced by a metric provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub id: String,
    pub metric_id: String,
    pub measured_at: DateTime<Utc>,
    pub data: serde_json::Value,
    pub status: MeasurementStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementStatus {
    Passed,
    Failed,
    Inconclusive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_job_statuses() {
        assert!(JobStatus::Successful.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::ActionRequired.is_terminal());
    }

    #[test]
    fn approval_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ApprovalStatus::Approved).unwrap(),
            "\"approved\""
        );
    }
}
