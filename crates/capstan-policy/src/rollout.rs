//! Gradual rollout pacing.
//!
//! Every matching resource gets a deterministic position: the rank of
//! `sha256(resourceId || versionId)` among all matching resources.
//! The position maps to a wall-clock eligibility offset from the
//! rollout start via a pacing curve, so the released fraction is
//! non-decreasing over time and a target that becomes eligible stays
//! eligible.

use capstan_core::entities::ResourceId;
use capstan_core::hash::rollout_hash;
use capstan_core::policy::RolloutCurve;
use chrono::{DateTime, Duration, Utc};

/// Deterministic `(position, total)` of a resource among its peers for
/// a given version. `None` if the resource is not in the peer set.
pub fn position(
    resource_id: &str,
    version_id: &str,
    peers: &[ResourceId],
) -> Option<(usize, usize)> {
    let mut ranked: Vec<(&str, [u8; 32])> = peers
        .iter()
        .map(|id| (id.as_str(), rollout_hash(id, version_id)))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)));
    ranked
        .iter()
        .position(|(id, _)| *id == resource_id)
        .map(|pos| (pos, ranked.len()))
}

/// Wall-clock instant at which the target at `position` becomes
/// eligible.
pub fn eligible_at(
    start: DateTime<Utc>,
    position: usize,
    total: usize,
    time_scale_interval_seconds: u64,
    curve: RolloutCurve,
) -> DateTime<Utc> {
    let interval = time_scale_interval_seconds as f64;
    let offset_seconds = match curve {
        RolloutCurve::Linear => position as f64 * interval,
        RolloutCurve::Exponential => {
            let n = total.max(1) as f64;
            interval * (1.0 - (-(position as f64) / n).exp())
        }
    };
    start + Duration::milliseconds((offset_seconds * 1000.0) as i64)
}
