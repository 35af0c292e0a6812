//! Verification reconcile loop.
//!
//! Each tick handles one metric: gate on the measurement interval,
//! invoke the provider once, classify the result document against the
//! metric's conditions, and decide whether the metric is terminal.
//! The provider runs at most `count` times per metric.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use capstan_core::job::{
    Measurement, MeasurementStatus, VerificationMetric, VerificationStatus,
};
use capstan_selector::Selector;
use capstan_store::Store;

use crate::error::{VerifyError, VerifyResult};
use crate::provider::Provider;

/// What the caller should do with this metric next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The metric reached a terminal classification.
    Completed(VerificationStatus),
    /// Reconcile again no earlier than the given instant.
    RequeueAt(DateTime<Utc>),
}

/// Drives verification metrics to a terminal classification.
pub struct VerificationScheduler<'a> {
    store: &'a Store,
}

impl<'a> VerificationScheduler<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn reconcile(
        &self,
        metric_id: &str,
        now: DateTime<Utc>,
    ) -> VerifyResult<ReconcileOutcome> {
        let metric = self
            .store
            .get_metric(metric_id)?
            .ok_or_else(|| VerifyError::MetricNotFound(metric_id.to_string()))?;
        let measurements = self.store.list_measurements(metric_id)?;

        if let Some(status) = terminal_status(&metric, &measurements) {
            self.complete(&metric, status)?;
            return Ok(ReconcileOutcome::Completed(status));
        }

        if let Some(last) = measurements.last() {
            let next_due = last.measured_at + Duration::seconds(metric.interval_seconds as i64);
            if now < next_due {
                return Ok(ReconcileOutcome::RequeueAt(next_due));
            }
        }

        let provider = Provider::from_config(&metric.provider)?;
        let scope = self.scope_doc(&metric)?;
        let data = provider.measure(&scope, now).await;
        let (status, message) = classify(&metric, &data);
        debug!(metric = %metric.id, ?status, %message, "measurement classified");

        self.store.append_measurement(&Measurement {
            id: format!("m-{}", measurements.len() + 1),
            metric_id: metric.id.clone(),
            measured_at: now,
            data,
            status,
            message,
        })?;

        let measurements = self.store.list_measurements(metric_id)?;
        if let Some(status) = terminal_status(&metric, &measurements) {
            self.complete(&metric, status)?;
            return Ok(ReconcileOutcome::Completed(status));
        }
        Ok(ReconcileOutcome::RequeueAt(
            now + Duration::seconds(metric.interval_seconds as i64),
        ))
    }

    /// Fold this metric's terminal status into its parent verification:
    /// any failed metric fails the verification; it passes once every
    /// metric terminates passed.
    fn complete(&self, metric: &VerificationMetric, status: VerificationStatus) -> VerifyResult<()> {
        info!(metric = %metric.id, ?status, "verification metric completed");
        let Some(mut verification) = self.store.get_verification(&metric.job_verification_id)?
        else {
            return Ok(());
        };

        let mut all_passed = true;
        let mut any_failed = status == VerificationStatus::Failed;
        for sibling in self
            .store
            .list_metrics_for_verification(&verification.id)?
        {
            let terminal = terminal_status(&sibling, &self.store.list_measurements(&sibling.id)?);
            match terminal {
                Some(VerificationStatus::Failed) => any_failed = true,
                Some(VerificationStatus::Passed) => {}
                _ => all_passed = false,
            }
        }

        verification.status = if any_failed {
            VerificationStatus::Failed
        } else if all_passed {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Running
        };
        self.store.put_verification(&verification)?;
        Ok(())
    }

    /// Template scope for provider configs: the release's variables and
    /// target, plus the job's identity. Broken links degrade to an
    /// empty scope rather than failing the measurement.
    fn scope_doc(&self, metric: &VerificationMetric) -> VerifyResult<serde_json::Value> {
        let Some(verification) = self.store.get_verification(&metric.job_verification_id)? else {
            return Ok(serde_json::json!({}));
        };
        let Some(job) = self.store.get_job(&verification.job_id)? else {
            return Ok(serde_json::json!({}));
        };
        let Some(release) = self.store.get_release_by_id(&job.release_id)? else {
            return Ok(serde_json::json!({}));
        };
        Ok(serde_json::json!({
            "variables": release.variables,
            "target": {
                "resourceId": release.target.resource_id,
                "environmentId": release.target.environment_id,
                "deploymentId": release.target.deployment_id,
            },
            "job": { "id": job.id, "status": job.status },
        }))
    }
}

/// Classify one result document against the metric's conditions.
pub fn classify(
    metric: &VerificationMetric,
    data: &serde_json::Value,
) -> (MeasurementStatus, String) {
    let doc = serde_json::json!({ "result": data });

    match eval_condition(&metric.success_condition, &doc) {
        Some(true) => {
            return (MeasurementStatus::Passed, "success condition matched".into());
        }
        Some(false) => {}
        None => {
            return (
                MeasurementStatus::Inconclusive,
                "success condition did not evaluate".into(),
            );
        }
    }

    match &metric.failure_condition {
        Some(condition) => match eval_condition(condition, &doc) {
            Some(true) => (MeasurementStatus::Failed, "failure condition matched".into()),
            Some(false) => (
                MeasurementStatus::Inconclusive,
                "neither condition matched".into(),
            ),
            None => (
                MeasurementStatus::Inconclusive,
                "failure condition did not evaluate".into(),
            ),
        },
        None => (MeasurementStatus::Failed, "success condition not met".into()),
    }
}

fn eval_condition(condition: &str, doc: &serde_json::Value) -> Option<bool> {
    let program = Selector::Cel(condition.to_string()).compile().ok()?;
    match program.eval(doc) {
        Ok(serde_json::Value::Bool(b)) => Some(b),
        _ => None,
    }
}

/// Terminal classification, if any, from the measurements so far.
pub fn terminal_status(
    metric: &VerificationMetric,
    measurements: &[Measurement],
) -> Option<VerificationStatus> {
    let passed = measurements
        .iter()
        .filter(|m| m.status == MeasurementStatus::Passed)
        .count() as u32;
    let failed = measurements
        .iter()
        .filter(|m| m.status == MeasurementStatus::Failed)
        .count() as u32;
    let total = measurements.len() as u32;

    if failed >= metric.failure_threshold.unwrap_or(1) {
        return Some(VerificationStatus::Failed);
    }
    match metric.success_threshold {
        Some(threshold) if passed >= threshold => return Some(VerificationStatus::Passed),
        None if total >= metric.count && passed == total => {
            return Some(VerificationStatus::Passed);
        }
        _ => {}
    }
    // Measurement budget exhausted without a verdict.
    if total >= metric.count {
        return Some(VerificationStatus::Failed);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::job::JobVerification;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn metric(id: &str, count: u32, success_condition: &str) -> VerificationMetric {
        VerificationMetric {
            id: id.into(),
            job_verification_id: "verif-1".into(),
            name: "probe".into(),
            provider: serde_json::json!({"type": "sleep"}),
            interval_seconds: 60,
            count,
            success_condition: success_condition.into(),
            success_threshold: None,
            failure_condition: None,
            failure_threshold: None,
        }
    }

    fn seed(store: &Store, metric: &VerificationMetric) {
        store
            .put_verification(&JobVerification {
                id: "verif-1".into(),
                job_id: "job-1".into(),
                status: VerificationStatus::Running,
                created_at: t0(),
            })
            .unwrap();
        store.put_metric(metric).unwrap();
    }

    #[tokio::test]
    async fn three_passing_measurements_complete_passed() {
        let store = Store::open_in_memory().unwrap();
        let m = metric("met-1", 3, "result.ok == true");
        seed(&store, &m);

        let scheduler = VerificationScheduler::new(&store);
        let mut now = t0();
        for _ in 0..2 {
            let outcome = scheduler.reconcile("met-1", now).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::RequeueAt(now + Duration::seconds(60)));
            now += Duration::seconds(60);
        }
        let outcome = scheduler.reconcile("met-1", now).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Completed(VerificationStatus::Passed)
        );

        assert_eq!(store.list_measurements("met-1").unwrap().len(), 3);
        let verification = store.get_verification("verif-1").unwrap().unwrap();
        assert_eq!(verification.status, VerificationStatus::Passed);
    }

    #[tokio::test]
    async fn interval_gates_without_measuring() {
        let store = Store::open_in_memory().unwrap();
        let m = metric("met-1", 3, "result.ok == true");
        seed(&store, &m);

        let scheduler = VerificationScheduler::new(&store);
        scheduler.reconcile("met-1", t0()).await.unwrap();
        let outcome = scheduler
            .reconcile("met-1", t0() + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAt(t0() + Duration::seconds(60))
        );
        assert_eq!(store.list_measurements("met-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn single_failure_is_terminal_without_threshold() {
        let store = Store::open_in_memory().unwrap();
        let m = metric("met-1", 3, "result.ok == false");
        seed(&store, &m);

        let scheduler = VerificationScheduler::new(&store);
        let outcome = scheduler.reconcile("met-1", t0()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Completed(VerificationStatus::Failed)
        );
        let verification = store.get_verification("verif-1").unwrap().unwrap();
        assert_eq!(verification.status, VerificationStatus::Failed);
    }

    #[tokio::test]
    async fn failure_threshold_tolerates_earlier_failures() {
        let store = Store::open_in_memory().unwrap();
        let mut m = metric("met-1", 5, "result.ok == false");
        m.failure_threshold = Some(2);
        seed(&store, &m);

        let scheduler = VerificationScheduler::new(&store);
        let outcome = scheduler.reconcile("met-1", t0()).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::RequeueAt(_)));

        let outcome = scheduler
            .reconcile("met-1", t0() + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Completed(VerificationStatus::Failed)
        );
    }

    #[tokio::test]
    async fn success_threshold_short_circuits() {
        let store = Store::open_in_memory().unwrap();
        let mut m = metric("met-1", 5, "result.ok == true");
        m.success_threshold = Some(1);
        seed(&store, &m);

        let scheduler = VerificationScheduler::new(&store);
        let outcome = scheduler.reconcile("met-1", t0()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Completed(VerificationStatus::Passed)
        );
    }

    #[tokio::test]
    async fn unknown_metric_errors() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = VerificationScheduler::new(&store);
        assert!(matches!(
            scheduler.reconcile("nope", t0()).await,
            Err(VerifyError::MetricNotFound(_))
        ));
    }

    #[test]
    fn classify_uses_failure_condition() {
        let mut m = metric("met-1", 3, "result.value > 0.9");
        m.failure_condition = Some("result.value < 0.5".into());

        let (status, _) = classify(&m, &serde_json::json!({"value": 0.95}));
        assert_eq!(status, MeasurementStatus::Passed);

        let (status, _) = classify(&m, &serde_json::json!({"value": 0.3}));
        assert_eq!(status, MeasurementStatus::Failed);

        // Between the two conditions: inconclusive.
        let (status, _) = classify(&m, &serde_json::json!({"value": 0.7}));
        assert_eq!(status, MeasurementStatus::Inconclusive);
    }

    #[test]
    fn exhausted_budget_without_verdict_fails() {
        let mut m = metric("met-1", 2, "result.ok == true");
        m.failure_condition = Some("result.fatal == true".into());
        // Two inconclusive measurements use up the budget.
        let measurements: Vec<Measurement> = (0..2)
            .map(|i| Measurement {
                id: format!("m-{i}"),
                metric_id: "met-1".into(),
                measured_at: t0(),
                data: serde_json::json!({}),
                status: MeasurementStatus::Inconclusive,
                message: String::new(),
            })
            .collect();
        assert_eq!(
            terminal_status(&m, &measurements),
            Some(VerificationStatus::Failed)
        );
        assert_eq!(terminal_status(&m, &measurements[..1]), None);
    }
}
