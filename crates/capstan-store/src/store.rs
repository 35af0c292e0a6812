//! Store — typed CRUD over redb tables.
//!
//! Every mutation runs in its own write transaction; reads use read
//! transactions. Composite string keys give cheap prefix scans for
//! per-workspace and per-deployment listings.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use capstan_core::*;

use crate::error::{StoreError, StoreResult};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe entity store backed by redb.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "entity store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            WORKSPACES,
            SYSTEMS,
            RESOURCES,
            ENVIRONMENTS,
            DEPLOYMENTS,
            VERSIONS,
            RELEASES,
            RELEASE_HISTORY,
            RELEASE_INDEX,
            DEPLOYMENT_VARIABLES,
            DEPLOYMENT_VARIABLE_VALUES,
            RESOURCE_VARIABLES,
            POLICIES,
            APPROVALS,
            JOBS,
            VERIFICATIONS,
            VERIFICATION_METRICS,
            MEASUREMENTS,
            COMPUTED_TARGETS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_value<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_value<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete_value(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn scan_prefix<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn scan_all<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> StoreResult<Vec<T>> {
        self.scan_prefix(table, "")
    }

    // ── Workspaces & systems ───────────────────────────────────────

    pub fn put_workspace(&self, ws: &Workspace) -> StoreResult<()> {
        self.put_value(WORKSPACES, &ws.id, ws)
    }

    pub fn get_workspace(&self, id: &str) -> StoreResult<Option<Workspace>> {
        self.get_value(WORKSPACES, id)
    }

    pub fn put_system(&self, system: &System) -> StoreResult<()> {
        let key = format!("{}/{}", system.workspace_id, system.id);
        self.put_value(SYSTEMS, &key, system)
    }

    pub fn get_system(&self, workspace_id: &str, id: &str) -> StoreResult<Option<System>> {
        self.get_value(SYSTEMS, &format!("{workspace_id}/{id}"))
    }

    pub fn list_systems(&self, workspace_id: &str) -> StoreResult<Vec<System>> {
        self.scan_prefix(SYSTEMS, &format!("{workspace_id}/"))
    }

    // ── Resources ──────────────────────────────────────────────────

    pub fn put_resource(&self, resource: &Resource) -> StoreResult<()> {
        let key = format!("{}/{}", resource.workspace_id, resource.id);
        self.put_value(RESOURCES, &key, resource)?;
        debug!(resource = %resource.id, "resource stored");
        Ok(())
    }

    pub fn get_resource(&self, workspace_id: &str, id: &str) -> StoreResult<Option<Resource>> {
        self.get_value(RESOURCES, &format!("{workspace_id}/{id}"))
    }

    pub fn delete_resource(&self, workspace_id: &str, id: &str) -> StoreResult<bool> {
        self.delete_value(RESOURCES, &format!("{workspace_id}/{id}"))
    }

    pub fn list_resources(&self, workspace_id: &str) -> StoreResult<Vec<Resource>> {
        self.scan_prefix(RESOURCES, &format!("{workspace_id}/"))
    }

    /// Look up a resource by its natural key.
    pub fn find_resource(
        &self,
        workspace_id: &str,
        kind: &str,
        identifier: &str,
    ) -> StoreResult<Option<Resource>> {
        let all = self.list_resources(workspace_id)?;
        Ok(all
            .into_iter()
            .find(|r| r.kind == kind && r.identifier == identifier))
    }

    // ── Environments & deployments ─────────────────────────────────

    pub fn put_environment(&self, env: &Environment) -> StoreResult<()> {
        let key = format!("{}/{}", env.workspace_id, env.id);
        self.put_value(ENVIRONMENTS, &key, env)
    }

    pub fn get_environment(&self, workspace_id: &str, id: &str) -> StoreResult<Option<Environment>> {
        self.get_value(ENVIRONMENTS, &format!("{workspace_id}/{id}"))
    }

    pub fn list_environments(&self, workspace_id: &str) -> StoreResult<Vec<Environment>> {
        self.scan_prefix(ENVIRONMENTS, &format!("{workspace_id}/"))
    }

    pub fn list_environments_for_system(
        &self,
        workspace_id: &str,
        system_id: &str,
    ) -> StoreResult<Vec<Environment>> {
        let all = self.list_environments(workspace_id)?;
        Ok(all.into_iter().filter(|e| e.system_id == system_id).collect())
    }

    pub fn put_deployment(&self, deployment: &Deployment) -> StoreResult<()> {
        let key = format!("{}/{}", deployment.workspace_id, deployment.id);
        self.put_value(DEPLOYMENTS, &key, deployment)
    }

    pub fn get_deployment(&self, workspace_id: &str, id: &str) -> StoreResult<Option<Deployment>> {
        self.get_value(DEPLOYMENTS, &format!("{workspace_id}/{id}"))
    }

    pub fn list_deployments(&self, workspace_id: &str) -> StoreResult<Vec<Deployment>> {
        self.scan_prefix(DEPLOYMENTS, &format!("{workspace_id}/"))
    }

    pub fn list_deployments_for_system(
        &self,
        workspace_id: &str,
        system_id: &str,
    ) -> StoreResult<Vec<Deployment>> {
        let all = self.list_deployments(workspace_id)?;
        Ok(all.into_iter().filter(|d| d.system_id == system_id).collect())
    }

    // ── Versions ───────────────────────────────────────────────────

    pub fn put_version(&self, version: &DeploymentVersion) -> StoreResult<()> {
        let key = format!("{}/{}", version.deployment_id, version.id);
        self.put_value(VERSIONS, &key, version)
    }

    pub fn get_version(
        &self,
        deployment_id: &str,
        id: &str,
    ) -> StoreResult<Option<DeploymentVersion>> {
        self.get_value(VERSIONS, &format!("{deployment_id}/{id}"))
    }

    /// Versions of a deployment, newest first, at most `limit`.
    pub fn list_versions(
        &self,
        deployment_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<DeploymentVersion>> {
        let mut versions: Vec<DeploymentVersion> =
            self.scan_prefix(VERSIONS, &format!("{deployment_id}/"))?;
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        versions.truncate(limit);
        Ok(versions)
    }

    // ── Releases ───────────────────────────────────────────────────

    /// Persist a release as the current desired state for its target.
    /// Also records it in the per-version history (for the paused
    /// grandfather check) and the id index (for job joins).
    pub fn put_release(&self, release: &Release) -> StoreResult<()> {
        let target_key = release.target.key();
        self.put_value(RELEASES, &target_key, release)?;
        self.put_value(
            RELEASE_HISTORY,
            &format!("{target_key}/{}", release.version_id),
            release,
        )?;
        self.put_value(RELEASE_INDEX, &release.id, release)?;
        debug!(release = %release.id, target = %target_key, "release stored");
        Ok(())
    }

    /// Current desired release for a target.
    pub fn get_release(&self, target: &ReleaseTarget) -> StoreResult<Option<Release>> {
        self.get_value(RELEASES, &target.key())
    }

    /// Whether a release of the given version was ever recorded for the
    /// exact target.
    pub fn get_release_for_version(
        &self,
        target: &ReleaseTarget,
        version_id: &str,
    ) -> StoreResult<Option<Release>> {
        self.get_value(RELEASE_HISTORY, &format!("{}/{version_id}", target.key()))
    }

    pub fn get_release_by_id(&self, release_id: &str) -> StoreResult<Option<Release>> {
        self.get_value(RELEASE_INDEX, release_id)
    }

    /// Remove the current release for a target. History is kept.
    pub fn delete_release(&self, target: &ReleaseTarget) -> StoreResult<bool> {
        self.delete_value(RELEASES, &target.key())
    }

    /// All current releases. Used by cooldown and progression rules,
    /// which filter by deployment/environment.
    pub fn list_releases(&self) -> StoreResult<Vec<Release>> {
        self.scan_all(RELEASES)
    }

    // ── Variables ──────────────────────────────────────────────────

    pub fn put_deployment_variable(&self, var: &DeploymentVariable) -> StoreResult<()> {
        let key = format!("{}/{}", var.deployment_id, var.key);
        self.put_value(DEPLOYMENT_VARIABLES, &key, var)
    }

    pub fn list_deployment_variables(
        &self,
        deployment_id: &str,
    ) -> StoreResult<Vec<DeploymentVariable>> {
        self.scan_prefix(DEPLOYMENT_VARIABLES, &format!("{deployment_id}/"))
    }

    pub fn put_deployment_variable_value(
        &self,
        value: &DeploymentVariableValue,
    ) -> StoreResult<()> {
        let key = format!("{}/{}", value.deployment_variable_id, value.id);
        self.put_value(DEPLOYMENT_VARIABLE_VALUES, &key, value)
    }

    pub fn list_variable_values(
        &self,
        deployment_variable_id: &str,
    ) -> StoreResult<Vec<DeploymentVariableValue>> {
        self.scan_prefix(
            DEPLOYMENT_VARIABLE_VALUES,
            &format!("{deployment_variable_id}/"),
        )
    }

    pub fn put_resource_variable(&self, var: &ResourceVariable) -> StoreResult<()> {
        let key = format!("{}/{}", var.resource_id, var.key);
        self.put_value(RESOURCE_VARIABLES, &key, var)
    }

    pub fn get_resource_variable(
        &self,
        resource_id: &str,
        key: &str,
    ) -> StoreResult<Option<ResourceVariable>> {
        self.get_value(RESOURCE_VARIABLES, &format!("{resource_id}/{key}"))
    }

    // ── Policies & approvals ───────────────────────────────────────

    pub fn put_policy(&self, policy: &Policy) -> StoreResult<()> {
        let key = format!("{}/{}", policy.workspace_id, policy.id);
        self.put_value(POLICIES, &key, policy)
    }

    pub fn list_policies(&self, workspace_id: &str) -> StoreResult<Vec<Policy>> {
        self.scan_prefix(POLICIES, &format!("{workspace_id}/"))
    }

    /// Upsert an approval record; unique per `(version_id, user_id)`,
    /// so re-submission overwrites the previous decision.
    pub fn put_approval(&self, record: &UserApprovalRecord) -> StoreResult<()> {
        let key = format!("{}/{}", record.version_id, record.user_id);
        self.put_value(APPROVALS, &key, record)
    }

    pub fn list_approvals(&self, version_id: &str) -> StoreResult<Vec<UserApprovalRecord>> {
        self.scan_prefix(APPROVALS, &format!("{version_id}/"))
    }

    pub fn count_approved(&self, version_id: &str) -> StoreResult<u32> {
        let records = self.list_approvals(version_id)?;
        Ok(records
            .iter()
            .filter(|r| r.status == ApprovalStatus::Approved)
            .count() as u32)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn put_job(&self, job: &Job) -> StoreResult<()> {
        self.put_value(JOBS, &job.id, job)
    }

    pub fn get_job(&self, id: &str) -> StoreResult<Option<Job>> {
        self.get_value(JOBS, id)
    }

    pub fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        self.scan_all(JOBS)
    }

    pub fn list_jobs_for_release(&self, release_id: &str) -> StoreResult<Vec<Job>> {
        let all = self.list_jobs()?;
        Ok(all.into_iter().filter(|j| j.release_id == release_id).collect())
    }

    /// Update a job's status, bumping `updated_at`.
    pub fn set_job_status(&self, id: &str, status: JobStatus) -> StoreResult<Job> {
        let mut job = self
            .get_job(id)?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job.status = status;
        job.updated_at = chrono::Utc::now();
        self.put_job(&job)?;
        Ok(job)
    }

    // ── Verification ───────────────────────────────────────────────

    pub fn put_verification(&self, verification: &JobVerification) -> StoreResult<()> {
        self.put_value(VERIFICATIONS, &verification.id, verification)
    }

    pub fn get_verification(&self, id: &str) -> StoreResult<Option<JobVerification>> {
        self.get_value(VERIFICATIONS, id)
    }

    pub fn put_metric(&self, metric: &VerificationMetric) -> StoreResult<()> {
        self.put_value(VERIFICATION_METRICS, &metric.id, metric)
    }

    pub fn get_metric(&self, id: &str) -> StoreResult<Option<VerificationMetric>> {
        self.get_value(VERIFICATION_METRICS, id)
    }

    pub fn list_metrics_for_verification(
        &self,
        job_verification_id: &str,
    ) -> StoreResult<Vec<VerificationMetric>> {
        let all: Vec<VerificationMetric> = self.scan_all(VERIFICATION_METRICS)?;
        Ok(all
            .into_iter()
            .filter(|m| m.job_verification_id == job_verification_id)
            .collect())
    }

    /// Append a measurement. Keys embed the timestamp so a prefix scan
    /// returns them ordered by `measured_at`.
    pub fn append_measurement(&self, measurement: &Measurement) -> StoreResult<()> {
        let key = format!(
            "{}/{:020}/{}",
            measurement.metric_id,
            measurement.measured_at.timestamp_millis(),
            measurement.id,
        );
        self.put_value(MEASUREMENTS, &key, measurement)
    }

    pub fn list_measurements(&self, metric_id: &str) -> StoreResult<Vec<Measurement>> {
        self.scan_prefix(MEASUREMENTS, &format!("{metric_id}/"))
    }

    // ── Computed target sets ───────────────────────────────────────

    /// Last computed matching resource set for `(deployment, environment)`.
    pub fn get_computed_targets(
        &self,
        deployment_id: &str,
        environment_id: &str,
    ) -> StoreResult<Vec<ResourceId>> {
        Ok(self
            .get_value(COMPUTED_TARGETS, &format!("{deployment_id}/{environment_id}"))?
            .unwrap_or_default())
    }

    pub fn put_computed_targets(
        &self,
        deployment_id: &str,
        environment_id: &str,
        resource_ids: &[ResourceId],
    ) -> StoreResult<()> {
        self.put_value(
            COMPUTED_TARGETS,
            &format!("{deployment_id}/{environment_id}"),
            &resource_ids,
        )
    }
}
