//! Release-target gRPC server.
//!
//! Implements the `ReleaseTargetService` interface. Entities arrive as
//! JSON documents; malformed documents reject the whole request with
//! `InvalidArgument` rather than silently dropping targets.

use capstan_core::{Deployment, Environment, ReleaseTarget, Resource};
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::proto;
use crate::proto::release_target_service_server::ReleaseTargetService;

/// gRPC implementation of the release-target service.
#[derive(Debug, Default)]
pub struct ReleaseTargetServer;

impl ReleaseTargetServer {
    pub fn new() -> Self {
        Self
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(
        self,
    ) -> proto::release_target_service_server::ReleaseTargetServiceServer<Self> {
        proto::release_target_service_server::ReleaseTargetServiceServer::new(self)
    }
}

/// Compute release targets for a fixed entity universe.
///
/// A target `(resource, environment, deployment)` exists when the
/// deployment belongs to the environment's system, the environment's
/// resource selector matches the resource, and the deployment's
/// selector (when present) also matches. An environment without a
/// selector yields no targets; a deployment without one takes every
/// resource the environment matched. A selector that fails to compile
/// matches nothing.
pub fn compute_targets(
    resources: &[Resource],
    environments: &[Environment],
    deployments: &[Deployment],
) -> Vec<ReleaseTarget> {
    let docs: Vec<serde_json::Value> = resources.iter().map(Resource::selector_doc).collect();

    let mut targets = Vec::new();
    for environment in environments {
        let Some(selector) = &environment.resource_selector else {
            continue;
        };
        let env_program = match selector.compile() {
            Ok(program) => program,
            Err(e) => {
                warn!(environment = %environment.id, error = %e, "environment selector failed to compile");
                continue;
            }
        };

        let env_matched: Vec<usize> = resources
            .iter()
            .enumerate()
            .filter(|(i, r)| {
                r.workspace_id == environment.workspace_id && env_program.matches(&docs[*i])
            })
            .map(|(i, _)| i)
            .collect();

        for deployment in deployments {
            if deployment.system_id != environment.system_id {
                continue;
            }
            let dep_program = match &deployment.resource_selector {
                None => None,
                Some(selector) => match selector.compile() {
                    Ok(program) => Some(program),
                    Err(e) => {
                        warn!(deployment = %deployment.id, error = %e, "deployment selector failed to compile");
                        continue;
                    }
                },
            };
            for &i in &env_matched {
                if dep_program.as_ref().is_none_or(|p| p.matches(&docs[i])) {
                    targets.push(ReleaseTarget {
                        resource_id: resources[i].id.clone(),
                        environment_id: environment.id.clone(),
                        deployment_id: deployment.id.clone(),
                    });
                }
            }
        }
    }
    targets
}

fn parse_entities<T: serde::de::DeserializeOwned>(
    docs: &[String],
    what: &str,
) -> Result<Vec<T>, Status> {
    docs.iter()
        .map(|doc| {
            serde_json::from_str(doc)
                .map_err(|e| Status::invalid_argument(format!("invalid {what} document: {e}")))
        })
        .collect()
}

#[tonic::async_trait]
impl ReleaseTargetService for ReleaseTargetServer {
    async fn compute(
        &self,
        request: Request<proto::ComputeRequest>,
    ) -> Result<Response<proto::ComputeResponse>, Status> {
        let req = request.into_inner();

        let resources: Vec<Resource> = parse_entities(&req.resources, "resource")?;
        let environments: Vec<Environment> = parse_entities(&req.environments, "environment")?;
        let deployments: Vec<Deployment> = parse_entities(&req.deployments, "deployment")?;

        let targets = compute_targets(&resources, &environments, &deployments);
        debug!(
            resources = resources.len(),
            environments = environments.len(),
            deployments = deployments.len(),
            targets = targets.len(),
            "computed release targets"
        );

        let release_targets = targets
            .into_iter()
            .map(|t| proto::ReleaseTarget {
                id: t.key(),
                resource_id: t.resource_id,
                environment_id: t.environment_id,
                deployment_id: t.deployment_id,
            })
            .collect();

        Ok(Response::new(proto::ComputeResponse { release_targets }))
    }
}
