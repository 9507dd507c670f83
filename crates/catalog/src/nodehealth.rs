//! Node health controller.
//!
//! Folds the `HealthStatus` resources owned by a node into one verdict and
//! records it as the node's `Healthy` condition. The write is skipped when
//! the stored condition already matches the node's current generation.

use regent_controller::{map_owner_filter_by_type, Controller, Reconciler, Request, Runtime};
use regent_core::{Condition, ConditionState, Resource, ResourceId, Status};
use regent_service::{ApiError, ApiResult, Context, WriteStatusRequest};
use tracing::{debug, error, trace};

use crate::types::{health_status_type, node_type, Health, HealthStatus};

pub const CONTROLLER_NAME: &str = "node-health";
pub const STATUS_KEY: &str = "Healthy";
pub const STATUS_CONDITION_HEALTHY: &str = "Healthy";

pub const NODE_HEALTHY_MESSAGE: &str = "All node health checks are passing";
pub const NODE_UNHEALTHY_MESSAGE: &str = "One or more node health checks are not passing";

/// Manages nodes; a mutation of a health status re-reconciles its node.
pub fn node_health_controller() -> Controller {
    Controller::new(CONTROLLER_NAME, node_type())
        .with_watch(health_status_type(), map_owner_filter_by_type(node_type()))
        .with_reconciler(NodeHealthReconciler)
}

/// Worst health among the checks owned by `node`; `Passing` when it has none.
///
/// On error the returned health is `Critical` and must not be trusted on its
/// own: the caller decides whether the error matters.
pub async fn get_node_health(ctx: &Context, rt: &Runtime, node: &ResourceId) -> (Health, ApiResult<()>) {
    let owned = match rt.client.list_by_owner(ctx, node).await {
        Ok(owned) => owned,
        Err(e) => return (Health::Critical, Err(e)),
    };
    match aggregate(&owned) {
        Ok(health) => (health, Ok(())),
        Err(e) => (Health::Critical, Err(e)),
    }
}

fn aggregate(owned: &[Resource]) -> ApiResult<Health> {
    let hs_type = health_status_type();
    let mut health = Health::Passing;
    for res in owned.iter().filter(|r| r.id.ty.same_kind(&hs_type)) {
        let hs: HealthStatus = res
            .decode()
            .map_err(|e| ApiError::Internal(format!("decoding health status {}: {e}", res.id)))?;
        health = health.max(hs.status);
    }
    Ok(health)
}

pub fn health_condition(health: Health) -> Condition {
    let (state, message) = if health == Health::Passing {
        (ConditionState::True, NODE_HEALTHY_MESSAGE)
    } else {
        (ConditionState::False, NODE_UNHEALTHY_MESSAGE)
    };
    Condition {
        ty: STATUS_CONDITION_HEALTHY.to_string(),
        state,
        reason: health.reason().to_string(),
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeHealthReconciler;

#[async_trait::async_trait]
impl Reconciler for NodeHealthReconciler {
    async fn reconcile(&self, ctx: &Context, rt: &Runtime, req: Request) -> anyhow::Result<()> {
        let node = match rt.client.read(ctx, &req.id).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                trace!(node = %req.id, "node not found; nothing to reconcile");
                return Ok(());
            }
            Err(e) => {
                error!(node = %req.id, error = %e, "failed to read node");
                return Err(e.into());
            }
        };

        let (health, res) = get_node_health(ctx, rt, &node.id).await;
        if let Err(e) = res {
            error!(node = %node.id, error = %e, "failed to compute node health");
            return Err(e.into());
        }

        let status = Status {
            observed_generation: node.generation,
            conditions: std::iter::once(health_condition(health)).collect(),
        };
        if node.status.get(STATUS_KEY) == Some(&status) {
            trace!(node = %node.id, %health, "node health status already up to date");
            return Ok(());
        }

        let req = WriteStatusRequest {
            id: node.id.clone(),
            version: node.version.clone(),
            key: STATUS_KEY.to_string(),
            status,
        };
        if let Err(e) = rt.client.write_status(ctx, req).await {
            error!(node = %node.id, error = %e, "failed to write node health status");
            return Err(e.into());
        }
        debug!(node = %node.id, %health, "node health status updated");
        Ok(())
    }
}
