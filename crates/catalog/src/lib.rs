//! Regent catalog.
//!
//! Resource types describing nodes and their health checks, plus the node
//! health controller that keeps each node's `Healthy` condition current.

#![forbid(unsafe_code)]

pub mod nodehealth;
pub mod types;

pub use nodehealth::{get_node_health, node_health_controller, NodeHealthReconciler};
pub use types::{
    dns_policy_type, health_status_type, node_type, register_dns_policy, register_health_status, register_node,
    register_types, DnsPolicy, Health, HealthStatus, Node, NodeAddress,
};
