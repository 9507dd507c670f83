//! Catalog payloads, their validation and their ACL hooks.

use std::fmt;
use std::net::IpAddr;

use regent_core::{Resource, ResourceId, Type};
use regent_registry::{
    Access, AclError, AclHooks, Authorizer, AuthorizerContext, Decision, Permission, Registration, Registry,
    RegistryError, Scope, ValidationError,
};
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "catalog";
pub const VERSION: &str = "v2beta1";

pub fn node_type() -> Type {
    Type::new(GROUP, VERSION, "Node")
}

pub fn health_status_type() -> Type {
    Type::new(GROUP, VERSION, "HealthStatus")
}

pub fn dns_policy_type() -> Type {
    Type::new(GROUP, VERSION, "DnsPolicy")
}

/// Ordered from best to worst; aggregation takes the maximum.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Health {
    #[default]
    #[serde(rename = "HEALTH_PASSING")]
    Passing,
    #[serde(rename = "HEALTH_WARNING")]
    Warning,
    #[serde(rename = "HEALTH_CRITICAL")]
    Critical,
    #[serde(rename = "HEALTH_MAINTENANCE")]
    Maintenance,
}

impl Health {
    pub const ALL: [Health; 4] = [Health::Passing, Health::Warning, Health::Critical, Health::Maintenance];

    /// Condition reason token.
    pub fn reason(&self) -> &'static str {
        match self {
            Health::Passing => "HEALTH_PASSING",
            Health::Warning => "HEALTH_WARNING",
            Health::Critical => "HEALTH_CRITICAL",
            Health::Maintenance => "HEALTH_MAINTENANCE",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
}

/// Result of one check, owned by the node it is about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    #[serde(rename = "type")]
    pub ty: String,
    pub status: Health,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSelector {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Weights {
    pub passing: u32,
    #[serde(default)]
    pub warning: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsPolicy {
    pub workloads: WorkloadSelector,
    pub weights: Weights,
}

fn decode<T: serde::de::DeserializeOwned>(res: &Resource) -> Result<T, ValidationError> {
    res.decode().map_err(|e| ValidationError::invalid("data", e.to_string()))
}

fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() {
        return Err(ValidationError::missing("host"));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let dns_ok = host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if dns_ok {
        Ok(())
    } else {
        Err(ValidationError::invalid("host", format!("{host:?} is not an IP address or DNS name")))
    }
}

pub fn validate_node(res: &Resource) -> Result<(), ValidationError> {
    let node: Node = decode(res)?;
    if node.addresses.is_empty() {
        return Err(ValidationError::missing("addresses"));
    }
    for (i, addr) in node.addresses.iter().enumerate() {
        validate_host(&addr.host).map_err(|e| e.within(&format!("addresses[{i}]")))?;
    }
    Ok(())
}

pub fn validate_health_status(res: &Resource) -> Result<(), ValidationError> {
    let hs: HealthStatus = decode(res)?;
    if hs.ty.is_empty() {
        return Err(ValidationError::missing("type"));
    }
    match &res.owner {
        None => Err(ValidationError::missing("owner")),
        Some(owner) if !owner.ty.same_kind(&node_type()) => Err(ValidationError::invalid(
            "owner",
            format!("health status must be owned by a {}, not {}", node_type(), owner.ty),
        )),
        Some(_) => Ok(()),
    }
}

pub fn validate_dns_policy(res: &Resource) -> Result<(), ValidationError> {
    let policy: DnsPolicy = decode(res)?;
    if policy.workloads.names.is_empty() && policy.workloads.prefixes.is_empty() {
        return Err(ValidationError::invalid("workloads", "must select at least one name or prefix"));
    }
    if policy.weights.passing < 1 {
        return Err(ValidationError::invalid("passing", "must be at least 1").within("weights"));
    }
    Ok(())
}

/// `node:read` / `node:write` on the node's own name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeAcls;

impl AclHooks for NodeAcls {
    fn read(
        &self,
        authz: &dyn Authorizer,
        ctx: &AuthorizerContext,
        id: &ResourceId,
        _res: Option<&Resource>,
    ) -> Result<Decision, AclError> {
        authz.enforce(Permission::Node(&id.name), Access::Read, ctx).map(|()| Decision::Allow)
    }

    fn write(&self, authz: &dyn Authorizer, ctx: &AuthorizerContext, res: &Resource) -> Result<(), AclError> {
        authz.enforce(Permission::Node(&res.id.name), Access::Write, ctx)
    }

    fn list(&self, _authz: &dyn Authorizer, _ctx: &AuthorizerContext) -> Result<(), AclError> {
        Ok(())
    }
}

/// Guarded by the owning node, which is only known once the body is loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthStatusAcls;

impl HealthStatusAcls {
    fn enforce_owner(
        authz: &dyn Authorizer,
        ctx: &AuthorizerContext,
        res: &Resource,
        access: Access,
    ) -> Result<(), AclError> {
        match &res.owner {
            Some(owner) => authz.enforce(Permission::Node(&owner.name), access, ctx),
            None => authz.enforce(Permission::Operator, access, ctx),
        }
    }
}

impl AclHooks for HealthStatusAcls {
    fn read(
        &self,
        authz: &dyn Authorizer,
        ctx: &AuthorizerContext,
        _id: &ResourceId,
        res: Option<&Resource>,
    ) -> Result<Decision, AclError> {
        match res {
            None => Ok(Decision::NeedData),
            Some(res) => Self::enforce_owner(authz, ctx, res, Access::Read).map(|()| Decision::Allow),
        }
    }

    fn write(&self, authz: &dyn Authorizer, ctx: &AuthorizerContext, res: &Resource) -> Result<(), AclError> {
        Self::enforce_owner(authz, ctx, res, Access::Write)
    }

    fn list(&self, _authz: &dyn Authorizer, _ctx: &AuthorizerContext) -> Result<(), AclError> {
        Ok(())
    }
}

pub fn register_node(reg: &mut Registry) -> Result<(), RegistryError> {
    reg.register(Registration::new(node_type(), Scope::Partition).with_acls(NodeAcls).with_validate(validate_node))
}

pub fn register_health_status(reg: &mut Registry) -> Result<(), RegistryError> {
    reg.register(
        Registration::new(health_status_type(), Scope::Namespace)
            .with_acls(HealthStatusAcls)
            .with_validate(validate_health_status),
    )
}

pub fn register_dns_policy(reg: &mut Registry) -> Result<(), RegistryError> {
    reg.register(Registration::new(dns_policy_type(), Scope::Namespace).with_validate(validate_dns_policy))
}

/// Register every catalog type.
pub fn register_types(reg: &mut Registry) -> Result<(), RegistryError> {
    register_node(reg)?;
    register_health_status(reg)?;
    register_dns_policy(reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regent_core::Tenancy;
    use regent_registry::PolicyAuthorizer;
    use serde_json::json;

    fn node_res(data: serde_json::Value) -> Resource {
        Resource::new(ResourceId::new(node_type(), Tenancy::new("default", ""), "web-1"), data)
    }

    fn check(owner: Option<ResourceId>) -> Resource {
        let mut res = Resource::new(
            ResourceId::new(health_status_type(), Tenancy::default_namespace(), "c1"),
            json!({ "type": "tcp", "status": "HEALTH_WARNING" }),
        );
        res.owner = owner;
        res
    }

    #[test]
    fn health_orders_and_serializes() {
        let mut all = vec![Health::Maintenance, Health::Passing, Health::Critical, Health::Warning];
        all.sort();
        assert_eq!(all, Health::ALL.to_vec());
        assert_eq!(serde_json::to_value(Health::Critical).unwrap(), json!("HEALTH_CRITICAL"));
        assert_eq!(Health::Maintenance.reason(), "HEALTH_MAINTENANCE");
    }

    #[test]
    fn node_needs_a_usable_address() {
        assert!(validate_node(&node_res(json!({ "addresses": [{ "host": "127.0.0.1" }] }))).is_ok());
        assert!(validate_node(&node_res(json!({ "addresses": [{ "host": "node.dc1.internal" }] }))).is_ok());
        assert_eq!(validate_node(&node_res(json!({}))), Err(ValidationError::missing("addresses")));
        assert_eq!(
            validate_node(&node_res(json!({ "addresses": [{ "host": "10.0.0.1" }, { "host": "" }] }))),
            Err(ValidationError::missing("addresses[1].host"))
        );
        assert!(validate_node(&node_res(json!({ "addresses": [{ "host": "bad host" }] }))).is_err());
        assert!(validate_node(&node_res(json!({ "addresses": "nope" }))).is_err());
    }

    #[test]
    fn health_status_must_be_owned_by_a_node() {
        let node = ResourceId::new(node_type(), Tenancy::new("default", ""), "web-1").with_uid("u");
        assert!(validate_health_status(&check(Some(node))).is_ok());
        assert_eq!(validate_health_status(&check(None)), Err(ValidationError::missing("owner")));

        let other = ResourceId::new(dns_policy_type(), Tenancy::default_namespace(), "p").with_uid("u");
        assert!(matches!(validate_health_status(&check(Some(other))), Err(ValidationError::Invalid { .. })));
    }

    #[test]
    fn dns_policy_weights() {
        let policy = |passing: u32| {
            Resource::new(
                ResourceId::new(dns_policy_type(), Tenancy::default_namespace(), "p"),
                json!({ "workloads": { "prefixes": [""] }, "weights": { "passing": passing, "warning": 1 } }),
            )
        };
        assert!(validate_dns_policy(&policy(1)).is_ok());
        assert_eq!(
            validate_dns_policy(&policy(0)),
            Err(ValidationError::invalid("weights.passing", "must be at least 1"))
        );
    }

    #[test]
    fn health_status_read_needs_the_owner() {
        let authz = PolicyAuthorizer::new("abc").allow_node_prefix("web", Access::Read);
        let ctx = AuthorizerContext::default();
        let hooks = HealthStatusAcls;
        let web = ResourceId::new(node_type(), Tenancy::new("default", ""), "web-1").with_uid("u");
        let db = ResourceId::new(node_type(), Tenancy::new("default", ""), "db-1").with_uid("u");

        let res = check(Some(web));
        assert_eq!(hooks.read(&authz, &ctx, &res.id, None), Ok(Decision::NeedData));
        assert_eq!(hooks.read(&authz, &ctx, &res.id, Some(&res)), Ok(Decision::Allow));
        assert!(hooks.write(&authz, &ctx, &res).unwrap_err().is_permission_denied());

        let res = check(Some(db));
        assert!(hooks.read(&authz, &ctx, &res.id, Some(&res)).unwrap_err().is_permission_denied());
    }
}
