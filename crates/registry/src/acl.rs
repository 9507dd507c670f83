//! ACL capability contracts.
//!
//! Policy evaluation lives behind [`Authorizer`]; each registered type decides
//! which permission guards it through its [`AclHooks`].

use regent_core::{Resource, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
        }
    }
}

/// What a permission check is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission<'a> {
    Operator,
    Node(&'a str),
}

impl Permission<'_> {
    fn describe(&self, access: Access) -> String {
        match self {
            Permission::Operator => format!("operator:{}", access.as_str()),
            Permission::Node(name) => format!("node:{} on {:?}", access.as_str(), name),
        }
    }
}

/// Legacy tenancy the authorizer evaluates against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizerContext {
    pub partition: String,
    pub namespace: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AclError {
    #[error("Permission denied: token with AccessorID '{accessor}' lacks permission '{permission}'")]
    PermissionDenied { accessor: String, permission: String },
    #[error("acl not found")]
    TokenNotFound,
    #[error("acl: {0}")]
    Other(String),
}

impl AclError {
    pub fn denied(accessor: &str, permission: Permission<'_>, access: Access) -> Self {
        AclError::PermissionDenied { accessor: accessor.to_string(), permission: permission.describe(access) }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AclError::PermissionDenied { .. })
    }
}

/// Resolved policy for one caller.
pub trait Authorizer: Send + Sync {
    fn enforce(&self, permission: Permission<'_>, access: Access, ctx: &AuthorizerContext) -> Result<(), AclError>;
}

/// Outcome of a read hook that could not decide without the resource body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Call again with the stored resource attached.
    NeedData,
}

/// Per-type authorization. Defaults guard everything with operator permissions.
pub trait AclHooks: Send + Sync {
    /// `res` is `None` on the first pass. Returning [`Decision::NeedData`]
    /// asks the caller to fetch the body and call again with it.
    fn read(
        &self,
        authz: &dyn Authorizer,
        ctx: &AuthorizerContext,
        _id: &ResourceId,
        _res: Option<&Resource>,
    ) -> Result<Decision, AclError> {
        authz.enforce(Permission::Operator, Access::Read, ctx).map(|()| Decision::Allow)
    }

    fn write(&self, authz: &dyn Authorizer, ctx: &AuthorizerContext, _res: &Resource) -> Result<(), AclError> {
        authz.enforce(Permission::Operator, Access::Write, ctx)
    }

    /// Gate for list and watch calls; results are additionally filtered by `read`.
    fn list(&self, authz: &dyn Authorizer, ctx: &AuthorizerContext) -> Result<(), AclError> {
        authz.enforce(Permission::Operator, Access::Read, ctx)
    }
}

/// Operator-only hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperatorAcls;

impl AclHooks for OperatorAcls {}

/// Allows everything. Used for internal callers such as controllers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManageAll;

impl Authorizer for ManageAll {
    fn enforce(&self, _: Permission<'_>, _: Access, _: &AuthorizerContext) -> Result<(), AclError> {
        Ok(())
    }
}

/// Denies everything; the policy for anonymous callers when ACLs are enabled.
#[derive(Debug, Clone, Default)]
pub struct DenyAll {
    pub accessor: String,
}

impl Authorizer for DenyAll {
    fn enforce(&self, permission: Permission<'_>, access: Access, _: &AuthorizerContext) -> Result<(), AclError> {
        Err(AclError::denied(&self.accessor, permission, access))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Grant {
    Operator(Access),
    NodePrefix(String, Access),
}

/// Small allow-list policy: operator access plus node-name prefix rules.
/// Write grants imply read.
#[derive(Debug, Clone, Default)]
pub struct PolicyAuthorizer {
    accessor: String,
    grants: Vec<Grant>,
}

impl PolicyAuthorizer {
    pub fn new(accessor: impl Into<String>) -> Self {
        Self { accessor: accessor.into(), grants: Vec::new() }
    }

    pub fn allow_operator(mut self, access: Access) -> Self {
        self.grants.push(Grant::Operator(access));
        self
    }

    pub fn allow_node_prefix(mut self, prefix: impl Into<String>, access: Access) -> Self {
        self.grants.push(Grant::NodePrefix(prefix.into(), access));
        self
    }

    fn covers(granted: Access, wanted: Access) -> bool {
        granted == Access::Write || granted == wanted
    }
}

impl Authorizer for PolicyAuthorizer {
    fn enforce(&self, permission: Permission<'_>, access: Access, _ctx: &AuthorizerContext) -> Result<(), AclError> {
        let allowed = self.grants.iter().any(|g| match (g, permission) {
            (Grant::Operator(a), Permission::Operator) => Self::covers(*a, access),
            (Grant::NodePrefix(prefix, a), Permission::Node(name)) => {
                name.starts_with(prefix.as_str()) && Self::covers(*a, access)
            }
            _ => false,
        });
        if allowed {
            Ok(())
        } else {
            Err(AclError::denied(&self.accessor, permission, access))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_write_implies_read() {
        let ctx = AuthorizerContext::default();
        let p = PolicyAuthorizer::new("abc").allow_node_prefix("web", Access::Write).allow_operator(Access::Read);
        assert!(p.enforce(Permission::Node("web-1"), Access::Read, &ctx).is_ok());
        assert!(p.enforce(Permission::Node("web-1"), Access::Write, &ctx).is_ok());
        assert!(p.enforce(Permission::Node("db-1"), Access::Read, &ctx).is_err());
        assert!(p.enforce(Permission::Operator, Access::Read, &ctx).is_ok());

        let err = p.enforce(Permission::Operator, Access::Write, &ctx).unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(
            err.to_string(),
            "Permission denied: token with AccessorID 'abc' lacks permission 'operator:write'"
        );
    }
}
