use std::sync::Arc;

use regent_core::{Resource, ResourceId, WILDCARD};
use regent_registry::{AclError, Authorizer, AuthorizerContext, Decision, Registration, Scope, ValidationError};
use tracing::{trace, warn};

use crate::tenancy::{bridge_tenancy, EnterpriseMeta};
use crate::validate::{validate_id, validate_tenancy, validate_type};
use crate::{storage_error, ApiError, ApiResult, Context, ListRequest, ResourceService};

/// Caller's view of a list: the registration, the resolved authorizer and the
/// bridged filter.
pub(crate) struct ListScope {
    pub reg: Registration,
    pub authz: Arc<dyn Authorizer>,
    pub actx: AuthorizerContext,
    pub req: ListRequest,
}

impl ListScope {
    /// Whether the caller may see `res`.
    pub fn visible(&self, res: &Resource) -> ApiResult<bool> {
        allowed(&self.reg, &*self.authz, &self.actx, res)
    }

    pub fn matches(&self, res: &Resource) -> bool {
        res.id.ty == self.req.ty
            && self.req.tenancy.matches(&res.id.tenancy)
            && res.id.name.starts_with(&self.req.name_prefix)
    }
}

/// Read-hook filter with the resource body attached. Denials hide the item.
fn allowed(reg: &Registration, authz: &dyn Authorizer, actx: &AuthorizerContext, res: &Resource) -> ApiResult<bool> {
    match reg.acls.read(authz, actx, &res.id, Some(res)) {
        Ok(Decision::Allow) => Ok(true),
        Ok(Decision::NeedData) => {
            Err(ApiError::Internal(format!("acl hook for {} asked for data it was already given", reg.ty)))
        }
        Err(AclError::PermissionDenied { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl ResourceService {
    pub(crate) fn list_scope(&self, ctx: &Context, mut req: ListRequest) -> ApiResult<ListScope> {
        validate_type("type", &req.ty)?;
        validate_tenancy("request", &req.tenancy, true)?;
        let reg = self.resolve_type(&req.ty)?;
        // A wildcard on a unit the type is not scoped to means nothing.
        if reg.scope != Scope::Namespace && req.tenancy.namespace == WILDCARD {
            req.tenancy.namespace.clear();
        }
        if reg.scope == Scope::Cluster && req.tenancy.partition == WILDCARD {
            req.tenancy.partition.clear();
        }
        reg.check_scope(&req.tenancy)?;

        let mut ent = EnterpriseMeta::from(&req.tenancy);
        let (authz, actx) = self.authorizer(ctx, &mut ent)?;
        bridge_tenancy(reg.scope, &ent, &mut req.tenancy);
        reg.acls.list(&*authz, &actx)?;
        Ok(ListScope { reg, authz, actx, req })
    }

    pub(crate) async fn handle_list(&self, ctx: &Context, req: ListRequest) -> ApiResult<Vec<Resource>> {
        let scope = self.list_scope(ctx, req)?;
        let items = ctx
            .run(self.backend.list(ctx.consistency(), &scope.req.ty, &scope.req.tenancy, &scope.req.name_prefix))
            .await?
            .map_err(|e| storage_error("list", e))?;

        let mut out = Vec::with_capacity(items.len());
        for res in items {
            // Other group versions of the kind are not part of this type.
            if res.id.ty != scope.req.ty {
                continue;
            }
            if scope.visible(&res)? {
                out.push(res);
            }
        }
        trace!(ty = %scope.req.ty, tenancy = %scope.req.tenancy, count = out.len(), "list");
        Ok(out)
    }

    pub(crate) async fn handle_list_by_owner(&self, ctx: &Context, owner: &ResourceId) -> ApiResult<Vec<Resource>> {
        validate_id("owner", owner)?;
        if owner.uid.is_empty() {
            return Err(ValidationError::missing("owner.uid").into());
        }
        let reg = self.resolve_type(&owner.ty)?;
        reg.check_scope(&owner.tenancy)?;

        let mut owner = owner.clone();
        let mut ent = EnterpriseMeta::from(&owner.tenancy);
        let (authz, actx) = self.authorizer(ctx, &mut ent)?;
        bridge_tenancy(reg.scope, &ent, &mut owner.tenancy);

        let children = ctx
            .run(self.backend.list_by_owner(&owner))
            .await?
            .map_err(|e| storage_error("list by owner", e))?;

        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let Some(child_reg) = self.registry.resolve(&child.id.ty) else {
                warn!(id = %child.id, "skipping owned resource of unregistered type");
                continue;
            };
            if allowed(child_reg, &*authz, &actx, &child)? {
                out.push(child);
            }
        }
        Ok(out)
    }
}
