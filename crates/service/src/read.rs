use regent_core::{Resource, ResourceId};
use regent_registry::{Decision, Registration};
use tracing::trace;

use crate::tenancy::{bridge_tenancy, check_tenancy, EnterpriseMeta};
use crate::validate::validate_id;
use crate::{storage_error, ApiError, ApiResult, Context, ResourceService};

impl ResourceService {
    pub(crate) async fn handle_read(&self, ctx: &Context, id: &ResourceId) -> ApiResult<Resource> {
        let (reg, mut id) = self.validate_read(id)?;

        let mut ent = EnterpriseMeta::from(&id.tenancy);
        let (authz, actx) = self.authorizer(ctx, &mut ent)?;
        bridge_tenancy(reg.scope, &ent, &mut id.tenancy);

        // Checked before tenancy existence so denied callers learn nothing about it.
        let decision = reg.acls.read(&*authz, &actx, &id, None)?;

        check_tenancy(&reg, &*self.tenancy, &id.tenancy, ApiError::NotFound)?;

        let res = ctx
            .run(self.backend.read(ctx.consistency(), &id))
            .await?
            .map_err(|e| storage_error("read", e))?;

        if decision == Decision::NeedData {
            match reg.acls.read(&*authz, &actx, &id, Some(&res))? {
                Decision::Allow => {}
                Decision::NeedData => {
                    return Err(ApiError::Internal(format!(
                        "acl hook for {} asked for data it was already given",
                        reg.ty
                    )))
                }
            }
        }
        trace!(id = %res.id, version = %res.version, "read");
        Ok(res)
    }

    fn validate_read(&self, id: &ResourceId) -> ApiResult<(Registration, ResourceId)> {
        validate_id("id", id)?;
        let reg = self.resolve_type(&id.ty)?;
        reg.check_scope(&id.tenancy)?;
        Ok((reg, id.clone()))
    }
}
