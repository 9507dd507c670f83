use regent_core::{ReadConsistency, Resource, ResourceId};
use regent_store::StorageError;
use tracing::info;

use crate::tenancy::{bridge_tenancy, EnterpriseMeta};
use crate::validate::validate_id;
use crate::{storage_error, ApiError, ApiResult, Context, ResourceService};

impl ResourceService {
    /// Tenancy existence is not checked: resources must stay deletable while
    /// their partition or namespace is being torn down.
    pub(crate) async fn handle_delete(&self, ctx: &Context, id: &ResourceId, version: &str) -> ApiResult<()> {
        validate_id("id", id)?;
        let reg = self.resolve_type(&id.ty)?;
        reg.check_scope(&id.tenancy)?;

        let mut id = id.clone();
        let mut ent = EnterpriseMeta::from(&id.tenancy);
        let (authz, actx) = self.authorizer(ctx, &mut ent)?;
        bridge_tenancy(reg.scope, &ent, &mut id.tenancy);

        let mut by_name = id.clone();
        by_name.uid.clear();
        let existing = match ctx.run(self.backend.read(ReadConsistency::Strong, &by_name)).await? {
            Ok(existing) => Some(existing),
            Err(StorageError::NotFound) => None,
            Err(StorageError::GroupVersionMismatch(m)) => {
                by_name.ty = m.stored_type.clone();
                match ctx.run(self.backend.read(ReadConsistency::Strong, &by_name)).await? {
                    Ok(existing) => Some(existing),
                    Err(StorageError::NotFound) => None,
                    Err(e) => return Err(storage_error("delete", e)),
                }
            }
            Err(e) => return Err(storage_error("delete", e)),
        };

        let existing = match existing {
            Some(existing) => existing,
            None => {
                // Authorize anyway: absence is not revealed to callers who cannot delete.
                reg.acls.write(&*authz, &actx, &Resource::new(id, serde_json::Value::Null))?;
                return Ok(());
            }
        };
        reg.acls.write(&*authz, &actx, &existing)?;

        if !id.uid.is_empty() && id.uid != existing.id.uid {
            return Ok(());
        }
        if !version.is_empty() && version != existing.version {
            return Err(ApiError::Aborted(format!(
                "version {version} doesn't match stored version {}",
                existing.version
            )));
        }

        ctx.run(self.backend.delete_cas(&existing.id, version))
            .await?
            .map_err(|e| storage_error("delete", e))?;
        info!(id = %existing.id, "resource deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use regent_core::{ResourceId, Tenancy, Type};
    use regent_registry::{Access, PolicyAuthorizer, Registration, Scope};

    use crate::testing::{resource, Harness};
    use crate::{Code, Context, ResourceClient, StaticAclResolver};

    fn thing() -> Type {
        Type::new("demo", "v1", "Thing")
    }

    #[tokio::test]
    async fn delete_semantics() {
        let h = Harness::builder().register(Registration::new(thing(), Scope::Namespace)).build().unwrap();
        let ctx = Context::background();
        let stored = resource(thing(), "a").write(&*h.service).await.unwrap();

        let err = h.service.delete(&ctx, &stored.id, "bogus").await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);

        // Older incarnation: nothing to do.
        h.service.delete(&ctx, &stored.id.clone().with_uid("previous"), "").await.unwrap();
        h.service.read(&ctx, &stored.id).await.unwrap();

        h.service.delete(&ctx, &stored.id, &stored.version).await.unwrap();
        assert!(h.service.read(&ctx, &stored.id).await.unwrap_err().is_not_found());

        // Already gone.
        let by_name = ResourceId::new(thing(), Tenancy::default(), "a");
        h.service.delete(&ctx, &by_name, "").await.unwrap();
    }

    #[tokio::test]
    async fn delete_requires_write_permission() {
        let acls = StaticAclResolver::allow_all()
            .with_token("reader", PolicyAuthorizer::new("reader").allow_operator(Access::Read));
        let h = Harness::builder().register(Registration::new(thing(), Scope::Namespace)).acls(acls).build().unwrap();
        let stored = resource(thing(), "a").write(&*h.service).await.unwrap();
        let ctx = Context::background().with_token("reader");

        assert_eq!(h.service.delete(&ctx, &stored.id, "").await.unwrap_err().code(), Code::PermissionDenied);
        let absent = ResourceId::new(thing(), Tenancy::default(), "absent");
        assert_eq!(h.service.delete(&ctx, &absent, "").await.unwrap_err().code(), Code::PermissionDenied);
    }
}
