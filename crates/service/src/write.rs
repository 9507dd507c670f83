use regent_core::{ReadConsistency, Resource};
use regent_registry::{Registration, ValidationError};
use regent_store::StorageError;
use tracing::{debug, info};

use crate::tenancy::{bridge_tenancy, check_tenancy, EnterpriseMeta};
use crate::validate::{validate_id, validate_status};
use crate::{storage_error, ApiError, ApiResult, Context, ResourceService, WriteStatusRequest};

/// Outcome of one CAS attempt.
enum Attempt {
    Done(Resource),
    Conflict,
}

impl ResourceService {
    pub(crate) async fn handle_write(&self, ctx: &Context, mut res: Resource) -> ApiResult<Resource> {
        let reg = self.validate_write(&mut res)?;

        let mut ent = EnterpriseMeta::from(&res.id.tenancy);
        let (authz, actx) = self.authorizer(ctx, &mut ent)?;
        bridge_tenancy(reg.scope, &ent, &mut res.id.tenancy);
        if let Some(owner) = res.owner.as_mut() {
            let owner_reg = self.resolve_type(&owner.ty)?;
            bridge_tenancy(owner_reg.scope, &ent, &mut owner.tenancy);
        }

        reg.acls.write(&*authz, &actx, &res)?;
        check_tenancy(&reg, &*self.tenancy, &res.id.tenancy, ApiError::InvalidArgument)?;

        // Only blind writes are retried.
        let blind = res.version.is_empty();
        let mut attempt: u32 = 0;
        loop {
            match self.try_write(ctx, &res).await? {
                Attempt::Done(out) => return Ok(out),
                Attempt::Conflict if blind && attempt < self.config.write_retries => {
                    attempt += 1;
                    debug!(id = %res.id, attempt, "blind write lost a race; retrying");
                    ctx.run(tokio::time::sleep(self.config.write_retry_backoff * attempt)).await?;
                }
                Attempt::Conflict => {
                    return Err(ApiError::Aborted(StorageError::CasFailure.to_string()));
                }
            }
        }
    }

    async fn try_write(&self, ctx: &Context, req: &Resource) -> ApiResult<Attempt> {
        let mut input = req.clone();
        let mut by_name = input.id.clone();
        by_name.uid.clear();

        let existing = match ctx.run(self.backend.read(ReadConsistency::Strong, &by_name)).await? {
            Ok(existing) => Some(existing),
            Err(StorageError::NotFound) => None,
            // Writing at a new group version replaces the old one.
            Err(StorageError::GroupVersionMismatch(m)) => {
                by_name.ty = m.stored_type.clone();
                match ctx.run(self.backend.read(ReadConsistency::Strong, &by_name)).await? {
                    Ok(existing) => Some(existing),
                    Err(StorageError::NotFound) => None,
                    Err(e) => return Err(storage_error("write", e)),
                }
            }
            Err(e) => return Err(storage_error("write", e)),
        };

        match existing {
            None => {
                if !input.version.is_empty() {
                    return Ok(Attempt::Conflict);
                }
                input.status.clear();
            }
            Some(existing) => {
                if !input.id.uid.is_empty() && input.id.uid != existing.id.uid {
                    return Err(ApiError::FailedPrecondition(format!(
                        "uid doesn't match: resource {} is stored with uid {}",
                        input.id, existing.id.uid
                    )));
                }
                if input.version.is_empty() {
                    input.version = existing.version.clone();
                } else if input.version != existing.version {
                    return Ok(Attempt::Conflict);
                }
                // Unchanged payloads are not rewritten.
                if input.spec_eq(&existing) && input.id.ty == existing.id.ty {
                    return Ok(Attempt::Done(existing));
                }
                input.id.uid = existing.id.uid;
                input.status = existing.status;
            }
        }

        match ctx.run(self.backend.write_cas(input)).await? {
            Ok(out) => {
                info!(id = %out.id, version = %out.version, generation = out.generation, "resource written");
                Ok(Attempt::Done(out))
            }
            Err(StorageError::CasFailure) => Ok(Attempt::Conflict),
            Err(e) => Err(storage_error("write", e)),
        }
    }

    fn validate_write(&self, res: &mut Resource) -> ApiResult<Registration> {
        validate_id("resource.id", &res.id)?;
        let reg = self.resolve_type(&res.id.ty)?;
        reg.check_scope(&res.id.tenancy)?;
        if res.data.is_null() {
            return Err(ValidationError::missing("resource.data").into());
        }
        if let Some(owner) = &res.owner {
            validate_id("resource.owner", owner)?;
            if owner.uid.is_empty() {
                return Err(ValidationError::missing("resource.owner.uid").into());
            }
            let owner_reg = self.resolve_type(&owner.ty)?;
            owner_reg.check_scope(&owner.tenancy)?;
            if owner.same_reference(&res.id) {
                return Err(ValidationError::invalid(
                    "resource.owner",
                    "a resource cannot own itself",
                )
                .into());
            }
        }
        if let Some(mutate) = &reg.mutate {
            mutate(res)?;
        }
        if let Some(validate) = &reg.validate {
            validate(res)?;
        }
        Ok(reg)
    }

    pub(crate) async fn handle_write_status(&self, ctx: &Context, req: WriteStatusRequest) -> ApiResult<Resource> {
        validate_id("id", &req.id)?;
        if req.id.uid.is_empty() {
            return Err(ValidationError::missing("id.uid").into());
        }
        if req.key.is_empty() {
            return Err(ValidationError::missing("key").into());
        }
        validate_status(&req.status)?;
        let reg = self.resolve_type(&req.id.ty)?;
        reg.check_scope(&req.id.tenancy)?;

        let mut id = req.id.clone();
        let mut ent = EnterpriseMeta::from(&id.tenancy);
        let (authz, actx) = self.authorizer(ctx, &mut ent)?;
        bridge_tenancy(reg.scope, &ent, &mut id.tenancy);

        let blind = req.version.is_empty();
        let mut attempt: u32 = 0;
        loop {
            let existing = ctx
                .run(self.backend.read(ReadConsistency::Strong, &id))
                .await?
                .map_err(|e| storage_error("write status", e))?;
            reg.acls.write(&*authz, &actx, &existing)?;
            if !blind && req.version != existing.version {
                return Err(ApiError::Aborted(format!(
                    "version {} doesn't match stored version {}",
                    req.version, existing.version
                )));
            }
            if req.status.observed_generation != existing.generation {
                return Err(ApiError::Aborted(format!(
                    "status observes generation {} but resource is at generation {}",
                    req.status.observed_generation, existing.generation
                )));
            }

            let mut updated = existing;
            updated.status.insert(req.key.clone(), req.status.clone());
            match ctx.run(self.backend.write_cas(updated)).await? {
                Ok(out) => {
                    debug!(id = %out.id, key = %req.key, version = %out.version, "status written");
                    return Ok(out);
                }
                Err(StorageError::CasFailure) if blind && attempt < self.config.write_retries => {
                    attempt += 1;
                    ctx.run(tokio::time::sleep(self.config.write_retry_backoff * attempt)).await?;
                }
                Err(e) => return Err(storage_error("write status", e)),
            }
        }
    }
}
