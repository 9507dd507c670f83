use std::sync::Arc;

use regent_core::DEFAULT_TENANCY;
use regent_registry::{AclError, Authorizer, AuthorizerContext, ManageAll};
use rustc_hash::FxHashMap;

use crate::tenancy::EnterpriseMeta;

/// Turns a caller token into an authorizer.
pub trait AclResolver: Send + Sync {
    /// Resolve `token` and default the empty units of `ent` from the token's
    /// home tenancy. The returned context is what hooks evaluate against.
    fn resolve(
        &self,
        token: Option<&str>,
        ent: &mut EnterpriseMeta,
    ) -> Result<(Arc<dyn Authorizer>, AuthorizerContext), AclError>;
}

struct TokenEntry {
    authz: Arc<dyn Authorizer>,
    home: EnterpriseMeta,
}

/// Fixed token table. Missing or empty tokens get the anonymous authorizer.
pub struct StaticAclResolver {
    anonymous: Arc<dyn Authorizer>,
    tokens: FxHashMap<String, TokenEntry>,
}

impl StaticAclResolver {
    pub fn new(anonymous: impl Authorizer + 'static) -> Self {
        Self { anonymous: Arc::new(anonymous), tokens: FxHashMap::default() }
    }

    /// ACLs disabled: everybody can do everything.
    pub fn allow_all() -> Self {
        Self::new(ManageAll)
    }

    pub fn with_token(mut self, token: impl Into<String>, authz: impl Authorizer + 'static) -> Self {
        self.tokens.insert(token.into(), TokenEntry { authz: Arc::new(authz), home: EnterpriseMeta::default() });
        self
    }

    /// Token whose requests default to `partition/namespace`.
    pub fn with_scoped_token(
        mut self,
        token: impl Into<String>,
        authz: impl Authorizer + 'static,
        partition: &str,
        namespace: &str,
    ) -> Self {
        let home = EnterpriseMeta { partition: partition.to_string(), namespace: namespace.to_string() };
        self.tokens.insert(token.into(), TokenEntry { authz: Arc::new(authz), home });
        self
    }
}

impl AclResolver for StaticAclResolver {
    fn resolve(
        &self,
        token: Option<&str>,
        ent: &mut EnterpriseMeta,
    ) -> Result<(Arc<dyn Authorizer>, AuthorizerContext), AclError> {
        let authz = match token.filter(|t| !t.is_empty()) {
            None => Arc::clone(&self.anonymous),
            Some(t) => {
                let entry = self.tokens.get(t).ok_or(AclError::TokenNotFound)?;
                if ent.partition.is_empty() {
                    ent.partition = entry.home.partition.clone();
                }
                if ent.namespace.is_empty() {
                    ent.namespace = entry.home.namespace.clone();
                }
                Arc::clone(&entry.authz)
            }
        };
        let ctx = AuthorizerContext {
            partition: non_empty(&ent.partition),
            namespace: non_empty(&ent.namespace),
        };
        Ok((authz, ctx))
    }
}

fn non_empty(unit: &str) -> String {
    if unit.is_empty() { DEFAULT_TENANCY.to_string() } else { unit.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regent_registry::{Access, DenyAll, Permission};

    #[test]
    fn tokens_resolve_and_default_tenancy() {
        let r = StaticAclResolver::new(DenyAll::default()).with_scoped_token("t1", ManageAll, "foo", "bar");

        let mut ent = EnterpriseMeta::default();
        let (authz, ctx) = r.resolve(Some("t1"), &mut ent).unwrap();
        assert_eq!(ent, EnterpriseMeta { partition: "foo".into(), namespace: "bar".into() });
        assert_eq!(ctx.partition, "foo");
        assert!(authz.enforce(Permission::Operator, Access::Write, &ctx).is_ok());

        let mut ent = EnterpriseMeta::default();
        let (authz, ctx) = r.resolve(None, &mut ent).unwrap();
        assert_eq!(ctx.namespace, "default");
        assert!(authz.enforce(Permission::Operator, Access::Read, &ctx).is_err());

        assert_eq!(r.resolve(Some("nope"), &mut EnterpriseMeta::default()).err(), Some(AclError::TokenNotFound));
    }
}
