//! Regent type registry: maps a resource type to its scope, ACL hooks and
//! schema hooks. Built once at start-up and shared read-only afterwards.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regent_core::{Resource, Tenancy, Type};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub mod acl;

pub use acl::{
    Access, AclError, AclHooks, Authorizer, AuthorizerContext, Decision, DenyAll, ManageAll, OperatorAcls,
    Permission, PolicyAuthorizer,
};

static GROUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z\d_]+$").expect("static regex"));
static GROUP_VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^v([a-z\d]+)?\d$").expect("static regex"));
static KIND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Za-z\d]+$").expect("static regex"));
// DNS label, underscores allowed.
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9\-_]*[a-z0-9])?$").expect("static regex"));

const MAX_NAME_LEN: usize = 63;

/// How a type is scoped within the tenancy hierarchy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Cluster,
    Partition,
    Namespace,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Cluster => "cluster",
            Scope::Partition => "partition",
            Scope::Namespace => "namespace",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: String },
    #[error("invalid \"{field}\" field: {reason}")]
    Invalid { field: String, reason: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::Missing { field: field.into() }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::Invalid { field: field.into(), reason: reason.into() }
    }

    /// Prefix the field path, e.g. `host` -> `addresses[0].host`.
    pub fn within(self, parent: &str) -> Self {
        match self {
            ValidationError::Missing { field } => ValidationError::Missing { field: format!("{parent}.{field}") },
            ValidationError::Invalid { field, reason } => {
                ValidationError::Invalid { field: format!("{parent}.{field}"), reason }
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("resource type {0} already registered")]
    Duplicate(Type),
    #[error("invalid resource type {ty}: {reason}")]
    InvalidType { ty: Type, reason: String },
}

pub type ValidateHook = Arc<dyn Fn(&Resource) -> Result<(), ValidationError> + Send + Sync>;
pub type MutateHook = Arc<dyn Fn(&mut Resource) -> Result<(), ValidationError> + Send + Sync>;

/// Everything the service needs to know about one type.
#[derive(Clone)]
pub struct Registration {
    pub ty: Type,
    pub scope: Scope,
    pub acls: Arc<dyn AclHooks>,
    pub validate: Option<ValidateHook>,
    pub mutate: Option<MutateHook>,
}

impl Registration {
    pub fn new(ty: Type, scope: Scope) -> Self {
        Self { ty, scope, acls: Arc::new(OperatorAcls), validate: None, mutate: None }
    }

    pub fn with_acls(mut self, acls: impl AclHooks + 'static) -> Self {
        self.acls = Arc::new(acls);
        self
    }

    pub fn with_validate(mut self, f: impl Fn(&Resource) -> Result<(), ValidationError> + Send + Sync + 'static) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn with_mutate(mut self, f: impl Fn(&mut Resource) -> Result<(), ValidationError> + Send + Sync + 'static) -> Self {
        self.mutate = Some(Arc::new(f));
        self
    }

    /// Check tenancy units against the scope: units finer than the scope must be empty.
    pub fn check_scope(&self, tenancy: &Tenancy) -> Result<(), ValidationError> {
        match self.scope {
            Scope::Cluster => {
                if !tenancy.partition.is_empty() {
                    return Err(ValidationError::invalid(
                        "tenancy.partition",
                        format!("cluster scoped resource {} cannot have a partition: {}", self.ty, tenancy.partition),
                    ));
                }
                if !tenancy.namespace.is_empty() {
                    return Err(ValidationError::invalid(
                        "tenancy.namespace",
                        format!("cluster scoped resource {} cannot have a namespace: {}", self.ty, tenancy.namespace),
                    ));
                }
            }
            Scope::Partition => {
                if !tenancy.namespace.is_empty() {
                    return Err(ValidationError::invalid(
                        "tenancy.namespace",
                        format!("partition scoped resource {} cannot have a namespace. got: {}", self.ty, tenancy.namespace),
                    ));
                }
            }
            Scope::Namespace => {
                // Both empty means "inherit from the caller"; a lone partition is ambiguous.
                if !tenancy.partition.is_empty() && tenancy.namespace.is_empty() {
                    return Err(ValidationError::invalid(
                        "tenancy.namespace",
                        format!("namespace scoped resource {} requires a namespace when a partition is set", self.ty),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("ty", &self.ty)
            .field("scope", &self.scope)
            .field("validate", &self.validate.is_some())
            .field("mutate", &self.mutate.is_some())
            .finish()
    }
}

/// Registered types, looked up by exact group / version / kind.
#[derive(Debug, Default)]
pub struct Registry {
    types: FxHashMap<Type, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reg: Registration) -> Result<(), RegistryError> {
        validate_type(&reg.ty)?;
        if self.types.contains_key(&reg.ty) {
            return Err(RegistryError::Duplicate(reg.ty));
        }
        self.types.insert(reg.ty.clone(), reg);
        Ok(())
    }

    pub fn resolve(&self, ty: &Type) -> Option<&Registration> {
        self.types.get(ty)
    }

    /// All registrations, sorted by type.
    pub fn types(&self) -> Vec<&Registration> {
        let mut out: Vec<&Registration> = self.types.values().collect();
        out.sort_by(|a, b| a.ty.cmp(&b.ty));
        out
    }

    pub fn len(&self) -> usize { self.types.len() }
    pub fn is_empty(&self) -> bool { self.types.is_empty() }
}

fn validate_type(ty: &Type) -> Result<(), RegistryError> {
    let fail = |reason: &str| RegistryError::InvalidType { ty: ty.clone(), reason: reason.to_string() };
    if !GROUP_RE.is_match(&ty.group) {
        return Err(fail("group must be lower case letters, digits or underscores"));
    }
    if !GROUP_VERSION_RE.is_match(&ty.group_version) {
        return Err(fail("group version must look like v1, v2beta1"));
    }
    if !KIND_RE.is_match(&ty.kind) {
        return Err(fail("kind must be PascalCase"));
    }
    Ok(())
}

/// Resource names and tenancy units are DNS labels (underscores allowed).
pub fn validate_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::missing(field));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::invalid(field, format!("value exceeds maximum length of {MAX_NAME_LEN}")));
    }
    if !NAME_RE.is_match(name) {
        return Err(ValidationError::invalid(
            field,
            "a name must consist of lower case alphanumeric characters, '-' or '_', and start and end with an alphanumeric character",
        ));
    }
    Ok(())
}
