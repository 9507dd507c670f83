//! Helpers for exercising the service in tests: an in-memory harness and a
//! resource builder.

use std::sync::Arc;

use regent_core::{Resource, ResourceId, Tenancy, Type};
use regent_registry::{Registration, Registry, RegistryError};
use regent_store::MemBackend;
use serde::Serialize;

use crate::{ApiResult, Context, ResourceClient, ResourceService, ServiceConfig, StaticAclResolver, StaticTenancyBridge};

/// Tenancies that exist in every harness.
pub fn test_tenancies() -> Vec<Tenancy> {
    vec![
        Tenancy::new("default", "default"),
        Tenancy::new("default", "bar"),
        Tenancy::new("foo", "default"),
        Tenancy::new("foo", "bar"),
    ]
}

/// Service wired to in-memory collaborators, with handles to each.
pub struct Harness {
    pub service: Arc<ResourceService>,
    pub backend: Arc<MemBackend>,
    pub tenancy: Arc<StaticTenancyBridge>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }
}

type RegisterFn = Box<dyn FnOnce(&mut Registry) -> Result<(), RegistryError>>;

#[derive(Default)]
pub struct HarnessBuilder {
    registrations: Vec<RegisterFn>,
    acls: Option<StaticAclResolver>,
    config: Option<ServiceConfig>,
}

impl HarnessBuilder {
    pub fn register(mut self, reg: Registration) -> Self {
        self.registrations.push(Box::new(move |r| r.register(reg)));
        self
    }

    /// Register a batch, e.g. a whole catalog.
    pub fn register_with(mut self, f: impl FnOnce(&mut Registry) -> Result<(), RegistryError> + 'static) -> Self {
        self.registrations.push(Box::new(f));
        self
    }

    /// Defaults to [`StaticAclResolver::allow_all`].
    pub fn acls(mut self, acls: StaticAclResolver) -> Self {
        self.acls = Some(acls);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Harness, RegistryError> {
        let mut registry = Registry::new();
        for f in self.registrations {
            f(&mut registry)?;
        }
        let tenancy = Arc::new(StaticTenancyBridge::new());
        for t in test_tenancies() {
            tenancy.add_namespace(&t.partition, &t.namespace);
        }
        let backend = Arc::new(MemBackend::new());
        let acls = self.acls.unwrap_or_else(StaticAclResolver::allow_all);
        let service = ResourceService::new(
            Arc::new(registry),
            Arc::clone(&backend) as Arc<dyn regent_store::Backend>,
            Arc::clone(&tenancy) as Arc<dyn crate::TenancyBridge>,
            Arc::new(acls),
        )
        .with_config(self.config.unwrap_or_default());
        Ok(Harness { service: Arc::new(service), backend, tenancy })
    }
}

/// Harness with the given types registered and default collaborators.
pub fn run_resource_service(
    register: impl FnOnce(&mut Registry) -> Result<(), RegistryError> + 'static,
) -> Result<Harness, RegistryError> {
    Harness::builder().register_with(register).build()
}

/// Start building a resource of type `ty` named `name` with empty data.
pub fn resource(ty: Type, name: &str) -> ResourceBuilder {
    ResourceBuilder { res: Resource::new(ResourceId::new(ty, Tenancy::default(), name), serde_json::json!({})) }
}

pub struct ResourceBuilder {
    res: Resource,
}

impl ResourceBuilder {
    pub fn with_tenancy(mut self, tenancy: Tenancy) -> Self {
        self.res.id.tenancy = tenancy;
        self
    }

    /// A payload that fails to encode is stored as null, which writes reject.
    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.res.data = serde_json::to_value(data).unwrap_or(serde_json::Value::Null);
        self
    }

    pub fn with_owner(mut self, owner: ResourceId) -> Self {
        self.res.owner = Some(owner);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.res.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Resource {
        self.res
    }

    pub async fn write(self, client: &dyn ResourceClient) -> ApiResult<Resource> {
        client.write(&Context::background(), self.res).await
    }
}
