use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regent_core::{Resource, ResourceId, Type};
use regent_service::{Context, ResourceClient};

/// Unit of work: reconcile the resource named by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub id: ResourceId,
}

/// What a reconciler can reach while it runs.
#[derive(Clone)]
pub struct Runtime {
    pub client: Arc<dyn ResourceClient>,
    pub controller: String,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("controller", &self.controller).finish()
    }
}

/// Brings the world in line with one resource. Must be idempotent: the same
/// request may be delivered any number of times.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, ctx: &Context, rt: &Runtime, req: Request) -> anyhow::Result<()>;
}

/// Maps a mutation of a watched type onto the managed resource to reconcile.
pub type DependencyMapper = Arc<dyn Fn(&Resource) -> Option<ResourceId> + Send + Sync>;

/// Route to the resource's owner, if any.
pub fn map_owner() -> DependencyMapper {
    Arc::new(|res: &Resource| res.owner.clone())
}

/// Route to the owner only when it is of kind `ty`.
pub fn map_owner_filter_by_type(ty: Type) -> DependencyMapper {
    Arc::new(move |res: &Resource| res.owner.as_ref().filter(|o| o.ty.same_kind(&ty)).cloned())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub workers: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub queue_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1000),
            queue_capacity: 4096,
        }
    }
}

/// A reconciler plus the types whose mutations trigger it.
pub struct Controller {
    pub(crate) name: String,
    pub(crate) managed: Type,
    pub(crate) watches: Vec<(Type, DependencyMapper)>,
    pub(crate) reconciler: Option<Arc<dyn Reconciler>>,
    pub(crate) options: ControllerOptions,
}

impl Controller {
    pub fn new(name: impl Into<String>, managed: Type) -> Self {
        Self { name: name.into(), managed, watches: Vec::new(), reconciler: None, options: ControllerOptions::default() }
    }

    pub fn with_watch(mut self, ty: Type, mapper: DependencyMapper) -> Self {
        self.watches.push((ty, mapper));
        self
    }

    pub fn with_reconciler(mut self, r: impl Reconciler + 'static) -> Self {
        self.reconciler = Some(Arc::new(r));
        self
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn managed_type(&self) -> &Type {
        &self.managed
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("managed", &self.managed)
            .field("watches", &self.watches.iter().map(|(t, _)| t).collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regent_core::Tenancy;

    #[test]
    fn owner_mappers() {
        let node = Type::new("catalog", "v2beta1", "Node");
        let owner = ResourceId::new(node.clone(), Tenancy::new("default", ""), "n1").with_uid("u1");
        let mut child = Resource::new(
            ResourceId::new(Type::new("catalog", "v2beta1", "HealthStatus"), Tenancy::default_namespace(), "c"),
            serde_json::json!({}),
        );
        assert_eq!(map_owner()(&child), None);

        child.owner = Some(owner.clone());
        assert_eq!(map_owner()(&child), Some(owner.clone()));
        assert_eq!(map_owner_filter_by_type(node)(&child), Some(owner));
        assert_eq!(map_owner_filter_by_type(Type::new("catalog", "v2beta1", "Workload"))(&child), None);
    }
}
