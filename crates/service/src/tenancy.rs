//! Tenancy: bridging between the resource tenancy and the legacy enterprise
//! metadata the ACL system evaluates, plus existence checks against the
//! legacy tenancy store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use regent_core::{Tenancy, DEFAULT_TENANCY};
use regent_registry::{Registration, Scope};
use rustc_hash::FxHashMap;

use crate::{ApiError, ApiResult};

/// Legacy partition / namespace pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnterpriseMeta {
    pub partition: String,
    pub namespace: String,
}

impl EnterpriseMeta {
    pub fn partition_or_default(&self) -> &str {
        if self.partition.is_empty() {
            DEFAULT_TENANCY
        } else {
            &self.partition
        }
    }

    pub fn namespace_or_default(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_TENANCY
        } else {
            &self.namespace
        }
    }
}

impl From<&Tenancy> for EnterpriseMeta {
    fn from(t: &Tenancy) -> Self {
        Self { partition: t.partition.clone(), namespace: t.namespace.clone() }
    }
}

/// Fill the empty units `scope` requires from the (resolved) enterprise meta.
pub fn bridge_tenancy(scope: Scope, ent: &EnterpriseMeta, tenancy: &mut Tenancy) {
    if matches!(scope, Scope::Partition | Scope::Namespace) && tenancy.partition.is_empty() {
        tenancy.partition = ent.partition_or_default().to_string();
    }
    if scope == Scope::Namespace && tenancy.namespace.is_empty() {
        tenancy.namespace = ent.namespace_or_default().to_string();
    }
}

/// Answers questions about the legacy tenancy store.
pub trait TenancyBridge: Send + Sync {
    fn partition_exists(&self, partition: &str) -> anyhow::Result<bool>;
    fn is_partition_marked_for_deletion(&self, partition: &str) -> anyhow::Result<bool>;
    fn namespace_exists(&self, partition: &str, namespace: &str) -> anyhow::Result<bool>;
    fn is_namespace_marked_for_deletion(&self, partition: &str, namespace: &str) -> anyhow::Result<bool>;
}

fn bridge_error(err: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("failed tenancy lookup: {err:#}"))
}

/// Require every tenancy unit the type is scoped to to exist and not be
/// pending deletion. `missing` builds the error for an absent unit.
pub(crate) fn check_tenancy(
    reg: &Registration,
    bridge: &dyn TenancyBridge,
    tenancy: &Tenancy,
    missing: fn(String) -> ApiError,
) -> ApiResult<()> {
    if matches!(reg.scope, Scope::Partition | Scope::Namespace) {
        if !bridge.partition_exists(&tenancy.partition).map_err(bridge_error)? {
            return Err(missing(format!("partition not found: {}", tenancy.partition)));
        }
        if bridge.is_partition_marked_for_deletion(&tenancy.partition).map_err(bridge_error)? {
            return Err(missing(format!("partition marked for deletion: {}", tenancy.partition)));
        }
    }
    if reg.scope == Scope::Namespace {
        if !bridge.namespace_exists(&tenancy.partition, &tenancy.namespace).map_err(bridge_error)? {
            return Err(missing(format!("namespace not found: {}", tenancy.namespace)));
        }
        if bridge
            .is_namespace_marked_for_deletion(&tenancy.partition, &tenancy.namespace)
            .map_err(bridge_error)?
        {
            return Err(missing(format!("namespace marked for deletion: {}", tenancy.namespace)));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct PartitionEntry {
    deleting: bool,
    /// namespace -> marked for deletion
    namespaces: FxHashMap<String, bool>,
}

/// In-memory tenancy store.
#[derive(Debug, Default)]
pub struct StaticTenancyBridge {
    partitions: RwLock<FxHashMap<String, PartitionEntry>>,
    lookups: AtomicU64,
}

impl StaticTenancyBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only `default/default`.
    pub fn with_default() -> Self {
        let b = Self::new();
        b.add_namespace(DEFAULT_TENANCY, DEFAULT_TENANCY);
        b
    }

    /// Creates the partition too when needed.
    pub fn add_namespace(&self, partition: &str, namespace: &str) {
        let mut parts = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        parts.entry(partition.to_string()).or_default().namespaces.insert(namespace.to_string(), false);
    }

    pub fn add_partition(&self, partition: &str) {
        let mut parts = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        parts.entry(partition.to_string()).or_default();
    }

    pub fn mark_partition_for_deletion(&self, partition: &str) {
        let mut parts = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = parts.get_mut(partition) {
            p.deleting = true;
        }
    }

    pub fn mark_namespace_for_deletion(&self, partition: &str, namespace: &str) {
        let mut parts = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(flag) = parts.get_mut(partition).and_then(|p| p.namespaces.get_mut(namespace)) {
            *flag = true;
        }
    }

    /// Number of questions answered so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    fn with_partition<T>(&self, partition: &str, f: impl FnOnce(Option<&PartitionEntry>) -> T) -> T {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let parts = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        f(parts.get(partition))
    }
}

impl TenancyBridge for StaticTenancyBridge {
    fn partition_exists(&self, partition: &str) -> anyhow::Result<bool> {
        Ok(self.with_partition(partition, |p| p.is_some()))
    }

    fn is_partition_marked_for_deletion(&self, partition: &str) -> anyhow::Result<bool> {
        Ok(self.with_partition(partition, |p| p.map(|p| p.deleting).unwrap_or(false)))
    }

    fn namespace_exists(&self, partition: &str, namespace: &str) -> anyhow::Result<bool> {
        Ok(self.with_partition(partition, |p| p.map(|p| p.namespaces.contains_key(namespace)).unwrap_or(false)))
    }

    fn is_namespace_marked_for_deletion(&self, partition: &str, namespace: &str) -> anyhow::Result<bool> {
        Ok(self.with_partition(partition, |p| {
            p.and_then(|p| p.namespaces.get(namespace).copied()).unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regent_core::Type;

    #[test]
    fn bridging_fills_only_scoped_units() {
        let ent = EnterpriseMeta { partition: "foo".into(), namespace: String::new() };

        let mut t = Tenancy::default();
        bridge_tenancy(Scope::Partition, &ent, &mut t);
        assert_eq!(t, Tenancy::new("foo", ""));

        let mut t = Tenancy::default();
        bridge_tenancy(Scope::Namespace, &ent, &mut t);
        assert_eq!(t, Tenancy::new("foo", "default"));

        let mut t = Tenancy::default();
        bridge_tenancy(Scope::Cluster, &ent, &mut t);
        assert_eq!(t, Tenancy::default());
    }

    #[test]
    fn existence_checks_follow_scope() {
        let bridge = StaticTenancyBridge::with_default();
        bridge.add_namespace("default", "going");
        bridge.mark_namespace_for_deletion("default", "going");
        let reg = Registration::new(Type::new("demo", "v1", "Thing"), Scope::Namespace);

        assert!(check_tenancy(&reg, &bridge, &Tenancy::default_namespace(), ApiError::NotFound).is_ok());
        let err = check_tenancy(&reg, &bridge, &Tenancy::new("default", "missing"), ApiError::NotFound).unwrap_err();
        assert!(err.is_not_found());
        let err = check_tenancy(&reg, &bridge, &Tenancy::new("default", "going"), ApiError::InvalidArgument)
            .unwrap_err();
        assert_eq!(err, ApiError::InvalidArgument("namespace marked for deletion: going".into()));

        let cluster = Registration::new(Type::new("demo", "v1", "Global"), Scope::Cluster);
        let before = bridge.lookups();
        assert!(check_tenancy(&cluster, &bridge, &Tenancy::default(), ApiError::NotFound).is_ok());
        assert_eq!(bridge.lookups(), before);
    }
}
