//! Resource identity: type descriptors, tenancy and ids.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tenancy value that matches every partition or namespace in list and watch calls.
pub const WILDCARD: &str = "*";

/// Name of the partition and namespace that empty tenancy units fall back to.
pub const DEFAULT_TENANCY: &str = "default";

/// Group / group-version / kind triple naming a resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type {
    pub group: String,
    pub group_version: String,
    pub kind: String,
}

impl Type {
    pub fn new(group: impl Into<String>, group_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), group_version: group_version.into(), kind: kind.into() }
    }

    /// Group and kind match; the group version may differ.
    pub fn same_kind(&self, other: &Type) -> bool {
        self.group == other.group && self.kind == other.kind
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty() && self.group_version.is_empty() && self.kind.is_empty()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.group, self.group_version, self.kind)
    }
}

/// Partition / namespace pair scoping a resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tenancy {
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub namespace: String,
}

impl Tenancy {
    pub fn new(partition: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { partition: partition.into(), namespace: namespace.into() }
    }

    /// `default/default`
    pub fn default_namespace() -> Self {
        Self::new(DEFAULT_TENANCY, DEFAULT_TENANCY)
    }

    /// Tenancy matching every partition and namespace.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    /// Whether `other` (a concrete tenancy) falls inside this filter.
    /// Empty and `*` units match anything.
    pub fn matches(&self, other: &Tenancy) -> bool {
        fn unit(filter: &str, value: &str) -> bool {
            filter.is_empty() || filter == WILDCARD || filter == value
        }
        unit(&self.partition, &other.partition) && unit(&self.namespace, &other.namespace)
    }
}

impl fmt::Display for Tenancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.namespace)
    }
}

/// Storage identity of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceId {
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default)]
    pub tenancy: Tenancy,
    pub name: String,
    /// Assigned by storage on create. Empty on a request means "whatever is
    /// currently stored under this name".
    #[serde(default)]
    pub uid: String,
}

impl ResourceId {
    pub fn new(ty: Type, tenancy: Tenancy, name: impl Into<String>) -> Self {
        Self { ty, tenancy, name: name.into(), uid: String::new() }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    /// Same resource by name, ignoring uid and type version.
    pub fn same_reference(&self, other: &ResourceId) -> bool {
        self.ty.same_kind(&other.ty) && self.tenancy == other.tenancy && self.name == other.name
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.ty, self.tenancy, self.name)?;
        if !self.uid.is_empty() {
            write!(f, "@{}", self.uid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenancy_filter_matching() {
        let concrete = Tenancy::new("default", "web");
        assert!(Tenancy::wildcard().matches(&concrete));
        assert!(Tenancy::new("default", "*").matches(&concrete));
        assert!(Tenancy::new("", "").matches(&concrete));
        assert!(!Tenancy::new("other", "*").matches(&concrete));
        assert!(!Tenancy::new("default", "api").matches(&concrete));
    }

    #[test]
    fn same_reference_ignores_uid_and_version() {
        let a = ResourceId::new(Type::new("catalog", "v2beta1", "Node"), Tenancy::new("default", ""), "n1").with_uid("a");
        let mut b = a.clone().with_uid("b");
        b.ty.group_version = "v1".into();
        assert!(a.same_reference(&b));
        assert_ne!(a, b);
    }
}
