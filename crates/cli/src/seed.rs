//! Seed file: tenancies to create and resources to write at start-up.

use std::path::Path;

use anyhow::{anyhow, bail, Context as _, Result};
use regent_core::{Resource, ResourceId, Tenancy, Type};
use regent_service::{Context, ResourceClient, StaticTenancyBridge};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub tenancies: Vec<Tenancy>,
    #[serde(default)]
    pub resources: Vec<SeedResource>,
}

#[derive(Debug, Deserialize)]
pub struct SeedResource {
    /// `group.version.Kind`, e.g. `catalog.v2beta1.Node`.
    #[serde(rename = "type")]
    pub ty: String,
    pub name: String,
    #[serde(default)]
    pub tenancy: Tenancy,
    /// `Kind/name` of an earlier entry in the same file.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub fn parse_type(key: &str) -> Option<Type> {
    let parts: Vec<&str> = key.split('.').collect();
    match parts.as_slice() {
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Some(Type::new(*group, *version, *kind))
        }
        _ => None,
    }
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading seed file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing seed file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn install_tenancies(&self, bridge: &StaticTenancyBridge) {
        for t in &self.tenancies {
            if t.namespace.is_empty() {
                bridge.add_partition(&t.partition);
            } else {
                bridge.add_namespace(&t.partition, &t.namespace);
            }
        }
    }

    /// Write every resource in file order. Owners are resolved against the
    /// entries written before them.
    pub async fn apply(&self, ctx: &Context, client: &dyn ResourceClient) -> Result<Vec<Resource>> {
        let mut written: Vec<Resource> = Vec::with_capacity(self.resources.len());
        for entry in &self.resources {
            let ty = parse_type(&entry.ty).ok_or_else(|| anyhow!("invalid type {:?} for {}", entry.ty, entry.name))?;
            let mut res = Resource::new(ResourceId::new(ty, entry.tenancy.clone(), &entry.name), entry.data.clone());
            if let Some(owner) = &entry.owner {
                res.owner = Some(resolve_owner(&written, owner)?);
            }
            let stored = client.write(ctx, res).await.with_context(|| format!("writing {}", entry.name))?;
            debug!(id = %stored.id, version = %stored.version, "seeded");
            written.push(stored);
        }
        info!(resources = written.len(), "seed applied");
        Ok(written)
    }
}

fn resolve_owner(written: &[Resource], reference: &str) -> Result<ResourceId> {
    let Some((kind, name)) = reference.split_once('/') else {
        bail!("owner {reference:?} must look like Kind/name");
    };
    written
        .iter()
        .rev()
        .find(|r| r.id.ty.kind == kind && r.id.name == name)
        .map(|r| r.id.clone())
        .ok_or_else(|| anyhow!("owner {reference:?} is not defined earlier in the seed file"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"
tenancies:
  - { partition: default, namespace: default }
  - { partition: edge }
resources:
  - type: catalog.v2beta1.Node
    name: n1
    tenancy: { partition: default }
    data: { addresses: [{ host: 127.0.0.1 }] }
  - type: catalog.v2beta1.HealthStatus
    name: n1-ping
    owner: Node/n1
    data: { type: tcp, status: HEALTH_WARNING }
"#;

    #[test]
    fn parses_types() {
        assert_eq!(parse_type("catalog.v2beta1.Node"), Some(Type::new("catalog", "v2beta1", "Node")));
        assert_eq!(parse_type("catalog/v2beta1/Node"), None);
        assert_eq!(parse_type("catalog..Node"), None);
    }

    #[test]
    fn parses_seed_file() {
        let seed = Seed::parse(SEED).unwrap();
        assert_eq!(seed.tenancies.len(), 2);
        assert_eq!(seed.tenancies[1], Tenancy::new("edge", ""));
        assert_eq!(seed.resources[1].owner.as_deref(), Some("Node/n1"));
        assert_eq!(seed.resources[0].data["addresses"][0]["host"], "127.0.0.1");
    }

    #[test]
    fn owners_must_come_first() {
        let node = Resource::new(
            ResourceId::new(Type::new("catalog", "v2beta1", "Node"), Tenancy::new("default", ""), "n1").with_uid("u1"),
            serde_json::Value::Null,
        );
        assert_eq!(resolve_owner(&[node.clone()], "Node/n1").unwrap().uid, "u1");
        assert!(resolve_owner(&[node.clone()], "Node/n2").is_err());
        assert!(resolve_owner(&[node], "n1").is_err());
    }
}
