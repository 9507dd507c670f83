//! Stored resources and the status they carry.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::id::ResourceId;

/// Conditions carried by a single status entry; almost always one or two.
pub type Conditions = SmallVec<[Condition; 2]>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ResourceId>,
    /// Opaque compare-and-swap token, changed by storage on every write.
    #[serde(default)]
    pub version: String,
    /// Bumped by storage whenever data, owner or metadata change.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Keyed by the writer that owns the entry (usually a controller).
    #[serde(default)]
    pub status: BTreeMap<String, Status>,
}

impl Resource {
    pub fn new(id: ResourceId, data: serde_json::Value) -> Self {
        Self {
            id,
            owner: None,
            version: String::new(),
            generation: 0,
            metadata: BTreeMap::new(),
            data,
            status: BTreeMap::new(),
        }
    }

    /// Decode the data payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// True when the user-controlled parts of two resources match. Status,
    /// version and generation are not compared.
    pub fn spec_eq(&self, other: &Resource) -> bool {
        self.data == other.data && self.owner == other.owner && self.metadata == other.metadata
    }
}

/// One writer's observation of a resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub observed_generation: u64,
    #[serde(default)]
    pub conditions: Conditions,
}

impl Status {
    pub fn condition(&self, ty: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.ty == ty)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionState {
    #[default]
    Unknown,
    True,
    False,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub ty: String,
    pub state: ConditionState,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Consistency requested for point reads and lists.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Served from the most recently published snapshot; may lag the leader.
    #[default]
    Eventual,
    /// Served from the authoritative copy.
    Strong,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Upsert,
    Delete,
}

/// A mutation observed on the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// State after the write, or the last stored state for deletions.
    pub resource: Resource,
}

impl WatchEvent {
    pub fn upsert(resource: Resource) -> Self {
        Self { kind: EventKind::Upsert, resource }
    }

    pub fn delete(resource: Resource) -> Self {
        Self { kind: EventKind::Delete, resource }
    }
}
