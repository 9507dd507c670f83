//! Regent core types: resource identity, stored resources, status and watch events.

#![forbid(unsafe_code)]

pub mod id;
pub mod resource;

pub use id::{ResourceId, Tenancy, Type, DEFAULT_TENANCY, WILDCARD};
pub use resource::{
    Condition, ConditionState, Conditions, EventKind, ReadConsistency, Resource, Status, WatchEvent,
};

pub mod prelude {
    pub use super::{
        Condition, ConditionState, EventKind, ReadConsistency, Resource, ResourceId, Status, Tenancy, Type,
        WatchEvent,
    };
}
