//! Regent storage: the backend contract consumed by the resource service and
//! an in-memory engine implementing it.
//!
//! The contract mirrors what a replicated KV engine offers: point reads at a
//! chosen consistency, compare-and-swap writes keyed by an opaque version,
//! owner-indexed listing, and a fan-out of every mutation.

#![forbid(unsafe_code)]

use regent_core::{ReadConsistency, Resource, ResourceId, Tenancy, Type, WatchEvent};
use tokio::sync::broadcast;

mod mem;

pub use mem::{BackendStats, MemBackend};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StorageError {
    #[error("resource not found")]
    NotFound,
    #[error("CAS operation failed because the given version doesn't match what is stored")]
    CasFailure,
    #[error("requested uid doesn't match the uid of the stored resource")]
    WrongUid,
    #[error(transparent)]
    GroupVersionMismatch(#[from] GroupVersionMismatch),
    #[error("storage backend: {0}")]
    Internal(String),
}

/// The stored resource was written with a different group version than the
/// one requested.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("resource was requested with GroupVersion={requested:?}, but stored with GroupVersion={stored:?}")]
pub struct GroupVersionMismatch {
    pub requested: String,
    pub stored: String,
    pub stored_type: Type,
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Point read. An empty `id.uid` matches whatever is stored under the name;
    /// a non-empty uid that differs from the stored one is `NotFound`.
    async fn read(&self, consistency: ReadConsistency, id: &ResourceId) -> StorageResult<Resource>;

    /// Compare-and-swap write. An empty `version` means "create"; it fails
    /// with `CasFailure` if the resource already exists. The returned resource
    /// carries the new version, generation and uid.
    async fn write_cas(&self, res: Resource) -> StorageResult<Resource>;

    /// Compare-and-swap delete. Deleting an absent resource (or a different
    /// incarnation of it, by uid) is not an error. An empty `version` deletes
    /// unconditionally.
    async fn delete_cas(&self, id: &ResourceId, version: &str) -> StorageResult<()>;

    /// List resources of a kind (any group version) within a tenancy filter.
    async fn list(
        &self,
        consistency: ReadConsistency,
        ty: &Type,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>>;

    /// Strongly consistent list of every resource whose owner is `owner`.
    async fn list_by_owner(&self, owner: &ResourceId) -> StorageResult<Vec<Resource>>;

    /// Subscribe to every mutation, in commit order.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
