//! Regent resource service.
//!
//! Every read and write passes through here: request validation against the
//! type registry, tenancy defaulting and existence checks, ACL enforcement
//! through the per-type hooks, and mapping of storage outcomes onto a small
//! set of error codes. Controllers and frontends depend on the
//! [`ResourceClient`] trait rather than on [`ResourceService`] directly.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use regent_core::{ReadConsistency, Resource, ResourceId, Status, Tenancy, Type, WatchEvent};
use regent_registry::{AclError, Authorizer, AuthorizerContext, Registration, Registry, ValidationError};
use regent_store::{Backend, StorageError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod auth;
mod delete;
mod list;
mod read;
pub mod tenancy;
pub mod testing;
mod validate;
mod watch;
mod write;

pub use auth::{AclResolver, StaticAclResolver};
pub use tenancy::{EnterpriseMeta, StaticTenancyBridge, TenancyBridge};

/// Error codes surfaced to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Aborted,
    FailedPrecondition,
    Canceled,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "invalid_argument",
            Code::NotFound => "not_found",
            Code::PermissionDenied => "permission_denied",
            Code::Aborted => "aborted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Canceled => "canceled",
            Code::Internal => "internal",
        }
    }
}

/// API errors, serializable so they survive a transport hop.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("permission_denied: {0}")]
    PermissionDenied(String),
    /// Lost a compare-and-swap race; re-read and retry.
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("failed_precondition: {0}")]
    FailedPrecondition(String),
    #[error("canceled: {0}")]
    Canceled(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> Code {
        match self {
            ApiError::InvalidArgument(_) => Code::InvalidArgument,
            ApiError::NotFound(_) => Code::NotFound,
            ApiError::PermissionDenied(_) => Code::PermissionDenied,
            ApiError::Aborted(_) => Code::Aborted,
            ApiError::FailedPrecondition(_) => Code::FailedPrecondition,
            ApiError::Canceled(_) => Code::Canceled,
            ApiError::Internal(_) => Code::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Code::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.code() == Code::Aborted
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::InvalidArgument(err.to_string())
    }
}

impl From<AclError> for ApiError {
    fn from(err: AclError) -> Self {
        match err {
            AclError::PermissionDenied { .. } => ApiError::PermissionDenied(err.to_string()),
            AclError::TokenNotFound => ApiError::PermissionDenied(err.to_string()),
            AclError::Other(msg) => ApiError::Internal(format!("failed to evaluate acl: {msg}")),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Code of an [`ApiError`] anywhere in an `anyhow` chain.
pub fn code_of(err: &anyhow::Error) -> Option<Code> {
    err.chain().find_map(|e| e.downcast_ref::<ApiError>()).map(ApiError::code)
}

/// Per-call context: caller token, read consistency and cancellation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: Option<String>,
    consistency: ReadConsistency,
    cancel: CancellationToken,
}

impl Context {
    /// Anonymous, eventually consistent, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_consistency(mut self, consistency: ReadConsistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Same caller, cancelled together with `self` or on its own.
    pub fn child(&self) -> Self {
        Self { token: self.token.clone(), consistency: self.consistency, cancel: self.cancel.child_token() }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn consistency(&self) -> ReadConsistency {
        self.consistency
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` unless the context is cancelled first.
    pub async fn run<F: Future>(&self, fut: F) -> ApiResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ApiError::Canceled("context canceled".into())),
            out = fut => Ok(out),
        }
    }
}

/// List and watch filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRequest {
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default)]
    pub tenancy: Tenancy,
    #[serde(default)]
    pub name_prefix: String,
}

impl ListRequest {
    pub fn new(ty: Type, tenancy: Tenancy) -> Self {
        Self { ty, tenancy, name_prefix: String::new() }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

/// Replace one status entry of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteStatusRequest {
    /// Must carry the uid of the incarnation being observed.
    pub id: ResourceId,
    /// Empty means "whatever is stored"; otherwise compared against the stored version.
    #[serde(default)]
    pub version: String,
    pub key: String,
    pub status: Status,
}

pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Receiving side of a streaming call.
pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Resource API surface.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Point read at the context's consistency.
    async fn read(&self, ctx: &Context, id: &ResourceId) -> ApiResult<Resource>;

    /// Create or update. An empty version is a blind write; statuses on the
    /// request are ignored and the stored ones carried over.
    async fn write(&self, ctx: &Context, res: Resource) -> ApiResult<Resource>;

    async fn write_status(&self, ctx: &Context, req: WriteStatusRequest) -> ApiResult<Resource>;

    /// Deleting something that is already gone succeeds.
    async fn delete(&self, ctx: &Context, id: &ResourceId, version: &str) -> ApiResult<()>;

    async fn list(&self, ctx: &Context, req: ListRequest) -> ApiResult<Vec<Resource>>;

    /// Strongly consistent list of everything owned by `owner` (uid required).
    async fn list_by_owner(&self, ctx: &Context, owner: &ResourceId) -> ApiResult<Vec<Resource>>;

    /// Current state as upserts, then every change. After a lag the current
    /// state is replayed.
    async fn watch_list(&self, ctx: &Context, req: ListRequest) -> ApiResult<StreamHandle<WatchEvent>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Attempts for blind writes that lose a CAS race.
    pub write_retries: u32,
    #[serde(with = "millis")]
    pub write_retry_backoff: Duration,
    /// Per-watch channel capacity.
    pub watch_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { write_retries: 5, write_retry_backoff: Duration::from_millis(10), watch_buffer: 1024 }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// In-process implementation of [`ResourceClient`].
pub struct ResourceService {
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    tenancy: Arc<dyn TenancyBridge>,
    acls: Arc<dyn AclResolver>,
    config: ServiceConfig,
}

impl ResourceService {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        tenancy: Arc<dyn TenancyBridge>,
        acls: Arc<dyn AclResolver>,
    ) -> Self {
        Self { registry, backend, tenancy, acls, config: ServiceConfig::default() }
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn resolve_type(&self, ty: &Type) -> ApiResult<Registration> {
        self.registry
            .resolve(ty)
            .cloned()
            .ok_or_else(|| ApiError::InvalidArgument(format!("resource type {ty} not registered")))
    }

    /// Resolve the caller's authorizer. Defaults for empty units in `ent` are
    /// filled in by the resolver.
    pub(crate) fn authorizer(
        &self,
        ctx: &Context,
        ent: &mut EnterpriseMeta,
    ) -> ApiResult<(Arc<dyn Authorizer>, AuthorizerContext)> {
        self.acls.resolve(ctx.token(), ent).map_err(|err| match err {
            AclError::TokenNotFound => ApiError::PermissionDenied(err.to_string()),
            other => ApiError::Internal(format!("failed getting authorizer: {other}")),
        })
    }
}

pub(crate) fn storage_error(op: &str, err: StorageError) -> ApiError {
    match err {
        StorageError::NotFound => ApiError::NotFound(err.to_string()),
        StorageError::CasFailure => ApiError::Aborted(err.to_string()),
        StorageError::WrongUid => ApiError::FailedPrecondition(err.to_string()),
        StorageError::GroupVersionMismatch(_) => ApiError::InvalidArgument(err.to_string()),
        StorageError::Internal(_) => ApiError::Internal(format!("failed {op}: {err}")),
    }
}

fn observe<T>(op: &'static str, started: Instant, res: &ApiResult<T>) {
    let code = match res {
        Ok(_) => "ok",
        Err(e) => e.code().as_str(),
    };
    let name = match op {
        "read" => "resource_read_total",
        "write" | "write_status" | "delete" => "resource_write_total",
        _ => "resource_list_total",
    };
    counter!(name, 1u64, "op" => op, "outcome" => code);
    histogram!("resource_request_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
    if let Err(e) = res {
        debug!(op, error = %e, took_ms = %started.elapsed().as_millis(), "resource request failed");
    }
}

#[async_trait::async_trait]
impl ResourceClient for ResourceService {
    async fn read(&self, ctx: &Context, id: &ResourceId) -> ApiResult<Resource> {
        let started = Instant::now();
        let res = self.handle_read(ctx, id).await;
        observe("read", started, &res);
        res
    }

    async fn write(&self, ctx: &Context, res: Resource) -> ApiResult<Resource> {
        let started = Instant::now();
        let out = self.handle_write(ctx, res).await;
        observe("write", started, &out);
        out
    }

    async fn write_status(&self, ctx: &Context, req: WriteStatusRequest) -> ApiResult<Resource> {
        let started = Instant::now();
        let out = self.handle_write_status(ctx, req).await;
        observe("write_status", started, &out);
        out
    }

    async fn delete(&self, ctx: &Context, id: &ResourceId, version: &str) -> ApiResult<()> {
        let started = Instant::now();
        let out = self.handle_delete(ctx, id, version).await;
        observe("delete", started, &out);
        out
    }

    async fn list(&self, ctx: &Context, req: ListRequest) -> ApiResult<Vec<Resource>> {
        let started = Instant::now();
        let out = self.handle_list(ctx, req).await;
        observe("list", started, &out);
        out
    }

    async fn list_by_owner(&self, ctx: &Context, owner: &ResourceId) -> ApiResult<Vec<Resource>> {
        let started = Instant::now();
        let out = self.handle_list_by_owner(ctx, owner).await;
        observe("list_by_owner", started, &out);
        out
    }

    async fn watch_list(&self, ctx: &Context, req: ListRequest) -> ApiResult<StreamHandle<WatchEvent>> {
        let started = Instant::now();
        let out = self.handle_watch_list(ctx, req).await;
        observe("watch_list", started, &out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_conversions() {
        let err: ApiError = ValidationError::missing("id.name").into();
        assert_eq!(err, ApiError::InvalidArgument("id.name is required".into()));

        let err: ApiError = AclError::PermissionDenied { accessor: "a".into(), permission: "operator:read".into() }.into();
        assert_eq!(err.code(), Code::PermissionDenied);

        let wrapped = anyhow::Error::new(ApiError::Aborted("lost race".into())).context("writing status");
        assert_eq!(code_of(&wrapped), Some(Code::Aborted));
        assert_eq!(code_of(&anyhow::anyhow!("plain")), None);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let cancel = CancellationToken::new();
        let ctx = Context::background().with_cancel(cancel.clone());
        let child = ctx.child();
        cancel.cancel();
        assert!(child.is_cancelled());
        let out = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(out.unwrap_err().code(), Code::Canceled);
    }
}
