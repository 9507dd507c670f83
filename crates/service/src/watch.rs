use std::sync::Arc;

use metrics::counter;
use regent_core::{ReadConsistency, WatchEvent};
use regent_store::Backend;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::list::ListScope;
use crate::{storage_error, ApiResult, CancelHandle, Context, ListRequest, ResourceService, StreamHandle};

impl ResourceService {
    pub(crate) async fn handle_watch_list(&self, ctx: &Context, req: ListRequest) -> ApiResult<StreamHandle<WatchEvent>> {
        let scope = self.list_scope(ctx, req)?;
        // Subscribe before the initial list so nothing falls between the two.
        let events = self.backend.watch();
        let initial = ctx.run(snapshot(&*self.backend, &scope)).await??;

        let (tx, rx) = mpsc::channel::<WatchEvent>(self.config.watch_buffer.max(1));
        let backend = Arc::clone(&self.backend);
        let cancel = ctx.cancel_token().clone();
        info!(ty = %scope.req.ty, tenancy = %scope.req.tenancy, initial = initial.len(), "watch start");
        let task = tokio::spawn(async move {
            pump(backend, scope, events, initial, tx, cancel).await;
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { task: Some(task) } })
    }
}

/// Visible items as upserts. A failing read hook fails the whole snapshot.
async fn snapshot(backend: &dyn Backend, scope: &ListScope) -> ApiResult<Vec<WatchEvent>> {
    let items = backend
        .list(ReadConsistency::Strong, &scope.req.ty, &scope.req.tenancy, &scope.req.name_prefix)
        .await
        .map_err(|e| storage_error("watch", e))?;
    let mut out = Vec::with_capacity(items.len());
    for r in items {
        if scope.matches(&r) && scope.visible(&r)? {
            out.push(WatchEvent::upsert(r));
        }
    }
    Ok(out)
}

async fn pump(
    backend: Arc<dyn Backend>,
    scope: ListScope,
    mut events: broadcast::Receiver<WatchEvent>,
    initial: Vec<WatchEvent>,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    for ev in initial {
        if tx.send(ev).await.is_err() {
            return;
        }
    }
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = events.recv() => ev,
        };
        match ev {
            Ok(ev) => {
                if !scope.matches(&ev.resource) {
                    continue;
                }
                match scope.visible(&ev.resource) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        // Closing makes the watcher re-establish instead of missing the event.
                        warn!(id = %ev.resource.id, error = %e, "watch acl check failed; closing stream");
                        break;
                    }
                }
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(ty = %scope.req.ty, missed, "watch lagged; replaying current state");
                counter!("resource_watch_restarts_total", 1u64);
                events = events.resubscribe();
                let replay = match snapshot(&*backend, &scope).await {
                    Ok(replay) => replay,
                    Err(e) => {
                        warn!(error = %e, "watch replay failed; closing stream");
                        break;
                    }
                };
                for ev in replay {
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(ty = %scope.req.ty, "watch ended");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use regent_core::{EventKind, Resource, ResourceId, Tenancy, Type};
    use regent_registry::{AclError, AclHooks, Authorizer, AuthorizerContext, Decision, Registration, Scope};

    use crate::testing::{resource, Harness};
    use crate::{Code, Context, ListRequest, ResourceClient};

    /// Read hook that cannot evaluate resources named "broken".
    struct BrokenHook;

    impl AclHooks for BrokenHook {
        fn read(
            &self,
            _authz: &dyn Authorizer,
            _ctx: &AuthorizerContext,
            id: &ResourceId,
            res: Option<&Resource>,
        ) -> Result<Decision, AclError> {
            match res {
                Some(_) if id.name == "broken" => Err(AclError::Other("policy backend unavailable".into())),
                _ => Ok(Decision::Allow),
            }
        }
    }

    fn broken_harness() -> Harness {
        Harness::builder()
            .register(Registration::new(thing(), Scope::Namespace).with_acls(BrokenHook))
            .build()
            .unwrap()
    }

    fn thing() -> Type {
        Type::new("demo", "v1", "Thing")
    }

    #[tokio::test]
    async fn watch_replays_state_then_streams_changes() {
        let h = Harness::builder().register(Registration::new(thing(), Scope::Namespace)).build().unwrap();
        let first = resource(thing(), "a").write(&*h.service).await.unwrap();

        let ctx = Context::background();
        let mut stream = h.service.watch_list(&ctx, ListRequest::new(thing(), Tenancy::default())).await.unwrap();
        let ev = stream.rx.recv().await.unwrap();
        assert_eq!((ev.kind, ev.resource.id.clone()), (EventKind::Upsert, first.id.clone()));

        // Outside the filter.
        resource(thing(), "b").with_tenancy(Tenancy::new("default", "bar")).write(&*h.service).await.unwrap();
        let second = resource(thing(), "c").write(&*h.service).await.unwrap();
        h.service.delete(&ctx, &first.id, "").await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(1), stream.rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.resource.id, second.id);
        let ev = tokio::time::timeout(Duration::from_secs(1), stream.rx.recv()).await.unwrap().unwrap();
        assert_eq!((ev.kind, ev.resource.id), (EventKind::Delete, first.id));

        stream.cancel.cancel();
    }

    #[tokio::test]
    async fn cancelled_context_ends_the_stream() {
        let h = Harness::builder().register(Registration::new(thing(), Scope::Namespace)).build().unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let ctx = Context::background().with_cancel(cancel.clone());
        let mut stream = h.service.watch_list(&ctx, ListRequest::new(thing(), Tenancy::wildcard())).await.unwrap();
        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.rx.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn failing_acl_hook_closes_the_stream() {
        let h = broken_harness();
        resource(thing(), "a").write(&*h.service).await.unwrap();

        let ctx = Context::background();
        let mut stream = h.service.watch_list(&ctx, ListRequest::new(thing(), Tenancy::default())).await.unwrap();
        assert_eq!(stream.rx.recv().await.unwrap().resource.id.name, "a");

        resource(thing(), "broken").write(&*h.service).await.unwrap();
        resource(thing(), "c").write(&*h.service).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.rx.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn failing_acl_hook_fails_the_initial_snapshot() {
        let h = broken_harness();
        resource(thing(), "broken").write(&*h.service).await.unwrap();
        let err = h
            .service
            .watch_list(&Context::background(), ListRequest::new(thing(), Tenancy::default()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn cancelled_context_skips_the_initial_snapshot() {
        let h = Harness::builder().register(Registration::new(thing(), Scope::Namespace)).build().unwrap();
        resource(thing(), "a").write(&*h.service).await.unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let ctx = Context::background().with_cancel(cancel);
        let before = h.backend.stats().strong_reads;
        let err = h.service.watch_list(&ctx, ListRequest::new(thing(), Tenancy::default())).await.err().unwrap();
        assert_eq!(err.code(), Code::Canceled);
        assert_eq!(h.backend.stats().strong_reads, before);
    }
}
