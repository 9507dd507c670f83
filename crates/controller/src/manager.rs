use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, histogram};
use regent_core::{Tenancy, Type};
use regent_service::{Context, ListRequest, ResourceClient};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::controller::{Controller, DependencyMapper, Reconciler, Request, Runtime};
use crate::queue::WorkQueue;

const WATCH_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("controller {0} has no reconciler")]
    MissingReconciler(String),
    #[error("controller {0} already registered")]
    Duplicate(String),
}

/// Process-wide leadership flag. Flipping it does not interrupt work in flight.
#[derive(Debug, Default)]
pub struct Leadership {
    leader: AtomicBool,
    changed: Notify,
}

impl Leadership {
    pub fn set(&self, leader: bool) {
        if self.leader.swap(leader, Ordering::SeqCst) != leader {
            info!(leader, "leadership changed");
            self.changed.notify_waiters();
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// `false` if cancelled first.
    async fn wait(&self, cancel: &CancellationToken) -> bool {
        loop {
            let changed = self.changed.notified();
            if self.is_leader() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = changed => {}
            }
        }
    }
}

/// Runs every registered controller: one watch per triggering type and a
/// pool of workers draining a coalescing queue.
pub struct Manager {
    client: Arc<dyn ResourceClient>,
    controllers: Vec<Controller>,
    leadership: Arc<Leadership>,
    token: Option<String>,
}

impl Manager {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client, controllers: Vec::new(), leadership: Arc::new(Leadership::default()), token: None }
    }

    /// Token controllers present to the resource service.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn register(&mut self, controller: Controller) -> Result<(), ManagerError> {
        if controller.reconciler.is_none() {
            return Err(ManagerError::MissingReconciler(controller.name));
        }
        if self.controllers.iter().any(|c| c.name == controller.name) {
            return Err(ManagerError::Duplicate(controller.name));
        }
        debug!(controller = %controller.name, managed = %controller.managed, "controller registered");
        self.controllers.push(controller);
        Ok(())
    }

    pub fn set_leader(&self, leader: bool) {
        self.leadership.set(leader);
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Shared handle for whatever drives leader election.
    pub fn leadership(&self) -> Arc<Leadership> {
        Arc::clone(&self.leadership)
    }

    /// Blocks until `cancel` fires, then waits for watches and workers to stop.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for c in &self.controllers {
            let Some(reconciler) = c.reconciler.clone() else { continue };
            let queue = Arc::new(WorkQueue::new(
                c.name.clone(),
                c.options.queue_capacity,
                c.options.base_backoff,
                c.options.max_backoff,
            ));
            let mut ctx = Context::background().with_cancel(cancel.child_token());
            if let Some(token) = &self.token {
                ctx = ctx.with_token(token.clone());
            }

            let mut triggers: Vec<(Type, Option<DependencyMapper>)> = vec![(c.managed.clone(), None)];
            triggers.extend(c.watches.iter().map(|(t, m)| (t.clone(), Some(Arc::clone(m)))));
            for (ty, mapper) in triggers {
                let watch = Watch {
                    controller: c.name.clone(),
                    ty,
                    mapper,
                    client: Arc::clone(&self.client),
                    queue: Arc::clone(&queue),
                    ctx: ctx.clone(),
                };
                tasks.push(tokio::spawn(watch.run()));
            }

            let rt = Runtime { client: Arc::clone(&self.client), controller: c.name.clone() };
            for worker in 0..c.options.workers.max(1) {
                let w = Worker {
                    worker,
                    rt: rt.clone(),
                    reconciler: Arc::clone(&reconciler),
                    queue: Arc::clone(&queue),
                    leadership: Arc::clone(&self.leadership),
                    ctx: ctx.clone(),
                };
                tasks.push(tokio::spawn(w.run()));
            }
            info!(controller = %c.name, managed = %c.managed, workers = c.options.workers.max(1), "controller started");
        }

        cancel.cancelled().await;
        for res in join_all(tasks).await {
            if let Err(e) = res {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller manager stopped");
    }
}

struct Watch {
    controller: String,
    ty: Type,
    mapper: Option<DependencyMapper>,
    client: Arc<dyn ResourceClient>,
    queue: Arc<WorkQueue>,
    ctx: Context,
}

impl Watch {
    async fn run(self) {
        let cancel = self.ctx.cancel_token().clone();
        while !cancel.is_cancelled() {
            let req = ListRequest::new(self.ty.clone(), Tenancy::wildcard());
            match self.client.watch_list(&self.ctx, req).await {
                Ok(mut stream) => {
                    debug!(controller = %self.controller, ty = %self.ty, "watch established");
                    loop {
                        let ev = tokio::select! {
                            _ = cancel.cancelled() => None,
                            ev = stream.rx.recv() => ev,
                        };
                        let Some(ev) = ev else { break };
                        let target = match &self.mapper {
                            None => Some(ev.resource.id),
                            Some(map) => map(&ev.resource),
                        };
                        if let Some(id) = target {
                            self.queue.add(id);
                        }
                    }
                    stream.cancel.cancel();
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(controller = %self.controller, ty = %self.ty, "watch closed; re-establishing");
                }
                Err(e) => {
                    warn!(controller = %self.controller, ty = %self.ty, error = %e, "watch failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCH_RETRY) => {}
            }
        }
    }
}

struct Worker {
    worker: usize,
    rt: Runtime,
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    leadership: Arc<Leadership>,
    ctx: Context,
}

impl Worker {
    async fn run(self) {
        let cancel = self.ctx.cancel_token().clone();
        loop {
            if !self.leadership.wait(&cancel).await {
                break;
            }
            let Some(id) = self.queue.next(&cancel).await else { break };
            // Leadership may have changed while this worker sat in `next`.
            if !self.leadership.is_leader() {
                debug!(controller = %self.rt.controller, id = %id, "not leader; returning request");
                self.queue.release(&id);
                continue;
            }
            let span = info_span!("reconcile", controller = %self.rt.controller, worker = self.worker, id = %id);
            let started = Instant::now();
            let res = self
                .reconciler
                .reconcile(&self.ctx, &self.rt, Request { id: id.clone() })
                .instrument(span)
                .await;
            let took = started.elapsed();
            histogram!("controller_reconcile_ms", took.as_secs_f64() * 1000.0, "controller" => self.rt.controller.clone());
            match res {
                Ok(()) => {
                    counter!("controller_reconcile_total", 1u64, "controller" => self.rt.controller.clone(), "outcome" => "ok");
                    debug!(controller = %self.rt.controller, id = %id, took_ms = %took.as_millis(), "reconciled");
                    self.queue.done(&id, true);
                }
                Err(e) => {
                    counter!("controller_reconcile_total", 1u64, "controller" => self.rt.controller.clone(), "outcome" => "error");
                    warn!(controller = %self.rt.controller, id = %id, error = %format!("{e:#}"), "reconcile failed; backing off");
                    self.queue.done(&id, false);
                }
            }
        }
        debug!(controller = %self.rt.controller, worker = self.worker, "worker stopped");
    }
}
