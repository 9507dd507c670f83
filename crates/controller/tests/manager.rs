#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regent_controller::{
    map_owner_filter_by_type, Controller, ControllerOptions, Manager, ManagerError, Reconciler, Request, Runtime,
};
use regent_core::{ResourceId, Type};
use regent_registry::{Registration, Scope};
use regent_service::testing::{resource, Harness};
use regent_service::{Context, ResourceClient};
use tokio_util::sync::CancellationToken;

fn thing() -> Type {
    Type::new("demo", "v1", "Thing")
}

fn part() -> Type {
    Type::new("demo", "v1", "Part")
}

fn harness() -> Harness {
    Harness::builder()
        .register(Registration::new(thing(), Scope::Namespace))
        .register(Registration::new(part(), Scope::Namespace))
        .build()
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<ResourceId>>>,
    /// Fail this many calls before succeeding.
    failures_left: Arc<AtomicU32>,
    active: Arc<Mutex<Vec<ResourceId>>>,
    overlapped: Arc<AtomicBool>,
    hold: Duration,
}

impl Recorder {
    fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|id| id.name == name).count()
    }
}

#[async_trait::async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, _ctx: &Context, rt: &Runtime, req: Request) -> anyhow::Result<()> {
        assert_eq!(rt.controller, "recorder");
        {
            let mut active = self.active.lock().unwrap();
            if active.contains(&req.id) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            active.push(req.id.clone());
        }
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.active.lock().unwrap().retain(|id| id != &req.id);
        self.calls.lock().unwrap().push(req.id);

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("transient failure");
        }
        Ok(())
    }
}

fn start(h: &Harness, rec: Recorder, leader: bool) -> (Arc<Manager>, CancellationToken, tokio::task::JoinHandle<()>) {
    let mut mgr = Manager::new(Arc::clone(&h.service) as Arc<dyn ResourceClient>);
    mgr.register(
        Controller::new("recorder", thing())
            .with_watch(part(), map_owner_filter_by_type(thing()))
            .with_reconciler(rec)
            .with_options(ControllerOptions { base_backoff: Duration::from_millis(2), ..Default::default() }),
    )
    .unwrap();
    mgr.set_leader(leader);
    let mgr = Arc::new(mgr);
    let cancel = CancellationToken::new();
    let task = {
        let mgr = Arc::clone(&mgr);
        let cancel = cancel.clone();
        tokio::spawn(async move { mgr.run(cancel).await })
    };
    (mgr, cancel, task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn managed_and_mapped_mutations_trigger_reconciles() {
    let h = harness();
    let rec = Recorder::default();
    let (_mgr, cancel, task) = start(&h, rec.clone(), true);

    let owner = resource(thing(), "a").write(&*h.service).await.unwrap();
    eventually(|| rec.count("a") >= 1).await;
    let before = rec.count("a");

    resource(part(), "p1").with_owner(owner.id.clone()).write(&*h.service).await.unwrap();
    eventually(|| rec.count("a") > before).await;
    // The part itself is never the subject.
    assert_eq!(rec.count("p1"), 0);
    assert!(rec.calls.lock().unwrap().iter().all(|id| id.uid == owner.id.uid));

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_wait_for_leadership() {
    let h = harness();
    let rec = Recorder::default();
    let (mgr, cancel, task) = start(&h, rec.clone(), false);

    resource(thing(), "a").write(&*h.service).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rec.count("a"), 0);

    mgr.set_leader(true);
    eventually(|| rec.count("a") >= 1).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_workers_stop_dispatching_after_leadership_loss() {
    let h = harness();
    let rec = Recorder::default();
    let (mgr, cancel, task) = start(&h, rec.clone(), true);

    resource(thing(), "a").write(&*h.service).await.unwrap();
    eventually(|| rec.count("a") >= 1).await;
    // Workers are now blocked waiting for work.
    tokio::time::sleep(Duration::from_millis(50)).await;

    mgr.set_leader(false);
    resource(thing(), "b").write(&*h.service).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rec.count("b"), 0);

    // The request was kept, not lost.
    mgr.set_leader(true);
    eventually(|| rec.count("b") >= 1).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_reconciles_are_retried() {
    let h = harness();
    let rec = Recorder { failures_left: Arc::new(AtomicU32::new(3)), ..Default::default() };
    let (_mgr, cancel, task) = start(&h, rec.clone(), true);

    resource(thing(), "a").write(&*h.service).await.unwrap();
    eventually(|| rec.count("a") >= 4).await;
    assert_eq!(rec.failures_left.load(Ordering::SeqCst), 0);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_worker_per_id_at_a_time() {
    let h = harness();
    let rec = Recorder { hold: Duration::from_millis(20), ..Default::default() };
    let (_mgr, cancel, task) = start(&h, rec.clone(), true);

    for n in 0..10 {
        resource(thing(), "a").with_data(serde_json::json!({ "n": n })).write(&*h.service).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    eventually(|| rec.count("a") >= 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!rec.overlapped.load(Ordering::SeqCst));

    cancel.cancel();
    task.await.unwrap();
}

#[test]
fn registration_is_checked() {
    let h = harness();
    let mut mgr = Manager::new(Arc::clone(&h.service) as Arc<dyn ResourceClient>);
    assert_eq!(
        mgr.register(Controller::new("bare", thing())),
        Err(ManagerError::MissingReconciler("bare".into()))
    );
    mgr.register(Controller::new("recorder", thing()).with_reconciler(Recorder::default())).unwrap();
    assert_eq!(
        mgr.register(Controller::new("recorder", part()).with_reconciler(Recorder::default())),
        Err(ManagerError::Duplicate("recorder".into()))
    );
}
