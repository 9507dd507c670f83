//! In-memory backend.
//!
//! Writes go to a mutex-guarded primary map and then publish an immutable
//! snapshot through `ArcSwap`; eventually consistent reads load the snapshot
//! without touching the primary lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use regent_core::{ReadConsistency, Resource, ResourceId, Tenancy, Type, WatchEvent};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{Backend, GroupVersionMismatch, StorageError, StorageResult};

/// Storage key: group and kind (not version), tenancy, name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    group: String,
    kind: String,
    tenancy: Tenancy,
    name: String,
}

impl Key {
    fn of(id: &ResourceId) -> Self {
        Self {
            group: id.ty.group.clone(),
            kind: id.ty.kind.clone(),
            tenancy: id.tenancy.clone(),
            name: id.name.clone(),
        }
    }
}

type Items = FxHashMap<Key, Arc<Resource>>;

#[derive(Default)]
struct Snapshot {
    epoch: u64,
    items: Items,
}

#[derive(Default)]
struct Primary {
    items: Items,
    last_version: u64,
    epoch: u64,
}

/// Counters describing how the backend has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub strong_reads: u64,
    pub eventual_reads: u64,
    pub writes: u64,
    pub epoch: u64,
}

pub struct MemBackend {
    primary: Mutex<Primary>,
    replica: ArcSwap<Snapshot>,
    events: broadcast::Sender<WatchEvent>,
    strong_reads: AtomicU64,
    eventual_reads: AtomicU64,
    writes: AtomicU64,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// `cap` bounds how far a watcher may fall behind before it lags.
    pub fn with_capacity(cap: usize) -> Self {
        let (events, _) = broadcast::channel(cap.max(1));
        Self {
            primary: Mutex::new(Primary::default()),
            replica: ArcSwap::from_pointee(Snapshot::default()),
            events,
            strong_reads: AtomicU64::new(0),
            eventual_reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            strong_reads: self.strong_reads.load(Ordering::Relaxed),
            eventual_reads: self.eventual_reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            epoch: self.replica.load().epoch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Primary> {
        self.primary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the primary as the new replica snapshot and fan out the event.
    fn commit(&self, primary: &mut Primary, event: WatchEvent) {
        primary.epoch = primary.epoch.saturating_add(1);
        self.replica.store(Arc::new(Snapshot { epoch: primary.epoch, items: primary.items.clone() }));
        self.writes.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn check_read(id: &ResourceId, stored: &Resource) -> StorageResult<Resource> {
        if !id.uid.is_empty() && id.uid != stored.id.uid {
            return Err(StorageError::NotFound);
        }
        if id.ty.group_version != stored.id.ty.group_version {
            return Err(GroupVersionMismatch {
                requested: id.ty.group_version.clone(),
                stored: stored.id.ty.group_version.clone(),
                stored_type: stored.id.ty.clone(),
            }
            .into());
        }
        Ok(stored.clone())
    }

    fn matches(res: &Resource, ty: &Type, tenancy: &Tenancy, name_prefix: &str) -> bool {
        res.id.ty.same_kind(ty) && tenancy.matches(&res.id.tenancy) && res.id.name.starts_with(name_prefix)
    }
}

#[async_trait::async_trait]
impl Backend for MemBackend {
    async fn read(&self, consistency: ReadConsistency, id: &ResourceId) -> StorageResult<Resource> {
        let key = Key::of(id);
        match consistency {
            ReadConsistency::Strong => {
                self.strong_reads.fetch_add(1, Ordering::Relaxed);
                let primary = self.lock();
                let stored = primary.items.get(&key).ok_or(StorageError::NotFound)?;
                Self::check_read(id, stored)
            }
            ReadConsistency::Eventual => {
                self.eventual_reads.fetch_add(1, Ordering::Relaxed);
                let snap = self.replica.load();
                let stored = snap.items.get(&key).ok_or(StorageError::NotFound)?;
                Self::check_read(id, stored)
            }
        }
    }

    async fn write_cas(&self, mut res: Resource) -> StorageResult<Resource> {
        let started = Instant::now();
        let key = Key::of(&res.id);
        let mut primary = self.lock();

        match primary.items.get(&key) {
            None => {
                if !res.version.is_empty() {
                    return Err(StorageError::CasFailure);
                }
                if res.id.uid.is_empty() {
                    res.id.uid = Uuid::new_v4().to_string();
                }
                res.generation = 1;
            }
            Some(existing) => {
                if res.version.is_empty() || res.version != existing.version {
                    return Err(StorageError::CasFailure);
                }
                if !res.id.uid.is_empty() && res.id.uid != existing.id.uid {
                    return Err(StorageError::WrongUid);
                }
                res.id.uid = existing.id.uid.clone();
                res.generation = if res.spec_eq(existing) {
                    existing.generation
                } else {
                    existing.generation.saturating_add(1)
                };
            }
        }

        primary.last_version = primary.last_version.saturating_add(1);
        res.version = primary.last_version.to_string();
        let stored = Arc::new(res);
        primary.items.insert(key, Arc::clone(&stored));
        let out = (*stored).clone();
        self.commit(&mut primary, WatchEvent::upsert(out.clone()));
        drop(primary);

        trace!(id = %out.id, version = %out.version, generation = out.generation, "write committed");
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_writes_total", 1u64, "op" => "write");
        Ok(out)
    }

    async fn delete_cas(&self, id: &ResourceId, version: &str) -> StorageResult<()> {
        let key = Key::of(id);
        let mut primary = self.lock();
        let existing = match primary.items.get(&key) {
            Some(existing) => existing,
            None => return Ok(()),
        };
        if !id.uid.is_empty() && id.uid != existing.id.uid {
            debug!(id = %id, stored_uid = %existing.id.uid, "delete targets an older incarnation; nothing to do");
            return Ok(());
        }
        if !version.is_empty() && version != existing.version {
            return Err(StorageError::CasFailure);
        }
        let removed = primary.items.remove(&key).ok_or(StorageError::NotFound)?;
        self.commit(&mut primary, WatchEvent::delete((*removed).clone()));
        counter!("store_writes_total", 1u64, "op" => "delete");
        Ok(())
    }

    async fn list(
        &self,
        consistency: ReadConsistency,
        ty: &Type,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        let collect = |items: &Items| -> Vec<Resource> {
            let mut out: Vec<Resource> = items
                .values()
                .filter(|r| Self::matches(r, ty, tenancy, name_prefix))
                .map(|r| (**r).clone())
                .collect();
            out.sort_by(|a, b| a.id.tenancy.cmp(&b.id.tenancy).then_with(|| a.id.name.cmp(&b.id.name)));
            out
        };
        match consistency {
            ReadConsistency::Strong => {
                self.strong_reads.fetch_add(1, Ordering::Relaxed);
                Ok(collect(&self.lock().items))
            }
            ReadConsistency::Eventual => {
                self.eventual_reads.fetch_add(1, Ordering::Relaxed);
                Ok(collect(&self.replica.load().items))
            }
        }
    }

    async fn list_by_owner(&self, owner: &ResourceId) -> StorageResult<Vec<Resource>> {
        self.strong_reads.fetch_add(1, Ordering::Relaxed);
        let primary = self.lock();
        let mut out: Vec<Resource> = primary
            .items
            .values()
            .filter(|r| match &r.owner {
                Some(o) => o.same_reference(owner) && o.uid == owner.uid,
                None => false,
            })
            .map(|r| (**r).clone())
            .collect();
        out.sort_by(|a, b| a.id.name.cmp(&b.id.name));
        Ok(out)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
