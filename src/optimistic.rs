//! Optimistic Mutation Engine.
//!
//! Executes "apply now, confirm later" mutations uniformly. Lifecycle of a
//! single tentative entry:
//!
//!   absent → tentative (local only) → confirmed (swapped for authoritative)
//!                                   ↘ rolled-back (removed)
//!
//! `confirmed` and `rolled-back` are terminal for one mutation attempt; a
//! new user action starts a fresh cycle. A tentative entry never survives a
//! completed cycle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{GatewayError, NoticeSender, SyncError};
use crate::reconciler::SelfMutationLedger;
use crate::types::{Keyed, RecordId};

/// Teardown token for a live collection. Revoked when the owning view-model
/// unmounts; the engine checks it before reconciling so a late remote
/// response never writes into a dead collection.
#[derive(Clone)]
pub struct ViewLease {
    active: Arc<AtomicBool>,
}

impl ViewLease {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Default for ViewLease {
    fn default() -> Self {
        Self::new()
    }
}

/// A live in-memory collection owned by one view-model.
///
/// Mutations go through [`Collection::mutate`], which bumps a revision
/// watch channel the UI re-renders on. Reads hand out snapshots; the lock
/// is never held across an await point.
pub struct Collection<T> {
    entries: Arc<Mutex<Vec<T>>>,
    lease: ViewLease,
    revision: Arc<watch::Sender<u64>>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            lease: self.lease.clone(),
            revision: Arc::clone(&self.revision),
        }
    }
}

/// Build a revision channel shared by several collections of one
/// view-model, so the UI watches a single signal.
pub fn shared_revision() -> Arc<watch::Sender<u64>> {
    let (tx, _rx) = watch::channel(0);
    Arc::new(tx)
}

impl<T: Clone> Collection<T> {
    pub fn new(lease: ViewLease) -> Self {
        Self::with_revision(lease, shared_revision())
    }

    pub fn with_revision(lease: ViewLease, revision: Arc<watch::Sender<u64>>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            lease,
            revision,
        }
    }

    pub fn lease(&self) -> &ViewLease {
        &self.lease
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revision channel. Bumped once per mutation; the UI observes it and
    /// pulls a fresh snapshot.
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn replace_all(&self, entries: Vec<T>) {
        *self.entries.lock() = entries;
        self.bump();
    }

    /// Run one closed mutation over the entries. The closure runs under the
    /// collection lock; keep it synchronous and cheap.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let result = {
            let mut entries = self.entries.lock();
            f(&mut entries)
        };
        self.bump();
        result
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

impl<T: Keyed + Clone> Collection<T> {
    pub fn find_persisted(&self, id: &str) -> Option<T> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.persisted_id() == Some(id))
            .cloned()
    }

    pub fn contains_persisted(&self, id: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.persisted_id() == Some(id))
    }

    /// Replace the entry with the same persisted id, or append. Idempotent
    /// under duplicate delivery.
    pub fn upsert(&self, record: T) {
        self.mutate(|entries| upsert_by_id(entries, record));
    }

    pub fn remove_persisted(&self, id: &str) -> bool {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| e.persisted_id() != Some(id));
            entries.len() != before
        })
    }
}

/// Id-keyed upsert over a plain entry vector, shared by confirm paths and
/// realtime merges.
pub fn upsert_by_id<T: Keyed + Clone>(entries: &mut Vec<T>, record: T) {
    let id = record.persisted_id().map(str::to_string);
    match id {
        Some(id) => {
            if let Some(slot) = entries
                .iter_mut()
                .find(|e| e.persisted_id() == Some(id.as_str()))
            {
                *slot = record;
            } else {
                entries.push(record);
            }
        }
        None => entries.push(record),
    }
}

/// Shared handles a mutation cycle needs besides the collection itself.
pub struct MutationCx<'a> {
    pub ledger: &'a SelfMutationLedger,
    pub notices: &'a NoticeSender,
    pub timeout: Duration,
    /// Short human label, used for the failure notice title and logging
    /// ("Post comment", "Move card").
    pub label: &'a str,
}

/// The core primitive: apply a local mutation synchronously, await the
/// remote call under a client-side timeout, then run exactly one of the
/// `confirm` / `rollback` closures.
///
/// `ledger_hint` is the persisted id to mark as recently-self-mutated on
/// success, for mutations whose target id is known up front (updates,
/// deletes, toggles). Creates resolve their id from the returned record via
/// [`create_entry`].
///
/// If the owning collection was torn down while the call was in flight,
/// neither closure runs and the outcome is [`SyncError::StaleCollection`],
/// which is never surfaced to the user.
pub async fn perform_optimistic<T, R, Fut>(
    cx: &MutationCx<'_>,
    collection: &Collection<T>,
    apply: impl FnOnce(&mut Vec<T>),
    remote: Fut,
    confirm: impl FnOnce(&mut Vec<T>, &R),
    rollback: impl FnOnce(&mut Vec<T>),
    ledger_hint: Option<&str>,
) -> Result<R, SyncError>
where
    T: Clone,
    Fut: Future<Output = Result<R, GatewayError>>,
{
    collection.mutate(apply);

    let outcome = match timeout(cx.timeout, remote).await {
        Ok(Ok(record)) => Ok(record),
        Ok(Err(err)) => Err(SyncError::Remote(err)),
        Err(_) => Err(SyncError::Timeout(cx.timeout.as_secs())),
    };

    if !collection.lease().is_active() {
        log::debug!(
            "{}: collection torn down mid-flight, dropping reconciliation",
            cx.label
        );
        return Err(SyncError::StaleCollection);
    }

    match outcome {
        Ok(record) => {
            collection.mutate(|entries| confirm(entries, &record));
            if let Some(id) = ledger_hint {
                cx.ledger.record(id);
            }
            Ok(record)
        }
        Err(err) => {
            collection.mutate(rollback);
            log::warn!("{}: remote write failed, rolled back: {}", cx.label, err);
            cx.notices.sync_failure(&format!("{} failed", cx.label), &err);
            Err(err)
        }
    }
}

/// Convenience over [`perform_optimistic`] for the common create shape on a
/// flat keyed collection: push the tentative entry, then swap it for the
/// authoritative record (or remove it on failure).
pub async fn create_entry<T, Fut>(
    cx: &MutationCx<'_>,
    collection: &Collection<T>,
    tentative: T,
    remote: Fut,
) -> Result<T, SyncError>
where
    T: Keyed + Clone,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let token = match tentative.record_id() {
        RecordId::Tentative(token) => *token,
        RecordId::Persisted(_) => {
            debug_assert!(false, "create_entry requires a tentative entry");
            return Err(SyncError::Remote(GatewayError::Validation(
                "entry is already persisted".into(),
            )));
        }
    };

    let entry = tentative.clone();
    let record = perform_optimistic(
        cx,
        collection,
        move |entries| entries.push(entry),
        remote,
        |entries, record: &T| {
            let slot = entries
                .iter_mut()
                .find(|e| *e.record_id() == RecordId::Tentative(token));
            match slot {
                Some(slot) => *slot = record.clone(),
                // A concurrent reload may have dropped the tentative entry;
                // an id-keyed upsert keeps the result duplicate-free.
                None => upsert_by_id(entries, record.clone()),
            }
        },
        move |entries| entries.retain(|e| *e.record_id() != RecordId::Tentative(token)),
        None,
    )
    .await?;

    if let Some(id) = record.persisted_id() {
        cx.ledger.record(id);
    }
    Ok(record)
}

/// Serializes concurrent mutations to the same entity id so a late response
/// can never overwrite a newer tentative state. Mutations to different ids
/// do not serialize against each other.
#[derive(Default)]
pub struct MutationQueue {
    slots: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the per-id turn. Held across the whole mutation cycle, so a
    /// second mutation to the same id starts only after the first resolved.
    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let slot = self.slots.entry(key.to_string()).or_default().clone();
        slot.lock_owned().await
    }

    /// Drop slots nobody holds or waits on, bounding memory over a long
    /// session.
    pub fn prune_idle(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
