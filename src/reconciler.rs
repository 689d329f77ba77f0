//! Change Stream Reconciler.
//!
//! Decides, per incoming realtime event, whether the owning view-model
//! should reload its collection, apply a targeted merge, or ignore the
//! event. The interesting case is the echo of the session's own write
//! arriving back through the subscription: always reloading causes visible
//! flicker and loses in-flight optimistic entries, while always suppressing
//! own writes misses genuinely concurrent edits racing the same entity.
//! The self-mutation window plus entity-id matching resolves both.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::clock::{system_clock, Clock};
use crate::gateway::{ChangeStream, TableEvent};
use crate::optimistic::ViewLease;
use crate::types::Session;

/// Short-lived set of entity ids the current session recently mutated.
///
/// Populated by the mutation engine when a cycle confirms; an entry expires
/// after the configured window or on arrival of the matching realtime
/// event, whichever comes first.
pub struct SelfMutationLedger {
    entries: DashMap<String, Instant>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl SelfMutationLedger {
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, system_clock())
    }

    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            window,
            clock,
        }
    }

    /// Mark an entity id as just mutated by this session.
    pub fn record(&self, entity_id: &str) {
        self.entries
            .insert(entity_id.to_string(), self.clock.now());
        log::debug!("ledger: recorded {entity_id}");
    }

    /// Consume the entry for an arriving event. Returns true when the id was
    /// present and still inside the window; the entry is removed either way,
    /// so each write suppresses at most one echo.
    pub fn consume(&self, entity_id: &str) -> bool {
        match self.entries.remove(entity_id) {
            Some((_, recorded_at)) => {
                self.clock.now().duration_since(recorded_at) <= self.window
            }
            None => false,
        }
    }

    /// Whether an id is currently tracked and fresh. Does not consume.
    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries
            .get(entity_id)
            .map(|at| self.clock.now().duration_since(*at) <= self.window)
            .unwrap_or(false)
    }

    /// Drop expired entries. Called opportunistically; correctness does not
    /// depend on it because `consume` re-checks freshness.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, at| now.duration_since(*at) <= self.window);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            log::debug!("ledger: pruned {pruned} expired entries");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-table strategy for events that survive suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Reload the whole collection. Simplest correct policy; right for
    /// low-frequency tables where a reload is cheap.
    Reload,
    /// Targeted upsert/remove by id. For tables where reloads flicker
    /// (board cards and columns).
    UpsertById,
    /// Append-only merge keyed by id, preserving scroll position (chat).
    AppendOnly,
}

/// What the view-model should do with one incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The local optimistic state already covers this change.
    Suppress,
    Reload,
    /// Apply the table's targeted merge.
    Merge,
}

/// Decision rule for one event on a subscribed table.
///
/// `echoes_optimistic_ui` says whether this table's own-user writes are
/// already reflected optimistically by the UI (comments, checklist items,
/// chat messages), in which case an own-actor event is a duplicate even
/// when the ledger entry already expired.
pub fn decide(
    ledger: &SelfMutationLedger,
    session: &Session,
    event: &TableEvent,
    policy: MergePolicy,
    echoes_optimistic_ui: bool,
) -> ReconcileAction {
    if let Some(id) = event.entity_id() {
        if ledger.consume(id) {
            log::debug!("reconciler: suppressed own echo for {id}");
            return ReconcileAction::Suppress;
        }
    }

    if echoes_optimistic_ui && event.actor_id() == Some(session.user_id.as_str()) {
        log::debug!(
            "reconciler: suppressed own-actor {:?} on {:?}",
            event.op(),
            event.table()
        );
        return ReconcileAction::Suppress;
    }

    match policy {
        MergePolicy::Reload => ReconcileAction::Reload,
        MergePolicy::UpsertById | MergePolicy::AppendOnly => ReconcileAction::Merge,
    }
}

/// Drive one subscription until the feed closes or the owning view-model is
/// torn down. The handler runs on the event-loop task; it must stay
/// idempotent because the feed delivers at least once.
pub fn spawn_pump<F, Fut>(mut stream: ChangeStream, lease: ViewLease, mut handler: F) -> JoinHandle<()>
where
    F: FnMut(TableEvent) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let table = stream.table();
        while let Some(event) = stream.next().await {
            if !lease.is_active() {
                break;
            }
            handler(event).await;
        }
        log::debug!("reconciler: {table:?} stream closed");
    })
}
