//! boardsync: the data-consistency core of a Kanban collaboration client.
//!
//! The crate implements the optimistic-update / realtime-reconciliation
//! layer shared by board drag-and-drop, comments, checklists, chat, and
//! file uploads: apply a tentative local mutation immediately, issue the
//! remote write, swap in the authoritative record on success or roll back
//! on failure, while the realtime change stream from other sessions merges
//! in without double-applying the session's own echoes.
//!
//! Layering, bottom up:
//! - [`gateway`]: typed CRUD + change-stream traits over the backing store
//!   and object storage (external collaborators, injected).
//! - [`optimistic`]: the mutation engine and live collections.
//! - [`reconciler`]: the self-mutation ledger and per-event decision rule.
//! - [`view`]: one view-model per entity family, wiring both engines
//!   together and exposing the mutation entry points the UI calls.
//!
//! Everything is driven by a single-threaded cooperative runtime; remote
//! calls suspend at await points and collections are only ever mutated
//! through closed, synchronous critical sections.

pub mod audit;
pub mod clock;
pub mod error;
pub mod gateway;
pub mod optimistic;
pub mod reconciler;
pub mod typing;
pub mod types;
pub mod view;

#[cfg(test)]
pub(crate) mod testing;

pub use audit::AuditRecorder;
pub use clock::{Clock, SystemClock};
pub use error::{GatewayError, Notice, NoticeSender, NoticeSeverity, SyncError};
pub use gateway::{
    ChangeEvent, ChangeOp, ChangeStream, FileStore, FolderScope, RemoteGateway,
    SubscriptionFilter, Table, TableEvent,
};
pub use optimistic::{Collection, MutationQueue, ViewLease};
pub use reconciler::{MergePolicy, ReconcileAction, SelfMutationLedger};
pub use typing::{TypingBroadcast, TypingIndicator, TypingPhase};
pub use types::{EngineConfig, Keyed, LocalToken, RecordId, Session};
pub use view::board::BoardView;
pub use view::chat::ChatThread;
pub use view::checklist::ChecklistSet;
pub use view::comments::CommentThread;
pub use view::files::FileBrowser;
pub use view::notifications::NotificationFeed;
pub use view::trash::{TrashKind, TrashView};
pub use view::ViewContext;
