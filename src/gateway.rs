//! Remote Data Gateway boundary.
//!
//! The backing store (relational tables plus a realtime change feed) is an
//! external collaborator consumed through [`RemoteGateway`]; object storage
//! through [`FileStore`]. Both are dyn traits so tests inject in-memory
//! fakes and the host app supplies the real client.
//!
//! Realtime payloads are decoded at this boundary into the closed
//! [`TableEvent`] union, so the reconciler switches over a known set of
//! typed events instead of inspecting loose JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::types::{
    AuditEntry, Card, CardPatch, Checklist, ChecklistItem, ChecklistItemPatch, Column, ColumnPatch,
    Comment, CommentPatch, Conversation, FilePatch, FileRecord, Folder, Keyed, Message,
    MessagePatch, NewCard, NewChecklist, NewChecklistItem, NewColumn, NewComment, NewFileRecord,
    NewFolder, NewMessage, Notification, Reaction, ReadReceipt, Tag,
};

/// Tables the realtime feed can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Cards,
    Columns,
    Tags,
    Comments,
    Checklists,
    ChecklistItems,
    Messages,
    Reactions,
    ReadReceipts,
    Files,
    Folders,
    Notifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One row-level change on a subscribed table.
///
/// `previous` is populated for updates and deletes when the backend sends
/// it; `current` for inserts and updates. `actor_id` identifies the session
/// that caused the write, which the reconciler needs to suppress echoes of
/// the current user's own mutations.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
    pub op: ChangeOp,
    pub previous: Option<T>,
    pub current: Option<T>,
    pub actor_id: Option<String>,
}

impl<T: Keyed> ChangeEvent<T> {
    /// The affected record, preferring the post-change row.
    pub fn record(&self) -> Option<&T> {
        self.current.as_ref().or(self.previous.as_ref())
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.record().and_then(|r| r.persisted_id())
    }
}

/// Closed union over every subscribable table's change payload.
#[derive(Debug, Clone)]
pub enum TableEvent {
    Card(ChangeEvent<Card>),
    Column(ChangeEvent<Column>),
    Tag(ChangeEvent<Tag>),
    Comment(ChangeEvent<Comment>),
    Checklist(ChangeEvent<Checklist>),
    ChecklistItem(ChangeEvent<ChecklistItem>),
    Message(ChangeEvent<Message>),
    Reaction(ChangeEvent<Reaction>),
    ReadReceipt(ChangeEvent<ReadReceipt>),
    File(ChangeEvent<FileRecord>),
    Folder(ChangeEvent<Folder>),
    Notification(ChangeEvent<Notification>),
}

impl TableEvent {
    pub fn table(&self) -> Table {
        match self {
            Self::Card(_) => Table::Cards,
            Self::Column(_) => Table::Columns,
            Self::Tag(_) => Table::Tags,
            Self::Comment(_) => Table::Comments,
            Self::Checklist(_) => Table::Checklists,
            Self::ChecklistItem(_) => Table::ChecklistItems,
            Self::Message(_) => Table::Messages,
            Self::Reaction(_) => Table::Reactions,
            Self::ReadReceipt(_) => Table::ReadReceipts,
            Self::File(_) => Table::Files,
            Self::Folder(_) => Table::Folders,
            Self::Notification(_) => Table::Notifications,
        }
    }

    pub fn op(&self) -> ChangeOp {
        match self {
            Self::Card(e) => e.op,
            Self::Column(e) => e.op,
            Self::Tag(e) => e.op,
            Self::Comment(e) => e.op,
            Self::Checklist(e) => e.op,
            Self::ChecklistItem(e) => e.op,
            Self::Message(e) => e.op,
            Self::Reaction(e) => e.op,
            Self::ReadReceipt(e) => e.op,
            Self::File(e) => e.op,
            Self::Folder(e) => e.op,
            Self::Notification(e) => e.op,
        }
    }

    /// Persisted id of the affected row. Read receipts have a composite key
    /// and report their message id.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::Card(e) => e.entity_id(),
            Self::Column(e) => e.entity_id(),
            Self::Tag(e) => e.entity_id(),
            Self::Comment(e) => e.entity_id(),
            Self::Checklist(e) => e.entity_id(),
            Self::ChecklistItem(e) => e.entity_id(),
            Self::Message(e) => e.entity_id(),
            Self::Reaction(e) => e.entity_id(),
            Self::ReadReceipt(e) => e
                .current
                .as_ref()
                .or(e.previous.as_ref())
                .map(|r| r.message_id.as_str()),
            Self::File(e) => e.entity_id(),
            Self::Folder(e) => e.entity_id(),
            Self::Notification(e) => e.entity_id(),
        }
    }

    pub fn actor_id(&self) -> Option<&str> {
        match self {
            Self::Card(e) => e.actor_id.as_deref(),
            Self::Column(e) => e.actor_id.as_deref(),
            Self::Tag(e) => e.actor_id.as_deref(),
            Self::Comment(e) => e.actor_id.as_deref(),
            Self::Checklist(e) => e.actor_id.as_deref(),
            Self::ChecklistItem(e) => e.actor_id.as_deref(),
            Self::Message(e) => e.actor_id.as_deref(),
            Self::Reaction(e) => e.actor_id.as_deref(),
            Self::ReadReceipt(e) => e.actor_id.as_deref(),
            Self::File(e) => e.actor_id.as_deref(),
            Self::Folder(e) => e.actor_id.as_deref(),
            Self::Notification(e) => e.actor_id.as_deref(),
        }
    }
}

/// Row filter for a subscription, matching the parent-id filters the
/// backend's channels support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    Project(String),
    Card(String),
    Conversation(String),
    User(String),
}

/// Receiving half of one table subscription. Events arrive in commit order
/// per table channel; there is no ordering guarantee across channels.
/// Dropping the stream unsubscribes.
pub struct ChangeStream {
    table: Table,
    rx: mpsc::UnboundedReceiver<TableEvent>,
}

impl ChangeStream {
    pub fn new(table: Table, rx: mpsc::UnboundedReceiver<TableEvent>) -> Self {
        Self { table, rx }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Next event, or `None` once the feed shuts down. A closed feed is not
    /// fatal: the gateway remains the source of truth and every view-model
    /// reloads on mount.
    pub async fn next(&mut self) -> Option<TableEvent> {
        self.rx.recv().await
    }
}

/// Which folder a file listing is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderScope {
    /// Every active file in the project.
    Any,
    /// Files with no parent folder.
    Root,
    /// Files inside one folder.
    In(String),
}

/// Typed CRUD plus realtime subscription against the backing store.
///
/// Errors surface synchronously to the caller. No retry happens at this
/// layer; retry policy belongs to the mutation engine above (which, per
/// design, never retries automatically either).
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    // ---- board -------------------------------------------------------------
    async fn list_columns(&self, project_id: &str) -> Result<Vec<Column>, GatewayError>;
    async fn insert_column(&self, new: NewColumn) -> Result<Column, GatewayError>;
    async fn update_column(&self, id: &str, patch: ColumnPatch) -> Result<Column, GatewayError>;

    /// Active (non-deleted) cards for a project.
    async fn list_cards(&self, project_id: &str) -> Result<Vec<Card>, GatewayError>;
    async fn list_trashed_cards(&self, project_id: &str) -> Result<Vec<Card>, GatewayError>;
    async fn insert_card(&self, new: NewCard) -> Result<Card, GatewayError>;
    async fn update_card(&self, id: &str, patch: CardPatch) -> Result<Card, GatewayError>;
    /// Hard delete. Soft deletion goes through `update_card` with a
    /// `deleted_at` patch.
    async fn delete_card(&self, id: &str) -> Result<(), GatewayError>;

    async fn list_tags(&self, project_id: &str) -> Result<Vec<Tag>, GatewayError>;

    // ---- comments ----------------------------------------------------------
    async fn list_comments(&self, card_id: &str) -> Result<Vec<Comment>, GatewayError>;
    async fn insert_comment(&self, new: NewComment) -> Result<Comment, GatewayError>;
    async fn update_comment(&self, id: &str, patch: CommentPatch) -> Result<Comment, GatewayError>;
    async fn insert_comment_mentions(
        &self,
        comment_id: &str,
        user_ids: &[String],
    ) -> Result<(), GatewayError>;

    // ---- checklists --------------------------------------------------------
    /// Checklists with their items, ordered.
    async fn list_checklists(&self, card_id: &str) -> Result<Vec<Checklist>, GatewayError>;
    async fn insert_checklist(&self, new: NewChecklist) -> Result<Checklist, GatewayError>;
    async fn insert_checklist_item(
        &self,
        new: NewChecklistItem,
    ) -> Result<ChecklistItem, GatewayError>;
    async fn update_checklist_item(
        &self,
        id: &str,
        patch: ChecklistItemPatch,
    ) -> Result<ChecklistItem, GatewayError>;
    async fn delete_checklist_item(&self, id: &str) -> Result<(), GatewayError>;

    // ---- chat --------------------------------------------------------------
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, GatewayError>;
    /// Newest-first page of active messages, optionally before a cursor.
    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, GatewayError>;
    async fn insert_message(&self, new: NewMessage) -> Result<Message, GatewayError>;
    async fn update_message(&self, id: &str, patch: MessagePatch) -> Result<Message, GatewayError>;
    async fn delete_message(&self, id: &str) -> Result<(), GatewayError>;

    async fn list_reactions(&self, conversation_id: &str) -> Result<Vec<Reaction>, GatewayError>;
    async fn find_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<Reaction>, GatewayError>;
    /// Inserting a duplicate (message, user, emoji) triple is a
    /// [`GatewayError::Conflict`]; uniqueness lives in the schema.
    async fn insert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Reaction, GatewayError>;
    async fn delete_reaction(&self, id: &str) -> Result<(), GatewayError>;

    async fn upsert_read_receipt(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<ReadReceipt, GatewayError>;

    // ---- files -------------------------------------------------------------
    async fn list_folders(&self, project_id: &str) -> Result<Vec<Folder>, GatewayError>;
    async fn insert_folder(&self, new: NewFolder) -> Result<Folder, GatewayError>;
    async fn list_files(
        &self,
        project_id: &str,
        scope: FolderScope,
    ) -> Result<Vec<FileRecord>, GatewayError>;
    async fn list_trashed_files(&self, project_id: &str) -> Result<Vec<FileRecord>, GatewayError>;
    async fn insert_file(&self, new: NewFileRecord) -> Result<FileRecord, GatewayError>;
    async fn update_file(&self, id: &str, patch: FilePatch) -> Result<FileRecord, GatewayError>;
    async fn delete_file(&self, id: &str) -> Result<(), GatewayError>;

    // ---- notifications -----------------------------------------------------
    async fn list_notifications(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Notification>, GatewayError>;
    async fn mark_notifications_read(&self, ids: &[String]) -> Result<(), GatewayError>;
    async fn mark_all_notifications_read(&self, user_id: &str) -> Result<(), GatewayError>;

    // ---- audit -------------------------------------------------------------
    /// Append-only. Never read back through this interface.
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), GatewayError>;

    // ---- realtime ----------------------------------------------------------
    fn subscribe(&self, table: Table, filter: SubscriptionFilter) -> ChangeStream;
}

/// Object storage operations, consumed as-is from the storage collaborator.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store bytes at `path`, returning the stored path.
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, GatewayError>;
    async fn create_signed_url(
        &self,
        path: &str,
        ttl_secs: u64,
        download: bool,
    ) -> Result<String, GatewayError>;
    async fn remove(&self, paths: &[String]) -> Result<(), GatewayError>;
    async fn relocate(&self, old_path: &str, new_path: &str) -> Result<(), GatewayError>;
}
