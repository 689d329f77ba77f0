//! Core data model shared by the gateway, the mutation engine, and the
//! view-models.
//!
//! Records are UI-facing and serialize as camelCase. A record's identity is
//! a [`RecordId`]: either a persisted backend id or a locally minted
//! tentative token, so "is this entry confirmed yet" is answered by the type
//! system rather than a string-prefix convention.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counter backing [`LocalToken`] minting. Process-wide so two view-models
/// can never hand out the same token.
static NEXT_LOCAL_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Locally minted identity for a tentative (not yet persisted) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalToken(pub u64);

impl LocalToken {
    pub fn mint() -> Self {
        Self(NEXT_LOCAL_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LocalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

/// Identity of a record in a live collection.
///
/// `Persisted` carries the backend id. `Tentative` exists only in memory
/// while an optimistic mutation is in flight and must be replaced or
/// removed before the mutation cycle completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "camelCase")]
pub enum RecordId {
    Persisted(String),
    Tentative(LocalToken),
}

impl RecordId {
    pub fn persisted(id: impl Into<String>) -> Self {
        Self::Persisted(id.into())
    }

    /// Mint a fresh tentative identity.
    pub fn tentative() -> Self {
        Self::Tentative(LocalToken::mint())
    }

    pub fn is_tentative(&self) -> bool {
        matches!(self, Self::Tentative(_))
    }

    pub fn as_persisted(&self) -> Option<&str> {
        match self {
            Self::Persisted(id) => Some(id.as_str()),
            Self::Tentative(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted(id) => f.write_str(id),
            Self::Tentative(token) => token.fmt(f),
        }
    }
}

/// Anything living in a live collection exposes its [`RecordId`].
pub trait Keyed {
    fn record_id(&self) -> &RecordId;

    /// The persisted id, if confirmed.
    fn persisted_id(&self) -> Option<&str> {
        self.record_id().as_persisted()
    }
}

/// Authenticated identity for the current session, threaded explicitly into
/// every view-model constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            display_name: None,
        }
    }
}

// =============================================================================
// Engine configuration
// =============================================================================

/// Tuning knobs for the mutation engine and reconciler. Host apps override
/// via deserialization; every field has a serde default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Client-side timeout applied to every awaited remote call. Expiry is
    /// treated as failure (rollback).
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
    /// How long an entity id stays in the "recently self-mutated" set before
    /// the matching realtime echo stops being suppressed.
    #[serde(default = "default_self_mutation_window_ms")]
    pub self_mutation_window_ms: u64,
    /// Typing indicator falls back to idle after this long without a
    /// keystroke.
    #[serde(default = "default_typing_idle_timeout_ms")]
    pub typing_idle_timeout_ms: u64,
    #[serde(default = "default_message_page_size")]
    pub message_page_size: u32,
    #[serde(default = "default_notification_page_size")]
    pub notification_page_size: u32,
}

fn default_remote_timeout_secs() -> u64 {
    15
}

fn default_self_mutation_window_ms() -> u64 {
    1_000
}

fn default_typing_idle_timeout_ms() -> u64 {
    3_000
}

fn default_message_page_size() -> u32 {
    50
}

fn default_notification_page_size() -> u32 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_timeout_secs: default_remote_timeout_secs(),
            self_mutation_window_ms: default_self_mutation_window_ms(),
            typing_idle_timeout_ms: default_typing_idle_timeout_ms(),
            message_page_size: default_message_page_size(),
            notification_page_size: default_notification_page_size(),
        }
    }
}

// =============================================================================
// Board entities
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: RecordId,
    pub project_id: String,
    pub name: String,
    pub order: u32,
    /// Advisory maximum card count. Violations are surfaced, never enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<u32>,
}

impl Keyed for Column {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: RecordId,
    pub project_id: String,
    /// Owning column. A card belongs to exactly one column at any instant;
    /// moving is an atomic reassignment of this field.
    pub column_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
    pub created_by: String,
    #[serde(default)]
    pub assignee_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub comment_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Keyed for Card {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: RecordId,
    pub project_id: String,
    pub name: String,
    pub color: String,
}

impl Keyed for Tag {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

// =============================================================================
// Checklists
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checklist {
    pub id: RecordId,
    pub card_id: String,
    pub title: String,
    pub order: u32,
    #[serde(default)]
    pub items: Vec<ChecklistItem>,
}

impl Checklist {
    /// Progress as (done, total).
    pub fn progress(&self) -> (usize, usize) {
        let done = self.items.iter().filter(|i| i.done).count();
        (done, self.items.len())
    }
}

impl Keyed for Checklist {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: RecordId,
    pub checklist_id: String,
    pub title: String,
    pub order: u32,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
}

impl Keyed for ChecklistItem {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

// =============================================================================
// Comments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: RecordId,
    pub card_id: String,
    pub author_id: String,
    /// May contain embedded `@{user-id}` mention markers.
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Keyed for Comment {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

// =============================================================================
// Chat
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
    Project,
    Card,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: RecordId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

impl Keyed for Conversation {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: RecordId,
    pub conversation_id: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// At most one attached file per message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Keyed for Message {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

/// One reaction row. Unique per (message, user, emoji); toggling removes an
/// existing row or inserts a missing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: RecordId,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl Keyed for Reaction {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

/// Latest read marker per (user, message). Upserted, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

// =============================================================================
// Files
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: RecordId,
    pub project_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Keyed for Folder {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: RecordId,
    pub project_id: String,
    pub name: String,
    /// Object-storage path. Empty while the upload is still pending.
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// A tentative file entry whose upload has not completed yet.
    pub fn is_pending(&self) -> bool {
        self.id.is_tentative()
    }
}

impl Keyed for FileRecord {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

// =============================================================================
// Notifications and audit
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: RecordId,
    pub user_id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

impl Keyed for Notification {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Move,
    SoftDelete,
    Restore,
    HardDelete,
}

/// Append-only history record. Write-only from the core's perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub entity: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Insert payloads and patches
// =============================================================================

#[derive(Debug, Clone)]
pub struct NewColumn {
    pub project_id: String,
    pub name: String,
    pub order: u32,
    pub wip_limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewCard {
    pub project_id: String,
    pub column_id: String,
    pub title: String,
    pub created_by: String,
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub card_id: String,
    pub author_id: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct NewChecklist {
    pub card_id: String,
    pub title: String,
    pub order: u32,
}

#[derive(Debug, Clone)]
pub struct NewChecklistItem {
    pub checklist_id: String,
    pub title: String,
    pub order: u32,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub author_id: String,
    pub body: Option<String>,
    pub file_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFolder {
    pub project_id: String,
    pub name: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub project_id: String,
    pub name: String,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub folder_id: Option<String>,
    pub card_id: Option<String>,
    pub message_id: Option<String>,
    pub uploaded_by: Option<String>,
}

// Patches use `Option` for set-if-present fields and `Option<Option<_>>`
// where clearing to null is itself an operation (restore, unset due date).

#[derive(Debug, Clone, Default)]
pub struct ColumnPatch {
    pub name: Option<String>,
    pub order: Option<u32>,
    pub wip_limit: Option<Option<u32>>,
}

#[derive(Debug, Clone, Default)]
pub struct CardPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<Option<Priority>>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub estimate: Option<Option<f64>>,
    pub column_id: Option<String>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

impl CardPatch {
    /// The single-field patch used by card moves.
    pub fn move_to(column_id: impl Into<String>) -> Self {
        Self {
            column_id: Some(column_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommentPatch {
    pub body: Option<String>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default)]
pub struct ChecklistItemPatch {
    pub title: Option<String>,
    pub order: Option<u32>,
    /// The gateway stamps `done_at` whenever this flips.
    pub done: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub body: Option<Option<String>>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    pub name: Option<String>,
    pub storage_path: Option<String>,
    pub folder_id: Option<Option<String>>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}
