//! In-memory gateway and file store for tests.
//!
//! Models the backing store closely enough to exercise the engine end to
//! end: every write is echoed to matching subscribers as a realtime event
//! (actor = the writing handle's session), writes can be scripted to fail
//! per table, and foreign events can be injected to simulate a second
//! session racing the same rows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::{
    ChangeEvent, ChangeOp, ChangeStream, FileStore, FolderScope, RemoteGateway,
    SubscriptionFilter, Table, TableEvent,
};
use crate::types::*;

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Subscriber {
    table: Table,
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<TableEvent>,
}

#[derive(Default)]
struct State {
    columns: Vec<Column>,
    cards: Vec<Card>,
    tags: Vec<Tag>,
    comments: Vec<Comment>,
    mentions: Vec<(String, String)>,
    checklists: Vec<Checklist>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    reactions: Vec<Reaction>,
    receipts: Vec<ReadReceipt>,
    files: Vec<FileRecord>,
    folders: Vec<Folder>,
    notifications: Vec<Notification>,
    audit: Vec<AuditEntry>,
    subscribers: Vec<Subscriber>,
    fail_tables: HashSet<Table>,
    objects: HashMap<String, Vec<u8>>,
    fail_uploads: bool,
}

/// One session's handle onto the shared in-memory backend. `for_actor`
/// creates a second handle over the same state to model another browser
/// session.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    actor: String,
}

impl MemoryBackend {
    pub fn new(actor: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            actor: actor.to_string(),
        }
    }

    /// Another session over the same store.
    pub fn for_actor(&self, actor: &str) -> Self {
        Self {
            state: Arc::clone(&self.state),
            actor: actor.to_string(),
        }
    }

    pub fn fail_writes_on(&self, table: Table) {
        self.state.lock().fail_tables.insert(table);
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_tables.clear();
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state.lock().fail_uploads = fail;
    }

    /// Drop every subscription, as a lost realtime connection would.
    pub fn disconnect_realtime(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().audit.clone()
    }

    pub fn mention_rows(&self) -> Vec<(String, String)> {
        self.state.lock().mentions.clone()
    }

    pub fn stored_object(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(path).cloned()
    }

    pub fn raw_cards(&self) -> Vec<Card> {
        self.state.lock().cards.clone()
    }

    pub fn raw_messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn raw_files(&self) -> Vec<FileRecord> {
        self.state.lock().files.clone()
    }

    // ---- seeding (no events emitted) ---------------------------------------

    pub fn seed_column(&self, project_id: &str, name: &str) -> Column {
        let column = Column {
            id: RecordId::persisted(format!("col-{}", Uuid::new_v4())),
            project_id: project_id.into(),
            name: name.into(),
            order: self.state.lock().columns.len() as u32,
            wip_limit: None,
        };
        self.state.lock().columns.push(column.clone());
        column
    }

    pub fn seed_column_with_wip(&self, project_id: &str, name: &str, wip: u32) -> Column {
        let mut column = self.seed_column(project_id, name);
        column.wip_limit = Some(wip);
        let mut state = self.state.lock();
        if let Some(slot) = state.columns.iter_mut().find(|c| c.id == column.id) {
            slot.wip_limit = Some(wip);
        }
        column
    }

    pub fn seed_card(&self, project_id: &str, column_id: &str, title: &str) -> Card {
        let card = make_card(project_id, column_id, title, "seed-user");
        self.state.lock().cards.push(card.clone());
        card
    }

    pub fn seed_conversation(&self, kind: ConversationKind, members: &[&str]) -> Conversation {
        let conversation = Conversation {
            id: RecordId::persisted(format!("conv-{}", Uuid::new_v4())),
            kind,
            title: None,
            project_id: None,
            card_id: None,
            member_ids: members.iter().map(|m| m.to_string()).collect(),
        };
        self.state.lock().conversations.push(conversation.clone());
        conversation
    }

    pub fn seed_checklist(&self, card_id: &str, title: &str) -> Checklist {
        let checklist = Checklist {
            id: RecordId::persisted(format!("cl-{}", Uuid::new_v4())),
            card_id: card_id.into(),
            title: title.into(),
            order: 0,
            items: Vec::new(),
        };
        self.state.lock().checklists.push(checklist.clone());
        checklist
    }

    pub fn seed_checklist_item(&self, checklist_id: &str, title: &str, done: bool) -> ChecklistItem {
        let item = ChecklistItem {
            id: RecordId::persisted(format!("cli-{}", Uuid::new_v4())),
            checklist_id: checklist_id.into(),
            title: title.into(),
            order: 0,
            done,
            done_at: done.then(Utc::now),
        };
        let mut state = self.state.lock();
        let checklist = state
            .checklists
            .iter_mut()
            .find(|c| c.persisted_id() == Some(checklist_id))
            .expect("seeded checklist");
        let mut item = item;
        item.order = checklist.items.len() as u32;
        checklist.items.push(item.clone());
        item
    }

    pub fn seed_notification(&self, user_id: &str, kind: &str) -> Notification {
        let notification = Notification {
            id: RecordId::persisted(format!("ntf-{}", Uuid::new_v4())),
            user_id: user_id.into(),
            kind: kind.into(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
            read_at: None,
        };
        self.state.lock().notifications.push(notification.clone());
        notification
    }

    /// Deliver an event as if another client wrote to the store. The row is
    /// also applied to backend state so later reloads agree with the event.
    pub fn inject_foreign_event(&self, event: TableEvent) {
        let mut state = self.state.lock();
        apply_event_to_state(&mut state, &event);
        broadcast(&mut state, event);
    }

    /// Re-deliver an event without touching state, for at-least-once
    /// duplicate tests.
    pub fn redeliver(&self, event: TableEvent) {
        broadcast(&mut self.state.lock(), event);
    }

    fn check_writable(&self, table: Table) -> Result<(), GatewayError> {
        if self.state.lock().fail_tables.contains(&table) {
            return Err(GatewayError::Network("injected failure".into()));
        }
        Ok(())
    }

    fn emit(&self, state: &mut State, event: TableEvent) {
        broadcast(state, event);
    }
}

fn make_card(project_id: &str, column_id: &str, title: &str, created_by: &str) -> Card {
    Card {
        id: RecordId::persisted(format!("card-{}", Uuid::new_v4())),
        project_id: project_id.into(),
        column_id: column_id.into(),
        title: title.into(),
        description: None,
        priority: None,
        due_at: None,
        estimate: None,
        created_by: created_by.into(),
        assignee_ids: Vec::new(),
        tag_ids: Vec::new(),
        comment_count: 0,
        created_at: Utc::now(),
        updated_at: None,
        deleted_at: None,
    }
}

fn broadcast(state: &mut State, event: TableEvent) {
    let table = event.table();
    state.subscribers.retain(|sub| !sub.tx.is_closed());
    for sub in &state.subscribers {
        if sub.table == table && filter_matches(state, &sub.filter, &event) {
            let _ = sub.tx.send(event.clone());
        }
    }
}

fn filter_matches(state: &State, filter: &SubscriptionFilter, event: &TableEvent) -> bool {
    match filter {
        SubscriptionFilter::All => true,
        SubscriptionFilter::Project(p) => match event {
            TableEvent::Card(e) => e.record().map(|r| r.project_id == *p).unwrap_or(false),
            TableEvent::Column(e) => e.record().map(|r| r.project_id == *p).unwrap_or(false),
            TableEvent::Tag(e) => e.record().map(|r| r.project_id == *p).unwrap_or(false),
            TableEvent::File(e) => e.record().map(|r| r.project_id == *p).unwrap_or(false),
            TableEvent::Folder(e) => e.record().map(|r| r.project_id == *p).unwrap_or(false),
            // Comment events subscribed at project scope: resolve through
            // the owning card.
            TableEvent::Comment(e) => e
                .record()
                .map(|r| card_project(state, &r.card_id) == Some(p.clone()))
                .unwrap_or(false),
            _ => false,
        },
        SubscriptionFilter::Card(c) => match event {
            TableEvent::Comment(e) => e.record().map(|r| r.card_id == *c).unwrap_or(false),
            TableEvent::Checklist(e) => e.record().map(|r| r.card_id == *c).unwrap_or(false),
            TableEvent::ChecklistItem(e) => e
                .record()
                .map(|r| checklist_card(state, &r.checklist_id) == Some(c.clone()))
                .unwrap_or(false),
            _ => false,
        },
        SubscriptionFilter::Conversation(cv) => match event {
            TableEvent::Message(e) => e.record().map(|r| r.conversation_id == *cv).unwrap_or(false),
            TableEvent::Reaction(e) => e
                .record()
                .map(|r| message_conversation(state, &r.message_id) == Some(cv.clone()))
                .unwrap_or(false),
            TableEvent::ReadReceipt(e) => e
                .current
                .as_ref()
                .or(e.previous.as_ref())
                .map(|r| message_conversation(state, &r.message_id) == Some(cv.clone()))
                .unwrap_or(false),
            _ => false,
        },
        SubscriptionFilter::User(u) => match event {
            TableEvent::Notification(e) => e.record().map(|r| r.user_id == *u).unwrap_or(false),
            _ => false,
        },
    }
}

fn card_project(state: &State, card_id: &str) -> Option<String> {
    state
        .cards
        .iter()
        .find(|c| c.persisted_id() == Some(card_id))
        .map(|c| c.project_id.clone())
}

fn checklist_card(state: &State, checklist_id: &str) -> Option<String> {
    state
        .checklists
        .iter()
        .find(|c| c.persisted_id() == Some(checklist_id))
        .map(|c| c.card_id.clone())
}

fn message_conversation(state: &State, message_id: &str) -> Option<String> {
    state
        .messages
        .iter()
        .find(|m| m.persisted_id() == Some(message_id))
        .map(|m| m.conversation_id.clone())
}

/// Keep backend state consistent with injected foreign events so a reload
/// sees what the event announced.
fn apply_event_to_state(state: &mut State, event: &TableEvent) {
    match event {
        TableEvent::Card(e) => {
            if let Some(card) = &e.current {
                upsert(&mut state.cards, card.clone());
            } else if let (ChangeOp::Delete, Some(prev)) = (e.op, &e.previous) {
                state.cards.retain(|c| c.id != prev.id);
            }
        }
        TableEvent::Comment(e) => {
            if let Some(comment) = &e.current {
                upsert(&mut state.comments, comment.clone());
            }
        }
        TableEvent::Message(e) => {
            if let Some(message) = &e.current {
                upsert(&mut state.messages, message.clone());
            }
        }
        TableEvent::Notification(e) => {
            if let Some(notification) = &e.current {
                upsert(&mut state.notifications, notification.clone());
            }
        }
        _ => {}
    }
}

fn upsert<T: Keyed + Clone>(entries: &mut Vec<T>, record: T) {
    if let Some(slot) = entries
        .iter_mut()
        .find(|e| e.persisted_id() == record.persisted_id())
    {
        *slot = record;
    } else {
        entries.push(record);
    }
}

fn comment_count(state: &State, card_id: &str) -> u32 {
    state
        .comments
        .iter()
        .filter(|c| c.card_id == card_id && c.deleted_at.is_none())
        .count() as u32
}

#[async_trait]
impl RemoteGateway for MemoryBackend {
    async fn list_columns(&self, project_id: &str) -> Result<Vec<Column>, GatewayError> {
        let mut columns: Vec<Column> = self
            .state
            .lock()
            .columns
            .iter()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        columns.sort_by_key(|c| c.order);
        Ok(columns)
    }

    async fn insert_column(&self, new: NewColumn) -> Result<Column, GatewayError> {
        self.check_writable(Table::Columns)?;
        let column = Column {
            id: RecordId::persisted(format!("col-{}", Uuid::new_v4())),
            project_id: new.project_id,
            name: new.name,
            order: new.order,
            wip_limit: new.wip_limit,
        };
        let mut state = self.state.lock();
        state.columns.push(column.clone());
        let event = TableEvent::Column(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(column.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(column)
    }

    async fn update_column(&self, id: &str, patch: ColumnPatch) -> Result<Column, GatewayError> {
        self.check_writable(Table::Columns)?;
        let mut state = self.state.lock();
        let column = state
            .columns
            .iter_mut()
            .find(|c| c.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("column {id}")))?;
        let previous = column.clone();
        if let Some(name) = patch.name {
            column.name = name;
        }
        if let Some(order) = patch.order {
            column.order = order;
        }
        if let Some(wip) = patch.wip_limit {
            column.wip_limit = wip;
        }
        let current = column.clone();
        let event = TableEvent::Column(ChangeEvent {
            op: ChangeOp::Update,
            previous: Some(previous),
            current: Some(current.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(current)
    }

    async fn list_cards(&self, project_id: &str) -> Result<Vec<Card>, GatewayError> {
        let state = self.state.lock();
        Ok(state
            .cards
            .iter()
            .filter(|c| c.project_id == project_id && c.deleted_at.is_none())
            .map(|c| {
                let mut card = c.clone();
                card.comment_count = comment_count(&state, c.persisted_id().unwrap_or_default());
                card
            })
            .collect())
    }

    async fn list_trashed_cards(&self, project_id: &str) -> Result<Vec<Card>, GatewayError> {
        let mut cards: Vec<Card> = self
            .state
            .lock()
            .cards
            .iter()
            .filter(|c| c.project_id == project_id && c.deleted_at.is_some())
            .cloned()
            .collect();
        cards.sort_by_key(|c| std::cmp::Reverse(c.deleted_at));
        Ok(cards)
    }

    async fn insert_card(&self, new: NewCard) -> Result<Card, GatewayError> {
        self.check_writable(Table::Cards)?;
        let card = make_card(&new.project_id, &new.column_id, &new.title, &new.created_by);
        let mut state = self.state.lock();
        state.cards.push(card.clone());
        let event = TableEvent::Card(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(card.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(card)
    }

    async fn update_card(&self, id: &str, patch: CardPatch) -> Result<Card, GatewayError> {
        self.check_writable(Table::Cards)?;
        let mut state = self.state.lock();
        let card = state
            .cards
            .iter_mut()
            .find(|c| c.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("card {id}")))?;
        let previous = card.clone();
        if let Some(title) = patch.title {
            card.title = title;
        }
        if let Some(description) = patch.description {
            card.description = description;
        }
        if let Some(priority) = patch.priority {
            card.priority = priority;
        }
        if let Some(due_at) = patch.due_at {
            card.due_at = due_at;
        }
        if let Some(estimate) = patch.estimate {
            card.estimate = estimate;
        }
        if let Some(column_id) = patch.column_id {
            card.column_id = column_id;
        }
        if let Some(deleted_at) = patch.deleted_at {
            card.deleted_at = deleted_at;
        }
        card.updated_at = Some(Utc::now());
        let current = card.clone();
        let event = TableEvent::Card(ChangeEvent {
            op: ChangeOp::Update,
            previous: Some(previous),
            current: Some(current.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(current)
    }

    async fn delete_card(&self, id: &str) -> Result<(), GatewayError> {
        self.check_writable(Table::Cards)?;
        let mut state = self.state.lock();
        let position = state
            .cards
            .iter()
            .position(|c| c.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("card {id}")))?;
        let previous = state.cards.remove(position);
        let event = TableEvent::Card(ChangeEvent {
            op: ChangeOp::Delete,
            previous: Some(previous),
            current: None,
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(())
    }

    async fn list_tags(&self, project_id: &str) -> Result<Vec<Tag>, GatewayError> {
        Ok(self
            .state
            .lock()
            .tags
            .iter()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_comments(&self, card_id: &str) -> Result<Vec<Comment>, GatewayError> {
        let mut comments: Vec<Comment> = self
            .state
            .lock()
            .comments
            .iter()
            .filter(|c| c.card_id == card_id && c.deleted_at.is_none())
            .cloned()
            .collect();
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn insert_comment(&self, new: NewComment) -> Result<Comment, GatewayError> {
        self.check_writable(Table::Comments)?;
        let comment = Comment {
            id: RecordId::persisted(format!("cm-{}", Uuid::new_v4())),
            card_id: new.card_id,
            author_id: new.author_id,
            body: new.body,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let mut state = self.state.lock();
        state.comments.push(comment.clone());
        let event = TableEvent::Comment(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(comment.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(comment)
    }

    async fn update_comment(&self, id: &str, patch: CommentPatch) -> Result<Comment, GatewayError> {
        self.check_writable(Table::Comments)?;
        let mut state = self.state.lock();
        let comment = state
            .comments
            .iter_mut()
            .find(|c| c.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("comment {id}")))?;
        let previous = comment.clone();
        if let Some(body) = patch.body {
            comment.body = body;
        }
        if let Some(deleted_at) = patch.deleted_at {
            comment.deleted_at = deleted_at;
        }
        let current = comment.clone();
        let event = TableEvent::Comment(ChangeEvent {
            op: ChangeOp::Update,
            previous: Some(previous),
            current: Some(current.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(current)
    }

    async fn insert_comment_mentions(
        &self,
        comment_id: &str,
        user_ids: &[String],
    ) -> Result<(), GatewayError> {
        self.check_writable(Table::Comments)?;
        let mut state = self.state.lock();
        for user_id in user_ids {
            state
                .mentions
                .push((comment_id.to_string(), user_id.clone()));
        }
        Ok(())
    }

    async fn list_checklists(&self, card_id: &str) -> Result<Vec<Checklist>, GatewayError> {
        let mut checklists: Vec<Checklist> = self
            .state
            .lock()
            .checklists
            .iter()
            .filter(|c| c.card_id == card_id)
            .cloned()
            .collect();
        checklists.sort_by_key(|c| c.order);
        for checklist in &mut checklists {
            checklist.items.sort_by_key(|i| i.order);
        }
        Ok(checklists)
    }

    async fn insert_checklist(&self, new: NewChecklist) -> Result<Checklist, GatewayError> {
        self.check_writable(Table::Checklists)?;
        let checklist = Checklist {
            id: RecordId::persisted(format!("cl-{}", Uuid::new_v4())),
            card_id: new.card_id,
            title: new.title,
            order: new.order,
            items: Vec::new(),
        };
        let mut state = self.state.lock();
        state.checklists.push(checklist.clone());
        let event = TableEvent::Checklist(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(checklist.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(checklist)
    }

    async fn insert_checklist_item(
        &self,
        new: NewChecklistItem,
    ) -> Result<ChecklistItem, GatewayError> {
        self.check_writable(Table::ChecklistItems)?;
        let item = ChecklistItem {
            id: RecordId::persisted(format!("cli-{}", Uuid::new_v4())),
            checklist_id: new.checklist_id.clone(),
            title: new.title,
            order: new.order,
            done: false,
            done_at: None,
        };
        let mut state = self.state.lock();
        let checklist = state
            .checklists
            .iter_mut()
            .find(|c| c.persisted_id() == Some(new.checklist_id.as_str()))
            .ok_or_else(|| GatewayError::NotFound(format!("checklist {}", new.checklist_id)))?;
        checklist.items.push(item.clone());
        let event = TableEvent::ChecklistItem(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(item.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(item)
    }

    async fn update_checklist_item(
        &self,
        id: &str,
        patch: ChecklistItemPatch,
    ) -> Result<ChecklistItem, GatewayError> {
        self.check_writable(Table::ChecklistItems)?;
        let mut state = self.state.lock();
        let item = state
            .checklists
            .iter_mut()
            .flat_map(|c| c.items.iter_mut())
            .find(|i| i.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("checklist item {id}")))?;
        let previous = item.clone();
        if let Some(title) = patch.title {
            item.title = title;
        }
        if let Some(order) = patch.order {
            item.order = order;
        }
        if let Some(done) = patch.done {
            if done != item.done {
                item.done_at = done.then(Utc::now);
            }
            item.done = done;
        }
        let current = item.clone();
        let event = TableEvent::ChecklistItem(ChangeEvent {
            op: ChangeOp::Update,
            previous: Some(previous),
            current: Some(current.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(current)
    }

    async fn delete_checklist_item(&self, id: &str) -> Result<(), GatewayError> {
        self.check_writable(Table::ChecklistItems)?;
        let mut state = self.state.lock();
        let mut removed = None;
        for checklist in &mut state.checklists {
            if let Some(pos) = checklist.items.iter().position(|i| i.persisted_id() == Some(id)) {
                removed = Some(checklist.items.remove(pos));
                break;
            }
        }
        let previous =
            removed.ok_or_else(|| GatewayError::NotFound(format!("checklist item {id}")))?;
        let event = TableEvent::ChecklistItem(ChangeEvent {
            op: ChangeOp::Delete,
            previous: Some(previous),
            current: None,
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, GatewayError> {
        Ok(self
            .state
            .lock()
            .conversations
            .iter()
            .filter(|c| c.member_ids.iter().any(|m| m == user_id))
            .cloned()
            .collect())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, GatewayError> {
        let mut messages: Vec<Message> = self
            .state
            .lock()
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.deleted_at.is_none()
                    && before.map(|cursor| m.created_at < cursor).unwrap_or(true)
            })
            .cloned()
            .collect();
        messages.sort_by_key(|m| std::cmp::Reverse(m.created_at));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, GatewayError> {
        self.check_writable(Table::Messages)?;
        let message = Message {
            id: RecordId::persisted(format!("msg-{}", Uuid::new_v4())),
            conversation_id: new.conversation_id,
            author_id: new.author_id,
            body: new.body,
            file_id: new.file_id,
            reply_to: new.reply_to,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        };
        let mut state = self.state.lock();
        state.messages.push(message.clone());
        let event = TableEvent::Message(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(message.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(message)
    }

    async fn update_message(&self, id: &str, patch: MessagePatch) -> Result<Message, GatewayError> {
        self.check_writable(Table::Messages)?;
        let mut state = self.state.lock();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("message {id}")))?;
        let previous = message.clone();
        if let Some(body) = patch.body {
            message.body = body;
        }
        if let Some(deleted_at) = patch.deleted_at {
            message.deleted_at = deleted_at;
        }
        message.updated_at = Some(Utc::now());
        let current = message.clone();
        let event = TableEvent::Message(ChangeEvent {
            op: ChangeOp::Update,
            previous: Some(previous),
            current: Some(current.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(current)
    }

    async fn delete_message(&self, id: &str) -> Result<(), GatewayError> {
        self.check_writable(Table::Messages)?;
        let mut state = self.state.lock();
        let position = state
            .messages
            .iter()
            .position(|m| m.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("message {id}")))?;
        let previous = state.messages.remove(position);
        let event = TableEvent::Message(ChangeEvent {
            op: ChangeOp::Delete,
            previous: Some(previous),
            current: None,
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(())
    }

    async fn list_reactions(&self, conversation_id: &str) -> Result<Vec<Reaction>, GatewayError> {
        let state = self.state.lock();
        let message_ids: HashSet<String> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter_map(|m| m.persisted_id().map(str::to_string))
            .collect();
        Ok(state
            .reactions
            .iter()
            .filter(|r| message_ids.contains(&r.message_id))
            .cloned()
            .collect())
    }

    async fn find_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<Reaction>, GatewayError> {
        Ok(self
            .state
            .lock()
            .reactions
            .iter()
            .find(|r| r.message_id == message_id && r.user_id == user_id && r.emoji == emoji)
            .cloned())
    }

    async fn insert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Reaction, GatewayError> {
        self.check_writable(Table::Reactions)?;
        let mut state = self.state.lock();
        let duplicate = state
            .reactions
            .iter()
            .any(|r| r.message_id == message_id && r.user_id == user_id && r.emoji == emoji);
        if duplicate {
            return Err(GatewayError::Conflict(format!(
                "reaction exists for {message_id}/{user_id}/{emoji}"
            )));
        }
        let reaction = Reaction {
            id: RecordId::persisted(format!("rx-{}", Uuid::new_v4())),
            message_id: message_id.into(),
            user_id: user_id.into(),
            emoji: emoji.into(),
            created_at: Utc::now(),
        };
        state.reactions.push(reaction.clone());
        let event = TableEvent::Reaction(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(reaction.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(reaction)
    }

    async fn delete_reaction(&self, id: &str) -> Result<(), GatewayError> {
        self.check_writable(Table::Reactions)?;
        let mut state = self.state.lock();
        let position = state
            .reactions
            .iter()
            .position(|r| r.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("reaction {id}")))?;
        let previous = state.reactions.remove(position);
        let event = TableEvent::Reaction(ChangeEvent {
            op: ChangeOp::Delete,
            previous: Some(previous),
            current: None,
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(())
    }

    async fn upsert_read_receipt(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<ReadReceipt, GatewayError> {
        self.check_writable(Table::ReadReceipts)?;
        let receipt = ReadReceipt {
            message_id: message_id.into(),
            user_id: user_id.into(),
            read_at: Utc::now(),
        };
        let mut state = self.state.lock();
        state
            .receipts
            .retain(|r| !(r.message_id == message_id && r.user_id == user_id));
        state.receipts.push(receipt.clone());
        let event = TableEvent::ReadReceipt(ChangeEvent {
            op: ChangeOp::Update,
            previous: None,
            current: Some(receipt.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(receipt)
    }

    async fn list_folders(&self, project_id: &str) -> Result<Vec<Folder>, GatewayError> {
        let mut folders: Vec<Folder> = self
            .state
            .lock()
            .folders
            .iter()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(folders)
    }

    async fn insert_folder(&self, new: NewFolder) -> Result<Folder, GatewayError> {
        self.check_writable(Table::Folders)?;
        let folder = Folder {
            id: RecordId::persisted(format!("fld-{}", Uuid::new_v4())),
            project_id: new.project_id,
            name: new.name,
            parent_id: new.parent_id,
        };
        let mut state = self.state.lock();
        state.folders.push(folder.clone());
        let event = TableEvent::Folder(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(folder.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(folder)
    }

    async fn list_files(
        &self,
        project_id: &str,
        scope: FolderScope,
    ) -> Result<Vec<FileRecord>, GatewayError> {
        let mut files: Vec<FileRecord> = self
            .state
            .lock()
            .files
            .iter()
            .filter(|f| f.project_id == project_id && f.deleted_at.is_none())
            .filter(|f| match &scope {
                FolderScope::Any => true,
                FolderScope::Root => f.folder_id.is_none(),
                FolderScope::In(folder) => f.folder_id.as_deref() == Some(folder.as_str()),
            })
            .cloned()
            .collect();
        files.sort_by_key(|f| std::cmp::Reverse(f.created_at));
        Ok(files)
    }

    async fn list_trashed_files(&self, project_id: &str) -> Result<Vec<FileRecord>, GatewayError> {
        let mut files: Vec<FileRecord> = self
            .state
            .lock()
            .files
            .iter()
            .filter(|f| f.project_id == project_id && f.deleted_at.is_some())
            .cloned()
            .collect();
        files.sort_by_key(|f| std::cmp::Reverse(f.deleted_at));
        Ok(files)
    }

    async fn insert_file(&self, new: NewFileRecord) -> Result<FileRecord, GatewayError> {
        self.check_writable(Table::Files)?;
        let file = FileRecord {
            id: RecordId::persisted(format!("file-{}", Uuid::new_v4())),
            project_id: new.project_id,
            name: new.name,
            storage_path: new.storage_path,
            mime_type: new.mime_type,
            size_bytes: new.size_bytes,
            folder_id: new.folder_id,
            card_id: new.card_id,
            message_id: new.message_id,
            uploaded_by: new.uploaded_by,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let mut state = self.state.lock();
        state.files.push(file.clone());
        let event = TableEvent::File(ChangeEvent {
            op: ChangeOp::Insert,
            previous: None,
            current: Some(file.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(file)
    }

    async fn update_file(&self, id: &str, patch: FilePatch) -> Result<FileRecord, GatewayError> {
        self.check_writable(Table::Files)?;
        let mut state = self.state.lock();
        let file = state
            .files
            .iter_mut()
            .find(|f| f.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("file {id}")))?;
        let previous = file.clone();
        if let Some(name) = patch.name {
            file.name = name;
        }
        if let Some(storage_path) = patch.storage_path {
            file.storage_path = storage_path;
        }
        if let Some(folder_id) = patch.folder_id {
            file.folder_id = folder_id;
        }
        if let Some(deleted_at) = patch.deleted_at {
            file.deleted_at = deleted_at;
        }
        let current = file.clone();
        let event = TableEvent::File(ChangeEvent {
            op: ChangeOp::Update,
            previous: Some(previous),
            current: Some(current.clone()),
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(current)
    }

    async fn delete_file(&self, id: &str) -> Result<(), GatewayError> {
        self.check_writable(Table::Files)?;
        let mut state = self.state.lock();
        let position = state
            .files
            .iter()
            .position(|f| f.persisted_id() == Some(id))
            .ok_or_else(|| GatewayError::NotFound(format!("file {id}")))?;
        let previous = state.files.remove(position);
        let event = TableEvent::File(ChangeEvent {
            op: ChangeOp::Delete,
            previous: Some(previous),
            current: None,
            actor_id: Some(self.actor.clone()),
        });
        self.emit(&mut state, event);
        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Notification>, GatewayError> {
        let mut notifications: Vec<Notification> = self
            .state
            .lock()
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        notifications.sort_by_key(|n| std::cmp::Reverse(n.created_at));
        notifications.truncate(limit as usize);
        Ok(notifications)
    }

    async fn mark_notifications_read(&self, ids: &[String]) -> Result<(), GatewayError> {
        self.check_writable(Table::Notifications)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        for notification in &mut state.notifications {
            if let Some(id) = notification.persisted_id() {
                if ids.iter().any(|i| i == id) && notification.read_at.is_none() {
                    notification.read_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn mark_all_notifications_read(&self, user_id: &str) -> Result<(), GatewayError> {
        self.check_writable(Table::Notifications)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        for notification in &mut state.notifications {
            if notification.user_id == user_id && notification.read_at.is_none() {
                notification.read_at = Some(now);
            }
        }
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), GatewayError> {
        self.state.lock().audit.push(entry);
        Ok(())
    }

    fn subscribe(&self, table: Table, filter: SubscriptionFilter) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(Subscriber {
            table,
            filter,
            tx,
        });
        ChangeStream::new(table, rx)
    }
}

#[async_trait]
impl FileStore for MemoryBackend {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, GatewayError> {
        let mut state = self.state.lock();
        if state.fail_uploads {
            return Err(GatewayError::Storage("injected upload failure".into()));
        }
        state.objects.insert(path.to_string(), bytes);
        Ok(path.to_string())
    }

    async fn create_signed_url(
        &self,
        path: &str,
        ttl_secs: u64,
        download: bool,
    ) -> Result<String, GatewayError> {
        if !self.state.lock().objects.contains_key(path) {
            return Err(GatewayError::NotFound(format!("object {path}")));
        }
        let mut url = format!("https://files.invalid/{path}?token=test&expires={ttl_secs}");
        if download {
            url.push_str("&download=true");
        }
        Ok(url)
    }

    async fn remove(&self, paths: &[String]) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        for path in paths {
            state.objects.remove(path);
        }
        Ok(())
    }

    async fn relocate(&self, old_path: &str, new_path: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let bytes = state
            .objects
            .remove(old_path)
            .ok_or_else(|| GatewayError::NotFound(format!("object {old_path}")))?;
        state.objects.insert(new_path.to_string(), bytes);
        Ok(())
    }
}
