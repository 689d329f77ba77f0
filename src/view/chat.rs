//! Chat thread for one conversation.
//!
//! Messages are the highest-frequency entity in the app: sends are
//! optimistic with precise rollback, and realtime events merge append-only
//! by id so the scroll position survives (a reload would yank it). The
//! receipts merge never suppresses: receipt upserts are idempotent, so a
//! duplicate echo is harmless by construction.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, SyncError};
use crate::gateway::{ChangeOp, SubscriptionFilter, Table, TableEvent};
use crate::optimistic::{
    create_entry, perform_optimistic, shared_revision, upsert_by_id, Collection, MutationQueue,
    ViewLease,
};
use crate::reconciler::{decide, spawn_pump, MergePolicy, ReconcileAction};
use crate::types::{
    Keyed, Message, MessagePatch, NewMessage, Reaction, ReadReceipt, RecordId,
};

use super::ViewContext;

pub struct ChatThread {
    ctx: ViewContext,
    conversation_id: String,
    lease: ViewLease,
    revision: Arc<tokio::sync::watch::Sender<u64>>,
    /// Ascending by creation time; newest last.
    messages: Collection<Message>,
    reactions: Collection<Reaction>,
    receipts: Collection<ReadReceipt>,
    queue: MutationQueue,
    /// Paging cursor: creation time of the oldest loaded message.
    oldest_loaded: Mutex<Option<DateTime<Utc>>>,
    pumps: Vec<JoinHandle<()>>,
}

impl ChatThread {
    pub fn new(ctx: ViewContext, conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        let lease = ViewLease::new();
        let revision = shared_revision();
        let messages = Collection::with_revision(lease.clone(), Arc::clone(&revision));
        let reactions = Collection::with_revision(lease.clone(), Arc::clone(&revision));
        let receipts = Collection::with_revision(lease.clone(), Arc::clone(&revision));

        let mut thread = Self {
            ctx,
            conversation_id,
            lease,
            revision,
            messages,
            reactions,
            receipts,
            queue: MutationQueue::new(),
            oldest_loaded: Mutex::new(None),
            pumps: Vec::new(),
        };
        thread.spawn_reconcilers();
        thread
    }

    /// Latest page of messages plus their reactions.
    pub async fn load(&self) -> Result<(), SyncError> {
        let page = self
            .ctx
            .gateway
            .list_messages(
                &self.conversation_id,
                self.ctx.config.message_page_size,
                None,
            )
            .await?;
        let reactions = self.ctx.gateway.list_reactions(&self.conversation_id).await?;

        if !self.lease.is_active() {
            return Err(SyncError::StaleCollection);
        }
        let mut ascending = page;
        ascending.reverse();
        *self.oldest_loaded.lock() = ascending.first().map(|m| m.created_at);
        self.messages.replace_all(ascending);
        self.reactions.replace_all(reactions);
        Ok(())
    }

    /// Page older history in front of the current window. Returns how many
    /// messages were prepended.
    pub async fn load_older(&self) -> Result<usize, SyncError> {
        let cursor = *self.oldest_loaded.lock();
        let Some(cursor) = cursor else {
            return Ok(0);
        };
        let page = self
            .ctx
            .gateway
            .list_messages(
                &self.conversation_id,
                self.ctx.config.message_page_size,
                Some(cursor),
            )
            .await?;
        if !self.lease.is_active() {
            return Err(SyncError::StaleCollection);
        }
        if page.is_empty() {
            return Ok(0);
        }

        let mut older = page;
        older.reverse();
        *self.oldest_loaded.lock() = older.first().map(|m| m.created_at);
        let count = older.len();
        self.messages.mutate(|entries| {
            older.extend(entries.drain(..));
            *entries = older;
        });
        Ok(count)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.snapshot()
    }

    pub fn reactions_for(&self, message_id: &str) -> Vec<Reaction> {
        self.reactions
            .snapshot()
            .into_iter()
            .filter(|r| r.message_id == message_id)
            .collect()
    }

    /// Messages from others that this session has not marked read.
    pub fn unread_count(&self) -> usize {
        let own = &self.ctx.session.user_id;
        let receipts = self.receipts.snapshot();
        self.messages
            .snapshot()
            .iter()
            .filter(|m| &m.author_id != own)
            .filter(|m| {
                m.persisted_id().is_some_and(|id| {
                    !receipts
                        .iter()
                        .any(|r| r.message_id == id && &r.user_id == own)
                })
            })
            .count()
    }

    pub fn revision(&self) -> tokio::sync::watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Send a message, optionally referencing an uploaded file or a message
    /// being replied to.
    pub async fn send(
        &self,
        body: Option<String>,
        file_id: Option<String>,
        reply_to: Option<String>,
    ) -> Result<Message, SyncError> {
        if body.as_deref().map(str::trim).unwrap_or_default().is_empty() && file_id.is_none() {
            return Err(SyncError::Remote(GatewayError::Validation(
                "message needs a body or an attachment".into(),
            )));
        }

        let tentative = Message {
            id: RecordId::tentative(),
            conversation_id: self.conversation_id.clone(),
            author_id: self.ctx.session.user_id.clone(),
            body: body.clone(),
            file_id: file_id.clone(),
            reply_to: reply_to.clone(),
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        };
        let new = NewMessage {
            conversation_id: self.conversation_id.clone(),
            author_id: self.ctx.session.user_id.clone(),
            body,
            file_id,
            reply_to,
        };
        create_entry(
            &self.ctx.mutation_cx("Send message"),
            &self.messages,
            tentative,
            self.ctx.gateway.insert_message(new),
        )
        .await
    }

    pub async fn edit(&self, message_id: &str, body: impl Into<String>) -> Result<Message, SyncError> {
        let _turn = self.queue.acquire(message_id).await;

        let previous = self.messages.find_persisted(message_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("message {message_id}")))
        })?;
        let body = body.into();
        let applied = body.clone();

        perform_optimistic(
            &self.ctx.mutation_cx("Edit message"),
            &self.messages,
            |entries| {
                if let Some(message) = entries
                    .iter_mut()
                    .find(|m| m.persisted_id() == Some(message_id))
                {
                    message.body = Some(applied);
                }
            },
            self.ctx.gateway.update_message(
                message_id,
                MessagePatch {
                    body: Some(Some(body)),
                    ..MessagePatch::default()
                },
            ),
            |entries, confirmed: &Message| upsert_by_id(entries, confirmed.clone()),
            |entries| {
                if let Some(message) = entries
                    .iter_mut()
                    .find(|m| m.persisted_id() == Some(message_id))
                {
                    *message = previous;
                }
            },
            Some(message_id),
        )
        .await
    }

    /// Soft-delete with precise rollback at the original position.
    pub async fn delete(&self, message_id: &str) -> Result<(), SyncError> {
        let _turn = self.queue.acquire(message_id).await;

        let (index, previous) = {
            let snapshot = self.messages.snapshot();
            match snapshot
                .iter()
                .enumerate()
                .find(|(_, m)| m.persisted_id() == Some(message_id))
            {
                Some((i, m)) => (i, m.clone()),
                None => {
                    return Err(SyncError::Remote(GatewayError::NotFound(format!(
                        "message {message_id}"
                    ))))
                }
            }
        };

        perform_optimistic(
            &self.ctx.mutation_cx("Delete message"),
            &self.messages,
            |entries| entries.retain(|m| m.persisted_id() != Some(message_id)),
            self.ctx.gateway.update_message(
                message_id,
                MessagePatch {
                    deleted_at: Some(Some(Utc::now())),
                    ..MessagePatch::default()
                },
            ),
            |_, _confirmed: &Message| {},
            |entries| {
                let at = index.min(entries.len());
                entries.insert(at, previous);
            },
            Some(message_id),
        )
        .await?;
        Ok(())
    }

    /// Toggle this user's reaction on a message: remove the existing
    /// (message, user, emoji) row, or insert a missing one.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<(), SyncError> {
        let user_id = self.ctx.session.user_id.clone();
        let _turn = self
            .queue
            .acquire(&format!("reaction:{message_id}:{emoji}"))
            .await;

        let existing = self.reactions.snapshot().into_iter().find(|r| {
            r.message_id == message_id && r.user_id == user_id && r.emoji == emoji
        });

        match existing {
            Some(reaction) => {
                let Some(reaction_id) = reaction.persisted_id().map(str::to_string) else {
                    // A toggle raced the confirmation of the insert; the
                    // queued turn ordering makes this unreachable in
                    // practice, but losing the click beats a duplicate row.
                    log::debug!("reaction toggle skipped: entry still tentative");
                    return Ok(());
                };
                let restored = reaction.clone();
                perform_optimistic(
                    &self.ctx.mutation_cx("Remove reaction"),
                    &self.reactions,
                    |entries| entries.retain(|r| r.persisted_id() != Some(reaction_id.as_str())),
                    self.ctx.gateway.delete_reaction(&reaction_id),
                    |_, _: &()| {},
                    |entries| entries.push(restored),
                    Some(&reaction_id),
                )
                .await?;
                Ok(())
            }
            None => {
                let tentative = Reaction {
                    id: RecordId::tentative(),
                    message_id: message_id.to_string(),
                    user_id: user_id.clone(),
                    emoji: emoji.to_string(),
                    created_at: Utc::now(),
                };
                create_entry(
                    &self.ctx.mutation_cx("Add reaction"),
                    &self.reactions,
                    tentative,
                    self.ctx
                        .gateway
                        .insert_reaction(message_id, &user_id, emoji),
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Record that this session read a message. Receipt upserts are
    /// idempotent, so no rollback precision is needed; a failed write just
    /// reverts the local marker.
    pub async fn mark_read(&self, message_id: &str) -> Result<(), SyncError> {
        let user_id = self.ctx.session.user_id.clone();
        let receipt = ReadReceipt {
            message_id: message_id.to_string(),
            user_id: user_id.clone(),
            read_at: Utc::now(),
        };

        let had_receipt = self
            .receipts
            .snapshot()
            .iter()
            .any(|r| r.message_id == message_id && r.user_id == user_id);

        let applied = receipt.clone();
        let revert_user = user_id.clone();
        perform_optimistic(
            &self.ctx.mutation_cx("Mark read"),
            &self.receipts,
            move |entries| {
                entries.retain(|r| !(r.message_id == applied.message_id && r.user_id == applied.user_id));
                entries.push(applied);
            },
            self.ctx.gateway.upsert_read_receipt(message_id, &user_id),
            |entries, confirmed: &ReadReceipt| {
                entries.retain(|r| {
                    !(r.message_id == confirmed.message_id && r.user_id == confirmed.user_id)
                });
                entries.push(confirmed.clone());
            },
            move |entries| {
                if !had_receipt {
                    entries
                        .retain(|r| !(r.message_id == message_id && r.user_id == revert_user));
                }
            },
            None,
        )
        .await?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.lease.revoke();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn spawn_reconcilers(&mut self) {
        let filter = SubscriptionFilter::Conversation(self.conversation_id.clone());

        let stream = self.ctx.gateway.subscribe(Table::Messages, filter.clone());
        let ctx = self.ctx.clone();
        let messages = self.messages.clone();
        self.pumps.push(spawn_pump(
            stream,
            self.lease.clone(),
            move |event| {
                let ctx = ctx.clone();
                let messages = messages.clone();
                async move {
                    match decide(&ctx.ledger, &ctx.session, &event, MergePolicy::AppendOnly, true) {
                        ReconcileAction::Suppress => {}
                        ReconcileAction::Reload | ReconcileAction::Merge => {
                            merge_message_event(&messages, event)
                        }
                    }
                }
            },
        ));

        let stream = self.ctx.gateway.subscribe(Table::Reactions, filter.clone());
        let ctx = self.ctx.clone();
        let reactions = self.reactions.clone();
        self.pumps.push(spawn_pump(
            stream,
            self.lease.clone(),
            move |event| {
                let ctx = ctx.clone();
                let reactions = reactions.clone();
                async move {
                    match decide(&ctx.ledger, &ctx.session, &event, MergePolicy::UpsertById, true) {
                        ReconcileAction::Suppress => {}
                        ReconcileAction::Reload | ReconcileAction::Merge => {
                            merge_reaction_event(&reactions, event)
                        }
                    }
                }
            },
        ));

        // Receipts skip the decision rule entirely: the merge is an
        // idempotent upsert keyed by (message, user), so even own echoes
        // are harmless and suppression state would buy nothing.
        let stream = self.ctx.gateway.subscribe(Table::ReadReceipts, filter);
        let receipts = self.receipts.clone();
        self.pumps.push(spawn_pump(
            stream,
            self.lease.clone(),
            move |event| {
                let receipts = receipts.clone();
                async move {
                    if let TableEvent::ReadReceipt(e) = event {
                        if let Some(receipt) = e.current {
                            receipts.mutate(|entries| {
                                entries.retain(|r| {
                                    !(r.message_id == receipt.message_id
                                        && r.user_id == receipt.user_id)
                                });
                                entries.push(receipt);
                            });
                        }
                    }
                }
            },
        ));
    }
}

impl Drop for ChatThread {
    fn drop(&mut self) {
        self.close();
    }
}

/// Append-only merge keyed by id. Unknown inserts land in timestamp order;
/// known ids are replaced in place, which keeps the scroll anchor stable.
fn merge_message_event(messages: &Collection<Message>, event: TableEvent) {
    let TableEvent::Message(e) = event else {
        return;
    };
    match (e.op, e.current, e.previous) {
        (ChangeOp::Delete, _, Some(previous)) => {
            if let Some(id) = previous.persisted_id() {
                messages.remove_persisted(id);
            }
        }
        (_, Some(message), _) => {
            if message.deleted_at.is_some() {
                if let Some(id) = message.persisted_id() {
                    messages.remove_persisted(id);
                }
                return;
            }
            messages.mutate(|entries| {
                if let Some(slot) = entries
                    .iter_mut()
                    .find(|m| m.persisted_id() == message.persisted_id())
                {
                    *slot = message;
                    return;
                }
                let at = entries
                    .iter()
                    .position(|m| m.created_at > message.created_at)
                    .unwrap_or(entries.len());
                entries.insert(at, message);
            });
        }
        _ => {}
    }
}

fn merge_reaction_event(reactions: &Collection<Reaction>, event: TableEvent) {
    let TableEvent::Reaction(e) = event else {
        return;
    };
    match (e.op, e.current, e.previous) {
        (ChangeOp::Delete, _, Some(previous)) => {
            if let Some(id) = previous.persisted_id() {
                reactions.remove_persisted(id);
            }
        }
        (_, Some(reaction), _) => reactions.upsert(reaction),
        _ => {}
    }
}
