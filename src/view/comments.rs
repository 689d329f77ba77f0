//! Comment thread for one card.
//!
//! Comments are high-frequency: failed writes roll back the exact entry
//! instead of reloading, and realtime events merge by id so an open thread
//! never flickers. `@{user-id}` mention markers are extracted on post and
//! recorded for the notification fan-out.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::audit::AuditRecorder;
use crate::error::{GatewayError, SyncError};
use crate::gateway::{ChangeOp, SubscriptionFilter, Table, TableEvent};
use crate::optimistic::{create_entry, perform_optimistic, Collection, MutationQueue, ViewLease};
use crate::reconciler::{decide, spawn_pump, MergePolicy, ReconcileAction};
use crate::types::{AuditAction, Comment, CommentPatch, Keyed, NewComment, RecordId};

use super::ViewContext;

/// Pull the user ids out of `@{user-id}` markers in a comment body.
pub fn extract_mentions(body: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("@{") {
        rest = &rest[start + 2..];
        match rest.find('}') {
            Some(end) => {
                let id = &rest[..end];
                if !id.is_empty() && !mentions.iter().any(|m| m == id) {
                    mentions.push(id.to_string());
                }
                rest = &rest[end + 1..];
            }
            None => break,
        }
    }
    mentions
}

pub struct CommentThread {
    ctx: ViewContext,
    card_id: String,
    lease: ViewLease,
    comments: Collection<Comment>,
    queue: MutationQueue,
    audit: AuditRecorder,
    pumps: Vec<JoinHandle<()>>,
}

impl CommentThread {
    pub fn new(
        ctx: ViewContext,
        project_id: impl Into<String>,
        card_id: impl Into<String>,
    ) -> Self {
        let card_id = card_id.into();
        let lease = ViewLease::new();
        let comments = Collection::new(lease.clone());
        let audit = AuditRecorder::new(
            Arc::clone(&ctx.gateway),
            ctx.session.clone(),
            Some(project_id.into()),
        );

        let mut thread = Self {
            ctx,
            card_id,
            lease,
            comments,
            queue: MutationQueue::new(),
            audit,
            pumps: Vec::new(),
        };
        thread.spawn_reconciler();
        thread
    }

    pub async fn load(&self) -> Result<(), SyncError> {
        let loaded = self.ctx.gateway.list_comments(&self.card_id).await?;
        if !self.lease.is_active() {
            return Err(SyncError::StaleCollection);
        }
        self.comments.replace_all(loaded);
        Ok(())
    }

    /// Comments in creation order.
    pub fn comments(&self) -> Vec<Comment> {
        self.comments.snapshot()
    }

    pub fn revision(&self) -> tokio::sync::watch::Receiver<u64> {
        self.comments.revision()
    }

    /// Post a comment. It appears immediately; on failure it disappears and
    /// a notice is shown. Mention rows are recorded only after the comment
    /// itself confirmed.
    pub async fn post(&self, body: impl Into<String>) -> Result<Comment, SyncError> {
        let body = body.into();
        let tentative = Comment {
            id: RecordId::tentative(),
            card_id: self.card_id.clone(),
            author_id: self.ctx.session.user_id.clone(),
            body: body.clone(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        let new = NewComment {
            card_id: self.card_id.clone(),
            author_id: self.ctx.session.user_id.clone(),
            body: body.clone(),
        };

        let comment = create_entry(
            &self.ctx.mutation_cx("Post comment"),
            &self.comments,
            tentative,
            self.ctx.gateway.insert_comment(new),
        )
        .await?;

        if let Some(id) = comment.persisted_id() {
            let mentions = extract_mentions(&body);
            if !mentions.is_empty() {
                if let Err(err) = self
                    .ctx
                    .gateway
                    .insert_comment_mentions(id, &mentions)
                    .await
                {
                    log::warn!("comments: mention rows for {id} failed: {err}");
                }
            }
            self.audit
                .record("comment", id, AuditAction::Create, None)
                .await;
        }
        Ok(comment)
    }

    pub async fn edit(&self, comment_id: &str, body: impl Into<String>) -> Result<Comment, SyncError> {
        let _turn = self.queue.acquire(comment_id).await;

        let previous = self.comments.find_persisted(comment_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("comment {comment_id}")))
        })?;
        let body = body.into();
        let applied = body.clone();

        perform_optimistic(
            &self.ctx.mutation_cx("Edit comment"),
            &self.comments,
            |entries| {
                if let Some(comment) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(comment_id))
                {
                    comment.body = applied;
                }
            },
            self.ctx.gateway.update_comment(
                comment_id,
                CommentPatch {
                    body: Some(body),
                    ..CommentPatch::default()
                },
            ),
            |entries, confirmed: &Comment| {
                crate::optimistic::upsert_by_id(entries, confirmed.clone())
            },
            |entries| {
                if let Some(comment) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(comment_id))
                {
                    *comment = previous;
                }
            },
            Some(comment_id),
        )
        .await
    }

    /// Soft-delete with a precise rollback: the exact entry comes back if
    /// the write fails.
    pub async fn delete(&self, comment_id: &str) -> Result<(), SyncError> {
        let _turn = self.queue.acquire(comment_id).await;

        let (index, previous) = {
            let snapshot = self.comments.snapshot();
            match snapshot
                .iter()
                .enumerate()
                .find(|(_, c)| c.persisted_id() == Some(comment_id))
            {
                Some((i, c)) => (i, c.clone()),
                None => {
                    return Err(SyncError::Remote(GatewayError::NotFound(format!(
                        "comment {comment_id}"
                    ))))
                }
            }
        };

        perform_optimistic(
            &self.ctx.mutation_cx("Delete comment"),
            &self.comments,
            |entries| entries.retain(|c| c.persisted_id() != Some(comment_id)),
            self.ctx.gateway.update_comment(
                comment_id,
                CommentPatch {
                    deleted_at: Some(Some(Utc::now())),
                    ..CommentPatch::default()
                },
            ),
            |_, _confirmed: &Comment| {},
            |entries| {
                let at = index.min(entries.len());
                entries.insert(at, previous);
            },
            Some(comment_id),
        )
        .await?;

        self.audit
            .record("comment", comment_id, AuditAction::SoftDelete, None)
            .await;
        Ok(())
    }

    pub fn close(&mut self) {
        self.lease.revoke();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn spawn_reconciler(&mut self) {
        let stream = self
            .ctx
            .gateway
            .subscribe(Table::Comments, SubscriptionFilter::Card(self.card_id.clone()));
        let ctx = self.ctx.clone();
        let comments = self.comments.clone();
        let pump = spawn_pump(stream, self.lease.clone(), move |event| {
            let ctx = ctx.clone();
            let comments = comments.clone();
            async move {
                // Own-actor comment events are already reflected
                // optimistically; suppressing them avoids duplicate entries
                // even after the ledger window lapsed.
                match decide(&ctx.ledger, &ctx.session, &event, MergePolicy::UpsertById, true) {
                    ReconcileAction::Suppress => {}
                    ReconcileAction::Reload | ReconcileAction::Merge => {
                        merge_comment_event(&comments, event)
                    }
                }
            }
        });
        self.pumps.push(pump);
    }
}

impl Drop for CommentThread {
    fn drop(&mut self) {
        self.close();
    }
}

fn merge_comment_event(comments: &Collection<Comment>, event: TableEvent) {
    let TableEvent::Comment(e) = event else {
        return;
    };
    match (e.op, e.current, e.previous) {
        (ChangeOp::Delete, _, Some(previous)) => {
            if let Some(id) = previous.persisted_id() {
                comments.remove_persisted(id);
            }
        }
        (_, Some(comment), _) => {
            if comment.deleted_at.is_some() {
                if let Some(id) = comment.persisted_id() {
                    comments.remove_persisted(id);
                }
            } else {
                comments.mutate(|entries| {
                    crate::optimistic::upsert_by_id(entries, comment);
                    entries.sort_by_key(|c| c.created_at);
                });
            }
        }
        _ => {}
    }
}
