//! Trash drawer: soft-deleted cards and files for one project.
//!
//! Everything here is low-frequency and structural, so operations are
//! remote-first followed by a reload; there is no realtime channel, exactly
//! like the screens this backs. Restore clears the deletion timestamp; hard
//! delete removes the row for good.

use chrono::Utc;
use std::sync::Arc;

use crate::audit::AuditRecorder;
use crate::error::SyncError;
use crate::optimistic::{Collection, ViewLease};
use crate::types::{
    AuditAction, CardPatch, FilePatch, Keyed, MessagePatch, RecordId,
};

use super::ViewContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrashKind {
    Card,
    File,
    Message,
}

impl TrashKind {
    fn entity(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::File => "file",
            Self::Message => "message",
        }
    }
}

/// One restorable entry, newest deletion first.
#[derive(Debug, Clone)]
pub struct TrashItem {
    pub id: RecordId,
    pub kind: TrashKind,
    pub title: String,
    pub deleted_at: chrono::DateTime<Utc>,
}

impl Keyed for TrashItem {
    fn record_id(&self) -> &RecordId {
        &self.id
    }
}

pub struct TrashView {
    ctx: ViewContext,
    project_id: String,
    lease: ViewLease,
    items: Collection<TrashItem>,
    audit: AuditRecorder,
}

impl TrashView {
    pub fn new(ctx: ViewContext, project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let lease = ViewLease::new();
        let items = Collection::new(lease.clone());
        let audit = AuditRecorder::new(
            Arc::clone(&ctx.gateway),
            ctx.session.clone(),
            Some(project_id.clone()),
        );
        Self {
            ctx,
            project_id,
            lease,
            items,
            audit,
        }
    }

    pub async fn load(&self) -> Result<(), SyncError> {
        let cards = self.ctx.gateway.list_trashed_cards(&self.project_id).await?;
        let files = self.ctx.gateway.list_trashed_files(&self.project_id).await?;
        if !self.lease.is_active() {
            return Err(SyncError::StaleCollection);
        }

        let mut items: Vec<TrashItem> = cards
            .into_iter()
            .filter_map(|card| {
                card.deleted_at.map(|deleted_at| TrashItem {
                    id: card.id.clone(),
                    kind: TrashKind::Card,
                    title: card.title.clone(),
                    deleted_at,
                })
            })
            .chain(files.into_iter().filter_map(|file| {
                file.deleted_at.map(|deleted_at| TrashItem {
                    id: file.id.clone(),
                    kind: TrashKind::File,
                    title: file.name.clone(),
                    deleted_at,
                })
            }))
            .collect();
        items.sort_by_key(|i| std::cmp::Reverse(i.deleted_at));
        self.items.replace_all(items);
        Ok(())
    }

    pub fn items(&self) -> Vec<TrashItem> {
        self.items.snapshot()
    }

    pub fn revision(&self) -> tokio::sync::watch::Receiver<u64> {
        self.items.revision()
    }

    /// Clear the deletion timestamp, returning the entity to its active
    /// collection. The trash listing reloads afterwards.
    pub async fn restore(&self, kind: TrashKind, id: &str) -> Result<(), SyncError> {
        let result = match kind {
            TrashKind::Card => self
                .ctx
                .gateway
                .update_card(
                    id,
                    CardPatch {
                        deleted_at: Some(None),
                        ..CardPatch::default()
                    },
                )
                .await
                .map(|_| ()),
            TrashKind::File => self
                .ctx
                .gateway
                .update_file(
                    id,
                    FilePatch {
                        deleted_at: Some(None),
                        ..FilePatch::default()
                    },
                )
                .await
                .map(|_| ()),
            TrashKind::Message => self
                .ctx
                .gateway
                .update_message(
                    id,
                    MessagePatch {
                        deleted_at: Some(None),
                        ..MessagePatch::default()
                    },
                )
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                self.ctx.ledger.record(id);
                self.audit
                    .record(kind.entity(), id, AuditAction::Restore, None)
                    .await;
                self.reload_after_mutation().await;
                Ok(())
            }
            Err(err) => {
                let err = SyncError::Remote(err);
                self.ctx.notices.sync_failure("Restore item", &err);
                Err(err)
            }
        }
    }

    /// Remove the row permanently. There is no way back from here.
    pub async fn hard_delete(&self, kind: TrashKind, id: &str) -> Result<(), SyncError> {
        let result = match kind {
            TrashKind::Card => self.ctx.gateway.delete_card(id).await,
            TrashKind::File => self.ctx.gateway.delete_file(id).await,
            TrashKind::Message => self.ctx.gateway.delete_message(id).await,
        };

        match result {
            Ok(()) => {
                self.ctx.ledger.record(id);
                self.audit
                    .record(kind.entity(), id, AuditAction::HardDelete, None)
                    .await;
                self.reload_after_mutation().await;
                Ok(())
            }
            Err(err) => {
                let err = SyncError::Remote(err);
                self.ctx.notices.sync_failure("Delete permanently", &err);
                Err(err)
            }
        }
    }

    pub fn close(&mut self) {
        self.lease.revoke();
    }

    async fn reload_after_mutation(&self) {
        if let Err(err) = self.load().await {
            if !matches!(err, SyncError::StaleCollection) {
                log::warn!("trash: reload failed: {err}");
            }
        }
    }
}

impl Drop for TrashView {
    fn drop(&mut self) {
        self.close();
    }
}
