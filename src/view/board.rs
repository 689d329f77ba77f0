//! Board view-model: columns, cards, and tags for one project.
//!
//! Cards live in a flat collection keyed by id; column membership is the
//! card's `column_id` field, so a move is one in-place reassignment and a
//! re-render can never observe the card absent from both columns. Card and
//! column events merge by id (a full board reload on every event flickers);
//! comment events only affect the derived comment counts and trigger the
//! cheap reload instead.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::audit::AuditRecorder;
use crate::error::{GatewayError, SyncError};
use crate::gateway::{ChangeOp, SubscriptionFilter, Table, TableEvent};
use crate::optimistic::{
    create_entry, perform_optimistic, shared_revision, upsert_by_id, Collection, MutationQueue,
    ViewLease,
};
use crate::reconciler::{decide, spawn_pump, MergePolicy, ReconcileAction};
use crate::types::{
    AuditAction, Card, CardPatch, Column, ColumnPatch, Keyed, NewCard, NewColumn, RecordId, Tag,
};

use super::ViewContext;

/// One column with its cards, as the UI renders it.
#[derive(Debug, Clone)]
pub struct BoardColumn {
    pub column: Column,
    pub cards: Vec<Card>,
}

pub struct BoardView {
    ctx: ViewContext,
    project_id: String,
    lease: ViewLease,
    revision: Arc<tokio::sync::watch::Sender<u64>>,
    columns: Collection<Column>,
    cards: Collection<Card>,
    tags: Collection<Tag>,
    queue: MutationQueue,
    audit: AuditRecorder,
    pumps: Vec<JoinHandle<()>>,
}

impl BoardView {
    /// Build the view-model and register its realtime subscriptions. Call
    /// [`BoardView::load`] afterwards; every screen reloads on mount.
    pub fn new(ctx: ViewContext, project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let lease = ViewLease::new();
        let revision = shared_revision();
        let columns = Collection::with_revision(lease.clone(), Arc::clone(&revision));
        let cards = Collection::with_revision(lease.clone(), Arc::clone(&revision));
        let tags = Collection::with_revision(lease.clone(), Arc::clone(&revision));
        let audit = AuditRecorder::new(
            Arc::clone(&ctx.gateway),
            ctx.session.clone(),
            Some(project_id.clone()),
        );

        let mut board = Self {
            ctx,
            project_id,
            lease,
            revision,
            columns,
            cards,
            tags,
            queue: MutationQueue::new(),
            audit,
            pumps: Vec::new(),
        };
        board.spawn_reconcilers();
        board
    }

    /// Full fetch, replacing the local collections.
    pub async fn load(&self) -> Result<(), SyncError> {
        match load_board(
            &self.ctx,
            &self.project_id,
            &self.columns,
            &self.cards,
            &self.tags,
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.ctx.notices.sync_failure("Load board", &err);
                Err(err)
            }
        }
    }

    /// Single revision signal across columns, cards, and tags.
    pub fn revision(&self) -> tokio::sync::watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.tags.snapshot()
    }

    /// Columns in order, each with its active cards.
    pub fn columns_with_cards(&self) -> Vec<BoardColumn> {
        let mut columns = self.columns.snapshot();
        columns.sort_by_key(|c| c.order);
        let cards = self.cards.snapshot();
        columns
            .into_iter()
            .map(|column| {
                let column_cards = cards
                    .iter()
                    .filter(|card| {
                        card.deleted_at.is_none()
                            && column.persisted_id() == Some(card.column_id.as_str())
                    })
                    .cloned()
                    .collect();
                BoardColumn {
                    column,
                    cards: column_cards,
                }
            })
            .collect()
    }

    /// Create a card in a column. The tentative card is visible immediately
    /// and swapped for the authoritative record on confirmation.
    pub async fn create_card(
        &self,
        column_id: &str,
        title: impl Into<String>,
    ) -> Result<Card, SyncError> {
        let title = title.into();
        self.warn_if_over_wip(column_id, 1);

        let tentative = Card {
            id: RecordId::tentative(),
            project_id: self.project_id.clone(),
            column_id: column_id.to_string(),
            title: title.clone(),
            description: None,
            priority: None,
            due_at: None,
            estimate: None,
            created_by: self.ctx.session.user_id.clone(),
            assignee_ids: Vec::new(),
            tag_ids: Vec::new(),
            comment_count: 0,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        };

        let new = NewCard {
            project_id: self.project_id.clone(),
            column_id: column_id.to_string(),
            title,
            created_by: self.ctx.session.user_id.clone(),
        };
        let card = create_entry(
            &self.ctx.mutation_cx("Create card"),
            &self.cards,
            tentative,
            self.ctx.gateway.insert_card(new),
        )
        .await?;

        if let Some(id) = card.persisted_id() {
            self.audit.record("card", id, AuditAction::Create, None).await;
        }
        Ok(card)
    }

    /// Move a card to another column: one atomic `column_id` reassignment,
    /// never a remove-then-insert. On failure the board reloads instead of
    /// attempting a partial rollback of a structural change.
    pub async fn move_card(&self, card_id: &str, target_column_id: &str) -> Result<(), SyncError> {
        let _turn = self.queue.acquire(card_id).await;

        let card = self
            .cards
            .find_persisted(card_id)
            .ok_or_else(|| SyncError::Remote(GatewayError::NotFound(format!("card {card_id}"))))?;
        let source_column_id = card.column_id.clone();
        if source_column_id == target_column_id {
            return Ok(());
        }
        self.warn_if_over_wip(target_column_id, 1);

        let target = target_column_id.to_string();
        let result = perform_optimistic(
            &self.ctx.mutation_cx("Move card"),
            &self.cards,
            |entries| {
                if let Some(card) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(card_id))
                {
                    card.column_id = target;
                }
            },
            self.ctx
                .gateway
                .update_card(card_id, CardPatch::move_to(target_column_id)),
            |entries, confirmed: &Card| upsert_by_id(entries, confirmed.clone()),
            |_| {},
            Some(card_id),
        )
        .await;

        match result {
            Ok(_) => {
                self.audit
                    .record(
                        "card",
                        card_id,
                        AuditAction::Move,
                        Some(serde_json::json!({
                            "from": source_column_id,
                            "to": target_column_id,
                        })),
                    )
                    .await;
                Ok(())
            }
            Err(SyncError::StaleCollection) => Err(SyncError::StaleCollection),
            Err(err) => {
                log::warn!("board: move of {card_id} failed, reloading");
                if let Err(reload_err) = load_board(
                    &self.ctx,
                    &self.project_id,
                    &self.columns,
                    &self.cards,
                    &self.tags,
                )
                .await
                {
                    log::warn!("board: reload after failed move also failed: {reload_err}");
                }
                Err(err)
            }
        }
    }

    /// Field-level card edit with a targeted revert on failure.
    pub async fn update_card(&self, card_id: &str, patch: CardPatch) -> Result<Card, SyncError> {
        let _turn = self.queue.acquire(card_id).await;

        let previous = self
            .cards
            .find_persisted(card_id)
            .ok_or_else(|| SyncError::Remote(GatewayError::NotFound(format!("card {card_id}"))))?;

        let applied = patch.clone();
        perform_optimistic(
            &self.ctx.mutation_cx("Update card"),
            &self.cards,
            |entries| {
                if let Some(card) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(card_id))
                {
                    apply_card_patch(card, applied);
                }
            },
            self.ctx.gateway.update_card(card_id, patch),
            |entries, confirmed: &Card| upsert_by_id(entries, confirmed.clone()),
            |entries| upsert_by_id(entries, previous),
            Some(card_id),
        )
        .await
    }

    /// Soft-delete: the card leaves the board immediately and lands in the
    /// trash once confirmed.
    pub async fn delete_card(&self, card_id: &str) -> Result<(), SyncError> {
        let _turn = self.queue.acquire(card_id).await;

        let previous = self
            .cards
            .find_persisted(card_id)
            .ok_or_else(|| SyncError::Remote(GatewayError::NotFound(format!("card {card_id}"))))?;

        let patch = CardPatch {
            deleted_at: Some(Some(Utc::now())),
            ..CardPatch::default()
        };
        perform_optimistic(
            &self.ctx.mutation_cx("Delete card"),
            &self.cards,
            |entries| entries.retain(|c| c.persisted_id() != Some(card_id)),
            self.ctx.gateway.update_card(card_id, patch),
            |_, _confirmed: &Card| {},
            |entries| entries.push(previous),
            Some(card_id),
        )
        .await?;

        self.audit
            .record("card", card_id, AuditAction::SoftDelete, None)
            .await;
        Ok(())
    }

    pub async fn create_column(
        &self,
        name: impl Into<String>,
        wip_limit: Option<u32>,
    ) -> Result<Column, SyncError> {
        let name = name.into();
        let order = self.columns.len() as u32;
        let tentative = Column {
            id: RecordId::tentative(),
            project_id: self.project_id.clone(),
            name: name.clone(),
            order,
            wip_limit,
        };
        let new = NewColumn {
            project_id: self.project_id.clone(),
            name,
            order,
            wip_limit,
        };
        create_entry(
            &self.ctx.mutation_cx("Create column"),
            &self.columns,
            tentative,
            self.ctx.gateway.insert_column(new),
        )
        .await
    }

    /// Column edits are low-frequency and structural: apply locally, and
    /// fall back to a full reload when the write fails.
    pub async fn update_column(
        &self,
        column_id: &str,
        patch: ColumnPatch,
    ) -> Result<Column, SyncError> {
        let _turn = self.queue.acquire(column_id).await;

        let applied = patch.clone();
        let result = perform_optimistic(
            &self.ctx.mutation_cx("Update column"),
            &self.columns,
            |entries| {
                if let Some(column) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(column_id))
                {
                    apply_column_patch(column, applied);
                }
            },
            self.ctx.gateway.update_column(column_id, patch),
            |entries, confirmed: &Column| upsert_by_id(entries, confirmed.clone()),
            |_| {},
            Some(column_id),
        )
        .await;

        if let Err(err) = &result {
            if !matches!(err, SyncError::StaleCollection) {
                if let Err(reload_err) = load_board(
                    &self.ctx,
                    &self.project_id,
                    &self.columns,
                    &self.cards,
                    &self.tags,
                )
                .await
                {
                    log::warn!("board: reload after failed column update failed: {reload_err}");
                }
            }
        }
        result
    }

    /// Tear down: revoke the lease and stop the reconciler pumps. In-flight
    /// reconciliations are dropped silently from here on.
    pub fn close(&mut self) {
        self.lease.revoke();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn warn_if_over_wip(&self, column_id: &str, adding: usize) {
        let Some(column) = self.columns.find_persisted(column_id) else {
            return;
        };
        let Some(limit) = column.wip_limit else {
            return;
        };
        let occupancy = self
            .cards
            .snapshot()
            .iter()
            .filter(|c| c.column_id == column_id && c.deleted_at.is_none())
            .count();
        if occupancy + adding > limit as usize {
            self.ctx.notices.warning(
                "WIP limit exceeded",
                format!(
                    "\"{}\" is over its WIP limit of {} ({} cards)",
                    column.name,
                    limit,
                    occupancy + adding
                ),
            );
        }
    }

    fn spawn_reconcilers(&mut self) {
        let subscriptions = [
            (Table::Cards, MergePolicy::UpsertById),
            (Table::Columns, MergePolicy::UpsertById),
            (Table::Tags, MergePolicy::UpsertById),
            // Comment events only move the derived counts; a reload is cheap
            // at that frequency.
            (Table::Comments, MergePolicy::Reload),
        ];
        for (table, policy) in subscriptions {
            let stream = self
                .ctx
                .gateway
                .subscribe(table, SubscriptionFilter::Project(self.project_id.clone()));
            let ctx = self.ctx.clone();
            let project_id = self.project_id.clone();
            let columns = self.columns.clone();
            let cards = self.cards.clone();
            let tags = self.tags.clone();
            let pump = spawn_pump(stream, self.lease.clone(), move |event| {
                let ctx = ctx.clone();
                let project_id = project_id.clone();
                let columns = columns.clone();
                let cards = cards.clone();
                let tags = tags.clone();
                async move {
                    match decide(&ctx.ledger, &ctx.session, &event, policy, false) {
                        ReconcileAction::Suppress => {}
                        ReconcileAction::Reload => {
                            if let Err(err) =
                                load_board(&ctx, &project_id, &columns, &cards, &tags).await
                            {
                                log::warn!("board: realtime reload failed: {err}");
                            }
                        }
                        ReconcileAction::Merge => merge_board_event(&columns, &cards, &tags, event),
                    }
                }
            });
            self.pumps.push(pump);
        }
    }
}

impl Drop for BoardView {
    fn drop(&mut self) {
        self.close();
    }
}

async fn load_board(
    ctx: &ViewContext,
    project_id: &str,
    columns: &Collection<Column>,
    cards: &Collection<Card>,
    tags: &Collection<Tag>,
) -> Result<(), SyncError> {
    let loaded_columns = ctx.gateway.list_columns(project_id).await?;
    let loaded_cards = ctx.gateway.list_cards(project_id).await?;
    let loaded_tags = ctx.gateway.list_tags(project_id).await?;

    if !cards.lease().is_active() {
        return Err(SyncError::StaleCollection);
    }
    columns.replace_all(loaded_columns);
    cards.replace_all(loaded_cards);
    tags.replace_all(loaded_tags);
    log::debug!("board {project_id}: loaded {} cards", cards.len());
    Ok(())
}

/// Targeted merge for card/column/tag events. Idempotent: a duplicate
/// delivery upserts the same row again.
fn merge_board_event(
    columns: &Collection<Column>,
    cards: &Collection<Card>,
    tags: &Collection<Tag>,
    event: TableEvent,
) {
    match event {
        TableEvent::Card(e) => match (e.op, e.current, e.previous) {
            (ChangeOp::Delete, _, Some(previous)) => {
                if let Some(id) = previous.persisted_id() {
                    cards.remove_persisted(id);
                }
            }
            (_, Some(card), _) => {
                if card.deleted_at.is_some() {
                    // Soft deletions arrive as updates; the card leaves the
                    // active board.
                    if let Some(id) = card.persisted_id() {
                        cards.remove_persisted(id);
                    }
                } else {
                    cards.upsert(card);
                }
            }
            _ => {}
        },
        TableEvent::Column(e) => match (e.op, e.current, e.previous) {
            (ChangeOp::Delete, _, Some(previous)) => {
                if let Some(id) = previous.persisted_id() {
                    columns.remove_persisted(id);
                }
            }
            (_, Some(column), _) => columns.upsert(column),
            _ => {}
        },
        TableEvent::Tag(e) => match (e.op, e.current, e.previous) {
            (ChangeOp::Delete, _, Some(previous)) => {
                if let Some(id) = previous.persisted_id() {
                    tags.remove_persisted(id);
                }
            }
            (_, Some(tag), _) => tags.upsert(tag),
            _ => {}
        },
        other => log::debug!("board: ignoring merge for {:?}", other.table()),
    }
}

fn apply_card_patch(card: &mut Card, patch: CardPatch) {
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
}

fn apply_column_patch(column: &mut Column, patch: ColumnPatch) {
    if let Some(name) = patch.name {
        column.name = name;
    }
    if let Some(order) = patch.order {
        column.order = order;
    }
    if let Some(wip_limit) = patch.wip_limit {
        column.wip_limit = wip_limit;
    }
}
