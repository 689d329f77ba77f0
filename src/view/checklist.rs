//! Checklists for one card.
//!
//! Checklists hold their items inline, so item mutations are nested edits
//! inside the flat checklist collection. Items are high-frequency: toggles
//! roll back the exact flag on failure, and concurrent toggles of the same
//! item are queued per item id so the final persisted state matches the
//! final toggle, never an intermediate one.

use tokio::task::JoinHandle;

use crate::error::{GatewayError, SyncError};
use crate::gateway::{ChangeOp, SubscriptionFilter, Table, TableEvent};
use crate::optimistic::{create_entry, perform_optimistic, Collection, MutationQueue, ViewLease};
use crate::reconciler::{decide, spawn_pump, MergePolicy, ReconcileAction};
use crate::types::{
    Checklist, ChecklistItem, ChecklistItemPatch, Keyed, NewChecklist, NewChecklistItem, RecordId,
};

use super::ViewContext;

pub struct ChecklistSet {
    ctx: ViewContext,
    card_id: String,
    lease: ViewLease,
    checklists: Collection<Checklist>,
    queue: MutationQueue,
    pumps: Vec<JoinHandle<()>>,
}

impl ChecklistSet {
    pub fn new(ctx: ViewContext, card_id: impl Into<String>) -> Self {
        let card_id = card_id.into();
        let lease = ViewLease::new();
        let checklists = Collection::new(lease.clone());

        let mut set = Self {
            ctx,
            card_id,
            lease,
            checklists,
            queue: MutationQueue::new(),
            pumps: Vec::new(),
        };
        set.spawn_reconcilers();
        set
    }

    pub async fn load(&self) -> Result<(), SyncError> {
        let loaded = self.ctx.gateway.list_checklists(&self.card_id).await?;
        if !self.lease.is_active() {
            return Err(SyncError::StaleCollection);
        }
        self.checklists.replace_all(loaded);
        Ok(())
    }

    pub fn checklists(&self) -> Vec<Checklist> {
        self.checklists.snapshot()
    }

    pub fn revision(&self) -> tokio::sync::watch::Receiver<u64> {
        self.checklists.revision()
    }

    pub async fn add_checklist(&self, title: impl Into<String>) -> Result<Checklist, SyncError> {
        let title = title.into();
        let order = self.checklists.len() as u32;
        let tentative = Checklist {
            id: RecordId::tentative(),
            card_id: self.card_id.clone(),
            title: title.clone(),
            order,
            items: Vec::new(),
        };
        let new = NewChecklist {
            card_id: self.card_id.clone(),
            title,
            order,
        };
        create_entry(
            &self.ctx.mutation_cx("Create checklist"),
            &self.checklists,
            tentative,
            self.ctx.gateway.insert_checklist(new),
        )
        .await
    }

    /// Add an item to a persisted checklist. The tentative item shows up in
    /// the list immediately and is swapped or removed when the cycle
    /// completes.
    pub async fn add_item(
        &self,
        checklist_id: &str,
        title: impl Into<String>,
    ) -> Result<ChecklistItem, SyncError> {
        let title = title.into();
        let parent = self.checklists.find_persisted(checklist_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("checklist {checklist_id}")))
        })?;
        let order = parent.items.len() as u32;

        let tentative = ChecklistItem {
            id: RecordId::tentative(),
            checklist_id: checklist_id.to_string(),
            title: title.clone(),
            order,
            done: false,
            done_at: None,
        };
        let token = tentative.id.clone();
        let entry = tentative.clone();
        let new = NewChecklistItem {
            checklist_id: checklist_id.to_string(),
            title,
            order,
        };

        let rollback_token = token.clone();
        let item = perform_optimistic(
            &self.ctx.mutation_cx("Add checklist item"),
            &self.checklists,
            move |entries| {
                if let Some(checklist) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(checklist_id))
                {
                    checklist.items.push(entry);
                }
            },
            self.ctx.gateway.insert_checklist_item(new),
            move |entries, confirmed: &ChecklistItem| {
                if let Some(checklist) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(checklist_id))
                {
                    match checklist.items.iter_mut().find(|i| i.id == token) {
                        Some(slot) => *slot = confirmed.clone(),
                        None => checklist.items.push(confirmed.clone()),
                    }
                }
            },
            move |entries| {
                for checklist in entries.iter_mut() {
                    checklist.items.retain(|i| i.id != rollback_token);
                }
            },
            None,
        )
        .await?;

        if let Some(id) = item.persisted_id() {
            self.ctx.ledger.record(id);
        }
        Ok(item)
    }

    /// Flip an item's done flag. Queued per item id: a second toggle issued
    /// before the first resolves waits its turn, so the last write carries
    /// the final state.
    pub async fn toggle_item(&self, item_id: &str) -> Result<ChecklistItem, SyncError> {
        let _turn = self.queue.acquire(item_id).await;

        let current = self.find_item(item_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("checklist item {item_id}")))
        })?;
        let target_done = !current.done;

        let patch = ChecklistItemPatch {
            done: Some(target_done),
            ..ChecklistItemPatch::default()
        };
        perform_optimistic(
            &self.ctx.mutation_cx("Toggle checklist item"),
            &self.checklists,
            |entries| {
                if let Some(item) = find_item_mut(entries, item_id) {
                    item.done = target_done;
                }
            },
            self.ctx.gateway.update_checklist_item(item_id, patch),
            |entries, confirmed: &ChecklistItem| {
                if let Some(item) = find_item_mut(entries, item_id) {
                    *item = confirmed.clone();
                }
            },
            |entries| {
                if let Some(item) = find_item_mut(entries, item_id) {
                    item.done = !target_done;
                }
            },
            Some(item_id),
        )
        .await
    }

    pub async fn rename_item(
        &self,
        item_id: &str,
        title: impl Into<String>,
    ) -> Result<ChecklistItem, SyncError> {
        let _turn = self.queue.acquire(item_id).await;

        let previous = self.find_item(item_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("checklist item {item_id}")))
        })?;
        let title = title.into();
        let applied = title.clone();

        perform_optimistic(
            &self.ctx.mutation_cx("Rename checklist item"),
            &self.checklists,
            |entries| {
                if let Some(item) = find_item_mut(entries, item_id) {
                    item.title = applied;
                }
            },
            self.ctx.gateway.update_checklist_item(
                item_id,
                ChecklistItemPatch {
                    title: Some(title),
                    ..ChecklistItemPatch::default()
                },
            ),
            |entries, confirmed: &ChecklistItem| {
                if let Some(item) = find_item_mut(entries, item_id) {
                    *item = confirmed.clone();
                }
            },
            |entries| {
                if let Some(item) = find_item_mut(entries, item_id) {
                    item.title = previous.title;
                }
            },
            Some(item_id),
        )
        .await
    }

    pub async fn delete_item(&self, item_id: &str) -> Result<(), SyncError> {
        let _turn = self.queue.acquire(item_id).await;

        let previous = self.find_item(item_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("checklist item {item_id}")))
        })?;
        let parent_id = previous.checklist_id.clone();

        perform_optimistic(
            &self.ctx.mutation_cx("Delete checklist item"),
            &self.checklists,
            |entries| {
                for checklist in entries.iter_mut() {
                    checklist.items.retain(|i| i.persisted_id() != Some(item_id));
                }
            },
            self.ctx.gateway.delete_checklist_item(item_id),
            |_, _: &()| {},
            move |entries| {
                if let Some(checklist) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(parent_id.as_str()))
                {
                    let at = (previous.order as usize).min(checklist.items.len());
                    checklist.items.insert(at, previous);
                }
            },
            Some(item_id),
        )
        .await
    }

    pub fn close(&mut self) {
        self.lease.revoke();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn find_item(&self, item_id: &str) -> Option<ChecklistItem> {
        self.checklists
            .snapshot()
            .iter()
            .flat_map(|c| c.items.iter())
            .find(|i| i.persisted_id() == Some(item_id))
            .cloned()
    }

    fn spawn_reconcilers(&mut self) {
        for table in [Table::Checklists, Table::ChecklistItems] {
            let stream = self
                .ctx
                .gateway
                .subscribe(table, SubscriptionFilter::Card(self.card_id.clone()));
            let ctx = self.ctx.clone();
            let checklists = self.checklists.clone();
            let pump = spawn_pump(stream, self.lease.clone(), move |event| {
                let ctx = ctx.clone();
                let checklists = checklists.clone();
                async move {
                    match decide(&ctx.ledger, &ctx.session, &event, MergePolicy::UpsertById, true) {
                        ReconcileAction::Suppress => {}
                        ReconcileAction::Reload | ReconcileAction::Merge => {
                            merge_checklist_event(&checklists, event)
                        }
                    }
                }
            });
            self.pumps.push(pump);
        }
    }
}

impl Drop for ChecklistSet {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_item_mut<'a>(entries: &'a mut [Checklist], item_id: &str) -> Option<&'a mut ChecklistItem> {
    entries
        .iter_mut()
        .flat_map(|c| c.items.iter_mut())
        .find(|i| i.persisted_id() == Some(item_id))
}

fn merge_checklist_event(checklists: &Collection<Checklist>, event: TableEvent) {
    match event {
        TableEvent::Checklist(e) => match (e.op, e.current, e.previous) {
            (ChangeOp::Delete, _, Some(previous)) => {
                if let Some(id) = previous.persisted_id() {
                    checklists.remove_persisted(id);
                }
            }
            (_, Some(checklist), _) => checklists.mutate(|entries| {
                crate::optimistic::upsert_by_id(entries, checklist);
                entries.sort_by_key(|c| c.order);
            }),
            _ => {}
        },
        TableEvent::ChecklistItem(e) => match (e.op, e.current, e.previous) {
            (ChangeOp::Delete, _, Some(previous)) => {
                if let Some(id) = previous.persisted_id() {
                    checklists.mutate(|entries| {
                        for checklist in entries.iter_mut() {
                            checklist.items.retain(|i| i.persisted_id() != Some(id));
                        }
                    });
                }
            }
            (_, Some(item), _) => checklists.mutate(|entries| {
                let Some(checklist) = entries
                    .iter_mut()
                    .find(|c| c.persisted_id() == Some(item.checklist_id.as_str()))
                else {
                    return;
                };
                match checklist
                    .items
                    .iter_mut()
                    .find(|i| i.persisted_id() == item.persisted_id())
                {
                    Some(slot) => *slot = item,
                    None => {
                        checklist.items.push(item);
                        checklist.items.sort_by_key(|i| i.order);
                    }
                }
            }),
            _ => {}
        },
        _ => {}
    }
}
