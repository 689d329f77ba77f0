//! Notification feed for the current user.
//!
//! Loads the latest page, keeps an unread count, and prepends realtime
//! inserts. Mark-read is optimistic with a targeted revert; the prepend
//! merge is keyed by id so duplicate deliveries cannot double-count.

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::gateway::{ChangeOp, SubscriptionFilter, Table, TableEvent};
use crate::optimistic::{perform_optimistic, Collection, ViewLease};
use crate::reconciler::{decide, spawn_pump, MergePolicy, ReconcileAction};
use crate::types::{Keyed, Notification};

use super::ViewContext;

pub struct NotificationFeed {
    ctx: ViewContext,
    lease: ViewLease,
    notifications: Collection<Notification>,
    pumps: Vec<JoinHandle<()>>,
}

impl NotificationFeed {
    pub fn new(ctx: ViewContext) -> Self {
        let lease = ViewLease::new();
        let notifications = Collection::new(lease.clone());

        let mut feed = Self {
            ctx,
            lease,
            notifications,
            pumps: Vec::new(),
        };
        feed.spawn_reconciler();
        feed
    }

    pub async fn load(&self) -> Result<(), SyncError> {
        let loaded = self
            .ctx
            .gateway
            .list_notifications(
                &self.ctx.session.user_id,
                self.ctx.config.notification_page_size,
            )
            .await?;
        if !self.lease.is_active() {
            return Err(SyncError::StaleCollection);
        }
        self.notifications.replace_all(loaded);
        Ok(())
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.snapshot()
    }

    pub fn unread_count(&self) -> usize {
        self.notifications
            .snapshot()
            .iter()
            .filter(|n| n.is_unread())
            .count()
    }

    pub fn revision(&self) -> tokio::sync::watch::Receiver<u64> {
        self.notifications.revision()
    }

    /// Mark a set of notifications read. The badges update immediately and
    /// revert if the write fails.
    pub async fn mark_read(&self, ids: &[String]) -> Result<(), SyncError> {
        let snapshot = self.notifications.snapshot();
        let previously_unread: Vec<String> = snapshot
            .iter()
            .filter(|n| n.is_unread())
            .filter_map(|n| n.persisted_id().map(str::to_string))
            .filter(|id| ids.contains(id))
            .collect();
        if previously_unread.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let apply_ids = previously_unread.clone();
        let revert_ids = previously_unread.clone();
        perform_optimistic(
            &self.ctx.mutation_cx("Mark notifications read"),
            &self.notifications,
            move |entries| {
                for notification in entries.iter_mut() {
                    if let Some(id) = notification.persisted_id() {
                        if apply_ids.iter().any(|i| i == id) {
                            notification.read_at = Some(now);
                        }
                    }
                }
            },
            self.ctx.gateway.mark_notifications_read(&previously_unread),
            |_, _: &()| {},
            move |entries| {
                for notification in entries.iter_mut() {
                    if let Some(id) = notification.persisted_id() {
                        if revert_ids.iter().any(|i| i == id) {
                            notification.read_at = None;
                        }
                    }
                }
            },
            None,
        )
        .await?;

        for id in &previously_unread {
            self.ctx.ledger.record(id);
        }
        Ok(())
    }

    pub async fn mark_all_read(&self) -> Result<(), SyncError> {
        let unread: Vec<String> = self
            .notifications
            .snapshot()
            .iter()
            .filter(|n| n.is_unread())
            .filter_map(|n| n.persisted_id().map(str::to_string))
            .collect();
        if unread.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let revert_ids = unread.clone();
        perform_optimistic(
            &self.ctx.mutation_cx("Mark all notifications read"),
            &self.notifications,
            move |entries| {
                for notification in entries.iter_mut() {
                    if notification.read_at.is_none() {
                        notification.read_at = Some(now);
                    }
                }
            },
            self.ctx
                .gateway
                .mark_all_notifications_read(&self.ctx.session.user_id),
            |_, _: &()| {},
            move |entries| {
                for notification in entries.iter_mut() {
                    if let Some(id) = notification.persisted_id() {
                        if revert_ids.iter().any(|i| i == id) {
                            notification.read_at = None;
                        }
                    }
                }
            },
            None,
        )
        .await?;

        for id in &unread {
            self.ctx.ledger.record(id);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.lease.revoke();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn spawn_reconciler(&mut self) {
        let stream = self.ctx.gateway.subscribe(
            Table::Notifications,
            SubscriptionFilter::User(self.ctx.session.user_id.clone()),
        );
        let ctx = self.ctx.clone();
        let notifications = self.notifications.clone();
        let pump = spawn_pump(stream, self.lease.clone(), move |event| {
            let ctx = ctx.clone();
            let notifications = notifications.clone();
            async move {
                match decide(&ctx.ledger, &ctx.session, &event, MergePolicy::UpsertById, false) {
                    ReconcileAction::Suppress => {}
                    ReconcileAction::Reload | ReconcileAction::Merge => {
                        merge_notification_event(&notifications, event)
                    }
                }
            }
        });
        self.pumps.push(pump);
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.close();
    }
}

fn merge_notification_event(notifications: &Collection<Notification>, event: TableEvent) {
    let TableEvent::Notification(e) = event else {
        return;
    };
    match (e.op, e.current) {
        (ChangeOp::Insert, Some(notification)) => notifications.mutate(|entries| {
            let exists = entries
                .iter()
                .any(|n| n.persisted_id() == notification.persisted_id());
            if !exists {
                entries.insert(0, notification);
            }
        }),
        (_, Some(notification)) => notifications.upsert(notification),
        _ => {}
    }
}
