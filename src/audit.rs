//! Audit trail for board mutations.
//!
//! Appends {entity, id, action, actor, project, diff} records through the
//! gateway after a mutation confirms. Write-only from the core; history
//! views read it elsewhere. Recording is best-effort: a failed append is
//! logged and never rolls back or fails the user's action, and nothing is
//! recorded for mutations that did not reach the store.

use std::sync::Arc;

use chrono::Utc;

use crate::gateway::RemoteGateway;
use crate::types::{AuditAction, AuditEntry, Session};

#[derive(Clone)]
pub struct AuditRecorder {
    gateway: Arc<dyn RemoteGateway>,
    session: Session,
    project_id: Option<String>,
}

impl AuditRecorder {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        session: Session,
        project_id: Option<String>,
    ) -> Self {
        Self {
            gateway,
            session,
            project_id,
        }
    }

    /// Append one entry. Call only after the underlying write confirmed.
    pub async fn record(
        &self,
        entity: &str,
        entity_id: &str,
        action: AuditAction,
        diff: Option<serde_json::Value>,
    ) {
        let entry = AuditEntry {
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            action,
            actor_id: self.session.user_id.clone(),
            project_id: self.project_id.clone(),
            diff,
            created_at: Utc::now(),
        };

        if let Err(err) = self.gateway.append_audit(entry).await {
            log::warn!("audit: failed to append {entity} {entity_id} {action:?}: {err}");
        }
    }
}
