//! Error types for the mutation and reconciliation engine.
//!
//! Two layers: [`GatewayError`] is what the remote persistence boundary
//! rejects with; [`SyncError`] is what a full optimistic cycle resolves to.
//! The UI never receives raw error objects, only a [`Notice`] with a
//! human-readable message, delivered over an mpsc channel.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Rejection from the remote persistence layer. Surfaced synchronously to
/// the caller; never retried at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("validation rejected: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Transient errors are ones a user-triggered retry could plausibly fix.
    /// The engine still never retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Storage(_))
    }
}

/// Outcome of a failed optimistic mutation cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote write rejected. The tentative entry was rolled back.
    #[error("remote write rejected: {0}")]
    Remote(#[from] GatewayError),

    /// The remote call did not resolve inside the client-side timeout.
    /// Treated exactly like a rejection: rollback, user-visible notice.
    #[error("remote call timed out after {0} seconds")]
    Timeout(u64),

    /// Reconciliation arrived after the owning view-model was torn down.
    /// Dropped silently; never user-visible.
    #[error("collection torn down before reconciliation")]
    StaleCollection,

    /// Object storage failed before the database insert was attempted.
    #[error("upload failed: {0}")]
    Upload(String),
}

impl SyncError {
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::StaleCollection)
    }

    pub fn can_retry(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_transient(),
            Self::Timeout(_) | Self::Upload(_) => true,
            Self::StaleCollection => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSeverity {
    Info,
    Warning,
    Error,
}

/// Serializable toast payload for the UI layer: a pass/fail plus a
/// human-readable message, nothing more.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub title: String,
    pub message: String,
    pub severity: NoticeSeverity,
    pub can_retry: bool,
}

/// Sending half of the notice channel, cloned into every view-model.
#[derive(Clone)]
pub struct NoticeSender {
    tx: mpsc::UnboundedSender<Notice>,
}

impl NoticeSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn info(&self, title: &str, message: impl Into<String>) {
        self.post(title, message.into(), NoticeSeverity::Info, false);
    }

    /// Advisory warnings (WIP limit exceeded and the like). The underlying
    /// operation still proceeds.
    pub fn warning(&self, title: &str, message: impl Into<String>) {
        self.post(title, message.into(), NoticeSeverity::Warning, false);
    }

    /// Report a failed mutation cycle. Stale-collection outcomes are
    /// swallowed here so callers don't have to special-case them.
    pub fn sync_failure(&self, title: &str, err: &SyncError) {
        if !err.is_user_visible() {
            log::debug!("suppressed stale-collection notice: {title}");
            return;
        }
        self.post(title, err.to_string(), NoticeSeverity::Error, err.can_retry());
    }

    fn post(&self, title: &str, message: String, severity: NoticeSeverity, can_retry: bool) {
        let notice = Notice {
            title: title.to_string(),
            message,
            severity,
            can_retry,
        };
        // A closed receiver just means the UI is gone; nothing to do.
        let _ = self.tx.send(notice);
    }
}
