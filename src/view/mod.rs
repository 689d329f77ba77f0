//! Entity view-models: the seam between the UI and the engine.
//!
//! Each view-model owns its live collection, exposes mutation entry points
//! that delegate to the optimistic engine, and registers with the
//! reconciler for the tables it owns. Everything a view-model needs arrives
//! through [`ViewContext`]; there is no module-level client singleton, so
//! tests construct the whole stack against a fake gateway.

use std::sync::Arc;
use std::time::Duration;

use crate::error::NoticeSender;
use crate::gateway::{FileStore, RemoteGateway};
use crate::optimistic::MutationCx;
use crate::reconciler::SelfMutationLedger;
use crate::types::{EngineConfig, Session};

pub mod board;
pub mod checklist;
pub mod chat;
pub mod comments;
pub mod files;
pub mod notifications;
pub mod trash;

/// Shared handles threaded into every view-model constructor.
#[derive(Clone)]
pub struct ViewContext {
    pub gateway: Arc<dyn RemoteGateway>,
    pub files: Arc<dyn FileStore>,
    pub session: Session,
    pub notices: NoticeSender,
    /// One ledger per session, shared across view-models so an echo is
    /// suppressed no matter which screen receives it.
    pub ledger: Arc<SelfMutationLedger>,
    pub config: EngineConfig,
}

impl ViewContext {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        files: Arc<dyn FileStore>,
        session: Session,
        notices: NoticeSender,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(SelfMutationLedger::new(Duration::from_millis(
            config.self_mutation_window_ms,
        )));
        Self {
            gateway,
            files,
            session,
            notices,
            ledger,
            config,
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.config.remote_timeout_secs)
    }

    pub(crate) fn mutation_cx<'a>(&'a self, label: &'a str) -> MutationCx<'a> {
        MutationCx {
            ledger: &self.ledger,
            notices: &self.notices,
            timeout: self.remote_timeout(),
            label,
        }
    }
}
