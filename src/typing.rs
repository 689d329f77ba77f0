//! Typing-indicator state machine.
//!
//! State machine: idle → typing (first keystroke) → idle (explicit stop or
//! no keystroke for the idle timeout). Transitions are driven by
//! `keystroke()` and `poll()`; there are no internal timers, so the machine
//! is deterministic under an injected clock. The broadcast side effect
//! (presence channel) stays behind a trait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

/// Side effect fired on phase transitions. The presence channel itself is
/// an external collaborator.
pub trait TypingBroadcast: Send + Sync {
    fn typing_started(&self, conversation_id: &str, user_id: &str);
    fn typing_stopped(&self, conversation_id: &str, user_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingPhase {
    Idle,
    Typing,
}

pub struct TypingIndicator {
    conversation_id: String,
    user_id: String,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
    broadcast: Arc<dyn TypingBroadcast>,
    phase: TypingPhase,
    last_keystroke: Option<Instant>,
}

impl TypingIndicator {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        idle_timeout: Duration,
        clock: Arc<dyn Clock>,
        broadcast: Arc<dyn TypingBroadcast>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            idle_timeout,
            clock,
            broadcast,
            phase: TypingPhase::Idle,
            last_keystroke: None,
        }
    }

    pub fn phase(&self) -> TypingPhase {
        self.phase
    }

    /// Register one keystroke. The started broadcast fires only on the
    /// idle→typing edge; further keystrokes just refresh the timeout.
    pub fn keystroke(&mut self) {
        self.last_keystroke = Some(self.clock.now());
        if self.phase == TypingPhase::Idle {
            self.phase = TypingPhase::Typing;
            log::debug!("typing: {} started in {}", self.user_id, self.conversation_id);
            self.broadcast
                .typing_started(&self.conversation_id, &self.user_id);
        }
    }

    /// Advance the machine against the clock. Call from the host's tick or
    /// before rendering; returns the phase after the transition check.
    pub fn poll(&mut self) -> TypingPhase {
        if self.phase == TypingPhase::Typing {
            let idle_for = self
                .last_keystroke
                .map(|at| self.clock.now().duration_since(at))
                .unwrap_or(Duration::MAX);
            if idle_for >= self.idle_timeout {
                self.stop();
            }
        }
        self.phase
    }

    /// Explicit idle transition (message sent, input cleared).
    pub fn stop(&mut self) {
        if self.phase == TypingPhase::Typing {
            self.phase = TypingPhase::Idle;
            self.last_keystroke = None;
            log::debug!("typing: {} stopped in {}", self.user_id, self.conversation_id);
            self.broadcast
                .typing_stopped(&self.conversation_id, &self.user_id);
        }
    }
}
