use crate::{
    error::ChatError,
    types::{ChatCommand, ConversationPhase},
};

/// Lifecycle state machine for the active conversation.
///
/// Opening a conversation is destructive for the previous one; at most one
/// conversation's timeline is resident at a time.
#[derive(Debug, Clone)]
pub struct ConversationPhaseMachine {
    phase: ConversationPhase,
}

impl Default for ConversationPhaseMachine {
    fn default() -> Self {
        Self {
            phase: ConversationPhase::Closed,
        }
    }
}

impl ConversationPhaseMachine {
    /// Current phase.
    pub fn phase(&self) -> ConversationPhase {
        self.phase
    }

    /// Validate a command against the current phase.
    ///
    /// `OpenConversation` is accepted in any phase (switching is always
    /// allowed); timeline-mutating commands require `Ready`.
    pub fn check(&self, command: &ChatCommand) -> Result<(), ChatError> {
        use ChatCommand::*;

        match command {
            OpenConversation { .. } | CloseConversation => Ok(()),
            PaginateOlder { .. }
            | SendText { .. }
            | SendAttachment { .. }
            | Reply { .. }
            | Recall { .. }
            | Pin { .. }
            | Unpin { .. } => {
                if self.phase == ConversationPhase::Ready {
                    Ok(())
                } else {
                    Err(ChatError::invalid_phase(self.phase, "timeline command"))
                }
            }
        }
    }

    /// Enter `Opening` for an initial fetch.
    pub fn on_open(&mut self) -> ConversationPhase {
        self.phase = ConversationPhase::Opening;
        self.phase
    }

    /// Resolve the initial fetch.
    ///
    /// A not-found rejection enters the distinct `NotFound` phase so the UI
    /// can offer "back to conversation list" instead of a naive retry; any
    /// other failure enters `Failed`.
    pub fn on_open_result(&mut self, result: OpenResult) -> ConversationPhase {
        self.phase = match result {
            OpenResult::Loaded => ConversationPhase::Ready,
            OpenResult::NotFound => ConversationPhase::NotFound,
            OpenResult::Failed => ConversationPhase::Failed,
        };
        self.phase
    }

    /// Close the active conversation.
    pub fn on_close(&mut self) -> ConversationPhase {
        self.phase = ConversationPhase::Closed;
        self.phase
    }
}

/// Outcome of an initial conversation fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenResult {
    /// Messages loaded; the conversation is usable.
    Loaded,
    /// The conversation does not exist or access was denied.
    NotFound,
    /// The fetch failed for a retryable reason.
    Failed,
}
