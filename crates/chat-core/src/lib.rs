//! Conversation timeline core shared between the runtime and frontend consumers.
//!
//! This crate owns the in-memory ordered view of one conversation's messages
//! and the reconciliation algorithm that merges optimistic local sends, API
//! confirmations and realtime echoes without ever showing a logical message
//! twice. Transport, storage and rendering are external collaborators.

/// Command/remote-event/event channel primitives.
pub mod channel;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Remote payload canonicalization at the collaborator boundary.
pub mod normalization;
/// Active-conversation lifecycle state machine.
pub mod phase;
/// Typing-indicator presence tracking.
pub mod presence;
/// Reconciler merge/dedup algorithm.
pub mod reconcile;
/// Timeline store: ordered, deduplicated records plus the pagination window.
pub mod store;
/// Canonical data model and the command/event protocol.
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, EventStream};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{NormalizeError, normalize_message, normalize_receipt_ids};
pub use phase::{ConversationPhaseMachine, OpenResult};
pub use presence::TypingTracker;
pub use reconcile::{MergeOutcome, Reconciler};
pub use store::{StoreError, TimelineStore};
pub use types::{
    Attachment, ChatCommand, ChatEvent, ConfirmedSend, ConversationPhase, DeliveryState,
    MessageKind, MessageRecord, ReconcilerConfig, RemoteEvent, ReplySnapshot, SendAck,
    StateChange, TimelineWindow, TypingUser,
};
