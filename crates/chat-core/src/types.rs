use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Message payload kind carried by a [`MessageRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Plain text message.
    Text,
    /// Single image attachment.
    Image,
    /// Generic file attachment.
    File,
    /// Audio clip attachment.
    Audio,
    /// Video attachment.
    Video,
    /// Text body plus image attachments.
    TextWithImage,
    /// Server-generated system notice (member joined, conversation renamed, ...).
    SystemNotice,
}

impl MessageKind {
    /// Whether records of this kind are correlated by their text body.
    ///
    /// Media kinds are correlated by attachment URL instead.
    pub fn fingerprints_by_content(self) -> bool {
        matches!(
            self,
            MessageKind::Text | MessageKind::TextWithImage | MessageKind::SystemNotice
        )
    }
}

/// Confirmation lifecycle stage of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    /// Created optimistically, no server response yet.
    Pending,
    /// Accepted by the server.
    Sent,
    /// Delivered to at least one recipient device.
    Delivered,
    /// Read by at least one recipient.
    Read,
    /// Send failed; terminal, reachable only from `Pending`.
    Failed,
}

impl DeliveryState {
    /// Preference order used when two records compete for the same slot.
    ///
    /// `Read > Delivered > Sent > Pending > Failed`.
    pub fn priority(self) -> u8 {
        match self {
            DeliveryState::Failed => 0,
            DeliveryState::Pending => 1,
            DeliveryState::Sent => 2,
            DeliveryState::Delivered => 3,
            DeliveryState::Read => 4,
        }
    }

    /// Attempt the monotonic transition to `next`.
    ///
    /// Allowed moves are forward along pending -> sent -> delivered -> read
    /// (receipts may skip intermediate stages when they arrive out of order)
    /// plus pending -> failed. Returns `true` when the state changed;
    /// repeated or backward transitions are no-ops.
    pub fn advance(&mut self, next: DeliveryState) -> bool {
        if *self == next {
            return false;
        }

        let allowed = match next {
            DeliveryState::Failed => *self == DeliveryState::Pending,
            DeliveryState::Pending => false,
            _ => *self != DeliveryState::Failed && next.progression() > self.progression(),
        };

        if allowed {
            *self = next;
        }
        allowed
    }

    fn progression(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Delivered => 2,
            DeliveryState::Read => 3,
            // Terminal branch; never compared forward.
            DeliveryState::Failed => 0,
        }
    }
}

/// Structured attachment payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Download URL (server-confirmed, or a local placeholder while pending).
    pub url: String,
    /// MIME content type, for example `image/png`.
    pub mime_type: String,
    /// Original file name shown to users.
    pub file_name: String,
    /// File size in bytes when known.
    pub size_bytes: Option<u64>,
}

/// Denormalized copy of a replied-to message.
///
/// Kept on the reply itself because the original may later be recalled,
/// edited, or fall out of the loaded window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplySnapshot {
    /// Sender of the original message.
    pub sender_id: String,
    /// Original message body.
    pub content: String,
    /// Original message kind.
    pub kind: MessageKind,
}

/// One entry in a conversation timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Provisional `local-...` id before confirmation, server id afterwards.
    pub id: String,
    /// Client-generated id of the optimistic submission.
    ///
    /// Set if and only if this record was created optimistically; preserved
    /// after promotion so late remote echoes can still be correlated.
    pub provisional_id: Option<String>,
    /// Owning conversation; immutable for the record's lifetime.
    pub conversation_id: String,
    /// Sender user id.
    pub sender_id: String,
    /// Text body; may be empty for attachment-only messages.
    pub content: String,
    /// Payload kind.
    pub kind: MessageKind,
    /// Ordered attachments; the "singular attachment" is always `attachments[0]`.
    pub attachments: Vec<Attachment>,
    /// Primary sort key, milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Insertion sequence number assigned by the store; tie-breaks equal
    /// timestamps and is never reused.
    pub seq: u64,
    /// Confirmation lifecycle stage.
    pub delivery_state: DeliveryState,
    /// Recall is a presentation flag; the content field is untouched.
    pub recalled: bool,
    /// Pinned in the conversation.
    pub pinned: bool,
    /// Users for whom this record must not be rendered.
    pub hidden_from: HashSet<String>,
    /// Users whose devices acknowledged delivery.
    pub delivered_to: HashSet<String>,
    /// Users who read the message.
    pub read_by: HashSet<String>,
    /// Id of the replied-to message, when this record is a reply.
    pub reply_to_id: Option<String>,
    /// Snapshot of the replied-to message.
    pub reply_snapshot: Option<ReplySnapshot>,
}

impl MessageRecord {
    /// The singular attachment accessor: always `attachments[0]` when present.
    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachments.first()
    }

    /// Whether this record still awaits server confirmation.
    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    /// Whether the given viewer may see this record.
    pub fn visible_to(&self, viewer_id: &str) -> bool {
        !self.hidden_from.contains(viewer_id)
    }
}

/// Server-confirmed identity fields applied when promoting an optimistic record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedSend {
    /// Authoritative server id.
    pub id: String,
    /// Authoritative server timestamp.
    pub created_at_ms: u64,
    /// Server-confirmed attachment payloads (uploaded URLs), when any.
    pub attachments: Option<Vec<Attachment>>,
}

/// State-transition request applied to one record by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StateChange {
    /// Delivery receipts from the listed users.
    Delivered { user_ids: Vec<String> },
    /// Read receipts from the listed users.
    Read { user_ids: Vec<String> },
    /// Sender recalled the message; content stays intact.
    Recall,
    /// Pin the message in the conversation.
    Pin,
    /// Remove the pin.
    Unpin,
    /// Hide the record from one user's view.
    HideFrom { user_id: String },
    /// Remove the record entirely.
    Delete,
}

/// Normalized realtime push event at the collaborator boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RemoteEvent {
    /// A message created by another participant, or an echo of our own send.
    NewMessage(MessageRecord),
    /// Delivery receipts for a batch of messages.
    Delivered {
        message_ids: Vec<String>,
        user_id: String,
    },
    /// Read receipts for a batch of messages.
    Read {
        message_ids: Vec<String>,
        user_id: String,
    },
    /// A message was recalled by its sender.
    Recalled { message_id: String },
    /// A message was deleted for one user.
    Deleted { message_id: String, user_id: String },
    /// A participant is typing; ephemeral, not part of the timeline.
    Typing {
        user_id: String,
        display_name: String,
    },
}

/// Loaded subset of a conversation's full history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineWindow {
    /// Opaque cursor bounding the oldest loaded record.
    pub oldest_cursor: Option<String>,
    /// Opaque cursor bounding the newest loaded record.
    pub newest_cursor: Option<String>,
    /// Whether older history remains on the server.
    pub has_more_older: bool,
    /// Whether newer history remains on the server.
    pub has_more_newer: bool,
}

/// Reconciliation tuning values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerConfig {
    /// Max clock skew between an optimistic record and its remote echo.
    pub echo_window_ms: u64,
    /// Correlation window for the content-fingerprint fallback.
    pub fingerprint_window_ms: u64,
    /// Typing indicator lifetime per user.
    pub typing_ttl_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            echo_window_ms: 10_000,
            fingerprint_window_ms: 10_000,
            typing_ttl_ms: 3_000,
        }
    }
}

/// Active conversation lifecycle phase reported to the presentation layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConversationPhase {
    /// No conversation is open.
    Closed,
    /// Initial fetch for a conversation is in flight.
    Opening,
    /// Timeline is loaded and accepting commands.
    Ready,
    /// The conversation does not exist or access was denied.
    NotFound,
    /// Initial fetch failed for a retryable reason.
    Failed,
}

/// User currently typing, surfaced as ephemeral presence state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    /// Typing user's id.
    pub user_id: String,
    /// Display name supplied by the typing event.
    pub display_name: String,
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChatCommand {
    /// Open a conversation, resetting any previously loaded timeline.
    OpenConversation { conversation_id: String },
    /// Close the active conversation and discard its timeline.
    CloseConversation,
    /// Extend the loaded window toward older history.
    PaginateOlder { limit: u16 },
    /// Send a text message.
    SendText { content: String },
    /// Send a message carrying attachments.
    SendAttachment {
        kind: MessageKind,
        content: String,
        attachments: Vec<Attachment>,
    },
    /// Reply to an existing message.
    Reply {
        original_id: String,
        content: String,
    },
    /// Recall one of our own messages.
    Recall { message_id: String },
    /// Pin a message.
    Pin { message_id: String },
    /// Unpin a message.
    Unpin { message_id: String },
}

/// Acknowledgement for a send/reply command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    /// Provisional id of the optimistic record the command created.
    pub provisional_id: String,
    /// Server id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChatEvent {
    /// Conversation lifecycle transition.
    PhaseChanged { phase: ConversationPhase },
    /// Timeline snapshot after a mutation, in display order.
    TimelineChanged {
        conversation_id: String,
        records: Vec<MessageRecord>,
    },
    /// Send acknowledgement (`SendText`, `SendAttachment`, `Reply`).
    SendAck(SendAck),
    /// Current set of typing users changed.
    TypingChanged { users: Vec<TypingUser> },
    /// Unrecoverable runtime error.
    FatalError {
        code: String,
        message: String,
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_state_moves_forward_only() {
        let mut state = DeliveryState::Pending;
        assert!(state.advance(DeliveryState::Sent));
        assert!(state.advance(DeliveryState::Delivered));
        assert!(!state.advance(DeliveryState::Sent));
        assert!(state.advance(DeliveryState::Read));
        assert_eq!(state, DeliveryState::Read);
    }

    #[test]
    fn read_receipt_may_skip_delivered() {
        let mut state = DeliveryState::Sent;
        assert!(state.advance(DeliveryState::Read));
        assert_eq!(state, DeliveryState::Read);
        assert!(!state.advance(DeliveryState::Delivered));
        assert_eq!(state, DeliveryState::Read);
    }

    #[test]
    fn failed_is_reachable_only_from_pending() {
        let mut pending = DeliveryState::Pending;
        assert!(pending.advance(DeliveryState::Failed));
        assert_eq!(pending, DeliveryState::Failed);
        assert!(!pending.advance(DeliveryState::Sent));

        let mut sent = DeliveryState::Sent;
        assert!(!sent.advance(DeliveryState::Failed));
        assert_eq!(sent, DeliveryState::Sent);
    }

    #[test]
    fn advancing_to_current_state_is_a_no_op() {
        let mut state = DeliveryState::Delivered;
        assert!(!state.advance(DeliveryState::Delivered));
        assert_eq!(state, DeliveryState::Delivered);
    }

    #[test]
    fn priority_prefers_most_progressed_state() {
        assert!(DeliveryState::Read.priority() > DeliveryState::Delivered.priority());
        assert!(DeliveryState::Delivered.priority() > DeliveryState::Sent.priority());
        assert!(DeliveryState::Sent.priority() > DeliveryState::Pending.priority());
        assert!(DeliveryState::Pending.priority() > DeliveryState::Failed.priority());
    }

    #[test]
    fn media_kinds_fingerprint_by_attachment() {
        assert!(MessageKind::Text.fingerprints_by_content());
        assert!(MessageKind::TextWithImage.fingerprints_by_content());
        assert!(!MessageKind::Image.fingerprints_by_content());
        assert!(!MessageKind::Audio.fingerprints_by_content());
    }
}
