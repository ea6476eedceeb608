use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use chat_core::{
    Attachment, ChatError, ChatErrorCategory, DeliveryState, MessageKind, MessageRecord,
    ReplySnapshot,
};
use serde::{Deserialize, Serialize};

/// Direction of a pagination fetch relative to the cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FetchDirection {
    /// Toward older history.
    Older,
    /// Toward newer history.
    Newer,
}

/// One page of a conversation history fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FetchPage {
    /// Records in ascending timestamp order.
    pub messages: Vec<MessageRecord>,
    /// Whether more history remains in the fetch direction.
    pub has_more: bool,
    /// Cursor for the next fetch in the same direction.
    pub next_cursor: Option<String>,
    /// Echoed fetch direction.
    pub direction: FetchDirection,
}

/// Remote message API contract consumed by the runtime.
///
/// Implemented over REST in this repository; the core only depends on this
/// request/response surface.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Fetch one page of conversation history.
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u16,
        direction: FetchDirection,
    ) -> Result<FetchPage, ChatError>;

    /// Send a message; the response carries the authoritative id/timestamp.
    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        attachments: Vec<Attachment>,
    ) -> Result<MessageRecord, ChatError>;

    /// Reply to an existing message.
    async fn reply_to_message(
        &self,
        conversation_id: &str,
        original_id: &str,
        content: &str,
    ) -> Result<MessageRecord, ChatError>;

    /// Recall one of the caller's own messages.
    async fn recall_message(&self, conversation_id: &str, message_id: &str)
    -> Result<(), ChatError>;

    /// Pin or unpin a message.
    async fn set_pinned(
        &self,
        conversation_id: &str,
        message_id: &str,
        pinned: bool,
    ) -> Result<(), ChatError>;
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<MessageRecord>,
}

/// In-process [`ChatApi`] used by tests and the smoke binary.
///
/// Assigns `srv-<n>` ids and keeps per-conversation history in memory.
#[derive(Clone, Default)]
pub struct InMemoryChatApi {
    conversations: Arc<Mutex<HashMap<String, Conversation>>>,
    next_id: Arc<AtomicU64>,
    clock_ms: Arc<AtomicU64>,
}

impl InMemoryChatApi {
    /// Create an empty API with no known conversations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a conversation known, optionally seeding history.
    pub fn seed_conversation(&self, conversation_id: &str, messages: Vec<MessageRecord>) {
        let mut conversations = self.conversations.lock().expect("api lock poisoned");
        conversations
            .entry(conversation_id.to_owned())
            .or_default()
            .messages
            .extend(messages);
    }

    /// Pin the fake server clock used for assigned timestamps.
    ///
    /// While unpinned (zero) the wall clock is used instead.
    pub fn set_clock_ms(&self, now_ms: u64) {
        self.clock_ms.store(now_ms, Ordering::SeqCst);
    }

    fn server_now_ms(&self) -> u64 {
        match self.clock_ms.load(Ordering::SeqCst) {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            pinned => pinned,
        }
    }

    fn next_server_id(&self) -> String {
        format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn build_record(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        kind: MessageKind,
        attachments: Vec<Attachment>,
        reply: Option<(String, Option<ReplySnapshot>)>,
    ) -> MessageRecord {
        let (reply_to_id, reply_snapshot) = match reply {
            Some((id, snapshot)) => (Some(id), snapshot),
            None => (None, None),
        };
        MessageRecord {
            id: self.next_server_id(),
            provisional_id: None,
            conversation_id: conversation_id.to_owned(),
            sender_id: sender_id.to_owned(),
            content: content.to_owned(),
            kind,
            attachments,
            created_at_ms: self.server_now_ms(),
            seq: 0,
            delivery_state: DeliveryState::Sent,
            recalled: false,
            pinned: false,
            hidden_from: Default::default(),
            delivered_to: Default::default(),
            read_by: Default::default(),
            reply_to_id,
            reply_snapshot,
        }
    }
}

const FAKE_SENDER: &str = "self";

#[async_trait]
impl ChatApi for InMemoryChatApi {
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u16,
        direction: FetchDirection,
    ) -> Result<FetchPage, ChatError> {
        let conversations = self.conversations.lock().expect("api lock poisoned");
        let conversation = conversations
            .get(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;

        // Cursor is the exclusive index of the previous page edge.
        let edge: usize = match cursor {
            Some(cursor) => cursor.parse().map_err(|_| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "invalid_cursor",
                    format!("unparseable cursor: {cursor}"),
                )
            })?,
            None => match direction {
                FetchDirection::Older => conversation.messages.len(),
                FetchDirection::Newer => 0,
            },
        };

        let limit = usize::from(limit.max(1));
        let (start, end) = match direction {
            FetchDirection::Older => (edge.saturating_sub(limit), edge),
            FetchDirection::Newer => (edge, (edge + limit).min(conversation.messages.len())),
        };

        let messages = conversation.messages[start..end].to_vec();
        let (has_more, next_cursor) = match direction {
            FetchDirection::Older => (start > 0, (start > 0).then(|| start.to_string())),
            FetchDirection::Newer => {
                let more = end < conversation.messages.len();
                (more, more.then(|| end.to_string()))
            }
        };

        Ok(FetchPage {
            messages,
            has_more,
            next_cursor,
            direction,
        })
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        attachments: Vec<Attachment>,
    ) -> Result<MessageRecord, ChatError> {
        let record = self.build_record(
            conversation_id,
            FAKE_SENDER,
            content,
            kind,
            attachments,
            None,
        );
        let mut conversations = self.conversations.lock().expect("api lock poisoned");
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;
        conversation.messages.push(record.clone());
        Ok(record)
    }

    async fn reply_to_message(
        &self,
        conversation_id: &str,
        original_id: &str,
        content: &str,
    ) -> Result<MessageRecord, ChatError> {
        let snapshot = {
            let conversations = self.conversations.lock().expect("api lock poisoned");
            let conversation = conversations
                .get(conversation_id)
                .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;
            conversation
                .messages
                .iter()
                .find(|message| message.id == original_id)
                .map(|original| ReplySnapshot {
                    sender_id: original.sender_id.clone(),
                    content: original.content.clone(),
                    kind: original.kind,
                })
                .ok_or_else(|| {
                    ChatError::new(
                        ChatErrorCategory::NotFound,
                        "message_not_found",
                        format!("message not found: {original_id}"),
                    )
                })?
        };

        let record = self.build_record(
            conversation_id,
            FAKE_SENDER,
            content,
            MessageKind::Text,
            Vec::new(),
            Some((original_id.to_owned(), Some(snapshot))),
        );
        let mut conversations = self.conversations.lock().expect("api lock poisoned");
        conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?
            .messages
            .push(record.clone());
        Ok(record)
    }

    async fn recall_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), ChatError> {
        self.mutate_message(conversation_id, message_id, |message| message.recalled = true)
    }

    async fn set_pinned(
        &self,
        conversation_id: &str,
        message_id: &str,
        pinned: bool,
    ) -> Result<(), ChatError> {
        self.mutate_message(conversation_id, message_id, |message| message.pinned = pinned)
    }
}

impl InMemoryChatApi {
    fn mutate_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        mutate: impl FnOnce(&mut MessageRecord),
    ) -> Result<(), ChatError> {
        let mut conversations = self.conversations.lock().expect("api lock poisoned");
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;
        let message = conversation
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
            .ok_or_else(|| {
                ChatError::new(
                    ChatErrorCategory::NotFound,
                    "message_not_found",
                    format!("message not found: {message_id}"),
                )
            })?;
        mutate(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_api(count: usize) -> InMemoryChatApi {
        let api = InMemoryChatApi::new();
        api.seed_conversation("c1", Vec::new());
        for index in 0..count {
            api.set_clock_ms((index as u64 + 1) * 1_000);
            api.send_message("c1", &format!("m{index}"), MessageKind::Text, Vec::new())
                .await
                .expect("seed send should work");
        }
        api
    }

    #[tokio::test]
    async fn fetch_unknown_conversation_is_not_found() {
        let api = InMemoryChatApi::new();
        let err = api
            .fetch_messages("c404", None, 10, FetchDirection::Older)
            .await
            .expect_err("fetch should fail");
        assert_eq!(err.category, ChatErrorCategory::NotFound);
        assert_eq!(err.code, "conversation_not_found");
    }

    #[tokio::test]
    async fn older_pagination_walks_back_through_history() {
        let api = seeded_api(5).await;

        let first = api
            .fetch_messages("c1", None, 2, FetchDirection::Older)
            .await
            .expect("fetch should work");
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.messages[0].content, "m3");
        assert!(first.has_more);

        let second = api
            .fetch_messages(
                "c1",
                first.next_cursor.as_deref(),
                2,
                FetchDirection::Older,
            )
            .await
            .expect("fetch should work");
        assert_eq!(second.messages[0].content, "m1");
        assert!(second.has_more);

        let third = api
            .fetch_messages(
                "c1",
                second.next_cursor.as_deref(),
                2,
                FetchDirection::Older,
            )
            .await
            .expect("fetch should work");
        assert_eq!(third.messages.len(), 1);
        assert_eq!(third.messages[0].content, "m0");
        assert!(!third.has_more);
        assert_eq!(third.next_cursor, None);
    }

    #[tokio::test]
    async fn send_assigns_sequential_server_ids() {
        let api = InMemoryChatApi::new();
        api.seed_conversation("c1", Vec::new());

        let first = api
            .send_message("c1", "one", MessageKind::Text, Vec::new())
            .await
            .expect("send should work");
        let second = api
            .send_message("c1", "two", MessageKind::Text, Vec::new())
            .await
            .expect("send should work");
        assert_eq!(first.id, "srv-1");
        assert_eq!(second.id, "srv-2");
    }

    #[tokio::test]
    async fn reply_carries_snapshot_of_original() {
        let api = InMemoryChatApi::new();
        api.seed_conversation("c1", Vec::new());
        let original = api
            .send_message("c1", "original", MessageKind::Text, Vec::new())
            .await
            .expect("send should work");

        let reply = api
            .reply_to_message("c1", &original.id, "reply")
            .await
            .expect("reply should work");
        assert_eq!(reply.reply_to_id.as_deref(), Some(original.id.as_str()));
        let snapshot = reply.reply_snapshot.expect("snapshot should be set");
        assert_eq!(snapshot.content, "original");
    }

    #[tokio::test]
    async fn recall_and_pin_mutate_stored_history() {
        let api = InMemoryChatApi::new();
        api.seed_conversation("c1", Vec::new());
        let message = api
            .send_message("c1", "hi", MessageKind::Text, Vec::new())
            .await
            .expect("send should work");

        api.recall_message("c1", &message.id)
            .await
            .expect("recall should work");
        api.set_pinned("c1", &message.id, true)
            .await
            .expect("pin should work");

        let page = api
            .fetch_messages("c1", None, 10, FetchDirection::Older)
            .await
            .expect("fetch should work");
        assert!(page.messages[0].recalled);
        assert!(page.messages[0].pinned);
    }
}
