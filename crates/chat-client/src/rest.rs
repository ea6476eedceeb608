use async_trait::async_trait;
use chat_core::{
    Attachment, ChatError, ChatErrorCategory, DeliveryState, MessageKind, MessageRecord,
    ReplySnapshot, classify_http_status,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::{ChatApi, FetchDirection, FetchPage};

/// Connection settings for the REST message API.
#[derive(Debug, Clone)]
pub struct RestChatApiConfig {
    /// API base URL, for example `https://chat.example.org/api/v1`.
    pub base_url: Url,
    /// Bearer token attached to every request.
    pub auth_token: Option<String>,
}

impl RestChatApiConfig {
    /// Build a config, validating the base URL.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, ChatError> {
        let base_url = Url::parse(base_url).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_base_url",
                format!("invalid base url '{base_url}': {err}"),
            )
        })?;
        Ok(Self {
            base_url,
            auth_token,
        })
    }
}

/// [`ChatApi`] implementation over the remote REST endpoints.
pub struct RestChatApi {
    config: RestChatApiConfig,
    http: reqwest::Client,
}

impl RestChatApi {
    /// Create a client with default HTTP settings.
    pub fn new(config: RestChatApiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn messages_url(&self, conversation_id: &str) -> Result<Url, ChatError> {
        join_url(
            &self.config.base_url,
            &format!("conversations/{conversation_id}/messages"),
        )
    }

    fn message_action_url(
        &self,
        conversation_id: &str,
        message_id: &str,
        action: &str,
    ) -> Result<Url, ChatError> {
        join_url(
            &self.config.base_url,
            &format!("conversations/{conversation_id}/messages/{message_id}/{action}"),
        )
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        action: &'static str,
    ) -> Result<T, ChatError> {
        let response = builder.send().await.map_err(|err| transport_error(action, err))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(status_error(status, action));
        }
        response
            .json()
            .await
            .map_err(|err| decode_error(action, err))
    }
}

fn join_url(base: &Url, path: &str) -> Result<Url, ChatError> {
    // Treat the base as a directory so its final segment is preserved.
    let mut base_dir = base.clone();
    if !base_dir.path().ends_with('/') {
        base_dir.set_path(&format!("{}/", base_dir.path()));
    }
    base_dir.join(path).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Config,
            "invalid_request_url",
            format!("cannot build request url for '{path}': {err}"),
        )
    })
}

fn transport_error(action: &'static str, err: reqwest::Error) -> ChatError {
    ChatError::new(
        ChatErrorCategory::Network,
        "http_transport_failed",
        format!("{action}: {err}"),
    )
}

fn decode_error(action: &'static str, err: reqwest::Error) -> ChatError {
    ChatError::new(
        ChatErrorCategory::Serialization,
        "http_response_undecodable",
        format!("{action}: {err}"),
    )
}

/// Map a non-2xx response to a stable [`ChatError`].
fn status_error(status: u16, action: &'static str) -> ChatError {
    let category = classify_http_status(status);
    let code = match category {
        ChatErrorCategory::NotFound => "conversation_not_found",
        ChatErrorCategory::Auth => "unauthorized",
        ChatErrorCategory::RateLimited => "rate_limited",
        ChatErrorCategory::Network => "server_error",
        _ => "request_rejected",
    };
    ChatError::new(category, code, format!("{action}: http status {status}"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    content: &'a str,
    kind: MessageKind,
    attachments: &'a [Attachment],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyBody<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PinBody {
    pinned: bool,
}

/// Wire shape of one message in REST responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: String,
    conversation_id: String,
    sender_id: String,
    #[serde(default)]
    content: String,
    kind: MessageKind,
    #[serde(default)]
    attachments: Vec<Attachment>,
    created_at: u64,
    #[serde(default)]
    recalled: bool,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    reply_to_id: Option<String>,
    #[serde(default)]
    reply_snapshot: Option<ReplySnapshot>,
}

impl From<WireMessage> for MessageRecord {
    fn from(wire: WireMessage) -> Self {
        MessageRecord {
            id: wire.id,
            provisional_id: None,
            conversation_id: wire.conversation_id,
            sender_id: wire.sender_id,
            content: wire.content,
            kind: wire.kind,
            attachments: wire.attachments,
            created_at_ms: wire.created_at,
            seq: 0,
            delivery_state: DeliveryState::Sent,
            recalled: wire.recalled,
            pinned: wire.pinned,
            hidden_from: Default::default(),
            delivered_to: Default::default(),
            read_by: Default::default(),
            reply_to_id: wire.reply_to_id,
            reply_snapshot: wire.reply_snapshot,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFetchPage {
    messages: Vec<WireMessage>,
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[async_trait]
impl ChatApi for RestChatApi {
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u16,
        direction: FetchDirection,
    ) -> Result<FetchPage, ChatError> {
        let mut url = self.messages_url(conversation_id)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            query.append_pair(
                "direction",
                match direction {
                    FetchDirection::Older => "older",
                    FetchDirection::Newer => "newer",
                },
            );
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let page: WireFetchPage = self
            .execute(self.request(reqwest::Method::GET, url), "fetch_messages")
            .await?;
        Ok(FetchPage {
            messages: page.messages.into_iter().map(Into::into).collect(),
            has_more: page.has_more,
            next_cursor: page.next_cursor,
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
        let url = self.messages_url(conversation_id)?;
        let body = SendMessageBody {
            content,
            kind,
            attachments: &attachments,
        };
        let wire: WireMessage = self
            .execute(
                self.request(reqwest::Method::POST, url).json(&body),
                "send_message",
            )
            .await?;
        Ok(wire.into())
    }

    async fn reply_to_message(
        &self,
        conversation_id: &str,
        original_id: &str,
        content: &str,
    ) -> Result<MessageRecord, ChatError> {
        let url = self.message_action_url(conversation_id, original_id, "reply")?;
        let wire: WireMessage = self
            .execute(
                self.request(reqwest::Method::POST, url)
                    .json(&ReplyBody { content }),
                "reply_to_message",
            )
            .await?;
        Ok(wire.into())
    }

    async fn recall_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), ChatError> {
        let url = self.message_action_url(conversation_id, message_id, "recall")?;
        let response = self
            .request(reqwest::Method::POST, url)
            .send()
            .await
            .map_err(|err| transport_error("recall_message", err))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(status_error(status, "recall_message"));
        }
        Ok(())
    }

    async fn set_pinned(
        &self,
        conversation_id: &str,
        message_id: &str,
        pinned: bool,
    ) -> Result<(), ChatError> {
        let url = self.message_action_url(conversation_id, message_id, "pin")?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&PinBody { pinned })
            .send()
            .await
            .map_err(|err| transport_error("set_pinned", err))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(status_error(status, "set_pinned"));
        }
        Ok(())
    }
}
