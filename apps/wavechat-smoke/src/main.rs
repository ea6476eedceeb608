//! Headless smoke run for the chat runtime.
//!
//! Opens one conversation, sends a message, injects realtime events the way
//! a transport would, and prints the final timeline. Talks to a real REST
//! API when `WAVECHAT_API_URL` is set, otherwise to the in-memory fake.

mod config;
mod logging;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chat_client::{
    ChatApi, InMemoryChatApi, RestChatApi, RestChatApiConfig, spawn_runtime,
};
use chat_core::{
    ChatCommand, ChatEvent, ConversationPhase, DeliveryState, MessageKind, MessageRecord,
    RemoteEvent, normalize_message,
};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::SmokeConfig;

const EVENT_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Bad configuration: {err}");
            std::process::exit(1);
        }
    };

    let seeded_fake = config.api_url.is_none();
    let api: Arc<dyn ChatApi> = match &config.api_url {
        Some(url) => match RestChatApiConfig::new(url, config.auth_token.clone()) {
            Ok(rest_config) => Arc::new(RestChatApi::new(rest_config)),
            Err(err) => {
                eprintln!("Bad API URL: {err}");
                std::process::exit(1);
            }
        },
        None => Arc::new(seeded_in_memory_api(&config.conversation_id)),
    };

    let handle = spawn_runtime(api, config.runtime_config());
    let mut events = handle.subscribe();

    if let Err(err) = handle
        .send(ChatCommand::OpenConversation {
            conversation_id: config.conversation_id.clone(),
        })
        .await
    {
        eprintln!("Runtime unavailable: {err}");
        std::process::exit(1);
    }

    match wait_for_settled_phase(&mut events).await {
        Some(ConversationPhase::Ready) => {
            info!(conversation = %config.conversation_id, "conversation ready");
        }
        Some(phase) => {
            eprintln!("Conversation did not open: phase {phase:?}");
            std::process::exit(1);
        }
        None => {
            eprintln!("Timed out waiting for the conversation to open");
            std::process::exit(1);
        }
    }

    let _ = handle
        .send(ChatCommand::SendText {
            content: "smoke says hello".to_owned(),
        })
        .await;

    if seeded_fake {
        // Play the realtime transport: a typing hint, then a raw push frame
        // run through boundary normalization the way a transport would.
        let remote = handle.remote_sender();
        let _ = remote
            .send(RemoteEvent::Typing {
                user_id: "peer".to_owned(),
                display_name: "Peer".to_owned(),
            })
            .await;
        let frame = serde_json::json!({
            "id": "rt-1",
            "conversationId": config.conversation_id,
            "senderId": "peer",
            "kind": "text",
            "content": "hello from the wire",
            "createdAt": wall_now_ms().to_string(),
        });
        match normalize_message(&frame) {
            Ok(record) => {
                let _ = remote.send(RemoteEvent::NewMessage(record)).await;
            }
            Err(err) => warn!("dropping malformed push frame: {err}"),
        }
    }

    let timeline = drain_timeline(&mut events).await;
    match timeline {
        Some(records) => {
            println!("Timeline for '{}':", config.conversation_id);
            for record in &records {
                let state = format!("{:?}", record.delivery_state).to_lowercase();
                println!(
                    "  [{state:>9}] {:<8} {}",
                    record.sender_id,
                    if record.recalled {
                        "(recalled)"
                    } else {
                        &record.content
                    }
                );
            }
            println!("{} records total.", records.len());
        }
        None => {
            eprintln!("No timeline snapshot received");
            handle.shutdown().await;
            std::process::exit(1);
        }
    }

    handle.shutdown().await;
}

/// Wait until the open attempt settles in a terminal phase.
async fn wait_for_settled_phase(
    events: &mut chat_core::EventStream,
) -> Option<ConversationPhase> {
    loop {
        let event = timeout(EVENT_WAIT, events.recv()).await.ok()?.ok()?;
        if let ChatEvent::PhaseChanged { phase } = event
            && phase != ConversationPhase::Opening
        {
            return Some(phase);
        }
    }
}

/// Collect events until they go quiet, keeping the last timeline snapshot.
async fn drain_timeline(events: &mut chat_core::EventStream) -> Option<Vec<MessageRecord>> {
    let mut latest = None;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(500), events.recv()).await {
        match event {
            ChatEvent::TimelineChanged { records, .. } => latest = Some(records),
            ChatEvent::SendAck(ack) => {
                info!(provisional = %ack.provisional_id, id = ?ack.message_id, "send acknowledged");
            }
            ChatEvent::TypingChanged { users } => {
                info!(count = users.len(), "typing users changed");
            }
            ChatEvent::FatalError { code, message, .. } => {
                eprintln!("Runtime error [{code}]: {message}");
            }
            ChatEvent::PhaseChanged { .. } => {}
        }
    }
    latest
}

fn seeded_in_memory_api(conversation_id: &str) -> InMemoryChatApi {
    let api = InMemoryChatApi::new();
    api.seed_conversation(
        conversation_id,
        vec![
            peer_message(conversation_id, "srv-seed-1", "welcome to the smoke run"),
            peer_message(conversation_id, "srv-seed-2", "say something"),
        ],
    );
    api
}

fn peer_message(conversation_id: &str, id: &str, content: &str) -> MessageRecord {
    MessageRecord {
        id: id.to_owned(),
        provisional_id: None,
        conversation_id: conversation_id.to_owned(),
        sender_id: "peer".to_owned(),
        content: content.to_owned(),
        kind: MessageKind::Text,
        attachments: Vec::new(),
        created_at_ms: wall_now_ms(),
        seq: 0,
        delivery_state: DeliveryState::Sent,
        recalled: false,
        pinned: false,
        hidden_from: Default::default(),
        delivered_to: Default::default(),
        read_by: Default::default(),
        reply_to_id: None,
        reply_snapshot: None,
    }
}

fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
