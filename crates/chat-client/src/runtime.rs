//! Single-conversation chat runtime.
//!
//! Owns the reconciler, lifecycle phase machine and typing tracker, and
//! drives them from two inputs: the command channel (user intents) and the
//! remote channel (normalized realtime pushes). All state lives on this
//! task; the outside world only ever sees emitted [`ChatEvent`]s.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chat_core::{
    Attachment, ChatChannels, ChatCommand, ChatError, ChatErrorCategory, ChatEvent,
    ConfirmedSend, ConversationPhaseMachine, EventStream, MessageKind,
    OpenResult, Reconciler, ReconcilerConfig, RemoteEvent, SendAck, StateChange, TypingTracker,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChatApi, FetchDirection};

/// Runtime tuning values.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// User id the runtime acts as; used as sender for outgoing messages
    /// and as the viewer for timeline snapshots.
    pub viewer_id: String,
    /// Page size for the initial load and for pagination commands.
    pub page_limit: u16,
    /// Reconciliation windows and typing TTL.
    pub reconciler: ReconcilerConfig,
}

impl RuntimeConfig {
    /// Config for the given user with default windows.
    pub fn for_user(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            page_limit: 50,
            reconciler: ReconcilerConfig::default(),
        }
    }
}

/// Handle to a spawned runtime task.
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ChatRuntimeHandle {
    /// Send one command to the runtime.
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatError> {
        self.channels.send_command(command).await.map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Internal,
                "runtime_gone",
                err.to_string(),
            )
        })
    }

    /// Sender for the realtime transport to inject normalized events.
    pub fn remote_sender(&self) -> mpsc::Sender<RemoteEvent> {
        self.channels.remote_sender()
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Stop the runtime and wait for its task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// The runtime state machine; see the module docs.
pub struct ChatRuntime {
    channels: ChatChannels,
    command_rx: mpsc::Receiver<ChatCommand>,
    remote_rx: mpsc::Receiver<RemoteEvent>,
    api: Arc<dyn ChatApi>,
    config: RuntimeConfig,
    phase: ConversationPhaseMachine,
    reconciler: Option<Reconciler>,
    typing: TypingTracker,
}

/// Spawn a runtime task on the current tokio runtime.
pub fn spawn_runtime(api: Arc<dyn ChatApi>, config: RuntimeConfig) -> ChatRuntimeHandle {
    let (runtime, channels) = ChatRuntime::new(api, config);
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let join = tokio::spawn(async move { runtime.run(task_cancel).await });
    ChatRuntimeHandle {
        channels,
        cancel,
        join,
    }
}

impl ChatRuntime {
    /// Build a runtime plus the channel set used to talk to it.
    pub fn new(api: Arc<dyn ChatApi>, config: RuntimeConfig) -> (Self, ChatChannels) {
        let (channels, command_rx, remote_rx) = ChatChannels::new(64, 256);
        let typing = TypingTracker::new(config.reconciler.typing_ttl_ms);
        let runtime = Self {
            channels: channels.clone(),
            command_rx,
            remote_rx,
            api,
            config,
            phase: ConversationPhaseMachine::default(),
            reconciler: None,
            typing,
        };
        (runtime, channels)
    }

    /// Drive the runtime until cancellation or until both inputs close.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(viewer = %self.config.viewer_id, "chat runtime started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("chat runtime cancelled");
                    break;
                }
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(err) = self.handle_command(command).await {
                        warn!(code = %err.code, "command failed: {err}");
                        self.channels.emit(ChatEvent::FatalError {
                            code: err.code.clone(),
                            message: err.message.clone(),
                            recoverable: is_recoverable(&err),
                        });
                    }
                }
                remote = self.remote_rx.recv() => {
                    let Some(remote) = remote else { break };
                    self.handle_remote(remote);
                }
            }
        }
        info!("chat runtime stopped");
    }

    async fn handle_command(&mut self, command: ChatCommand) -> Result<(), ChatError> {
        self.phase.check(&command)?;
        match command {
            ChatCommand::OpenConversation { conversation_id } => {
                self.open_conversation(conversation_id).await
            }
            ChatCommand::CloseConversation => {
                self.reconciler = None;
                self.typing.reset();
                let phase = self.phase.on_close();
                self.channels.emit(ChatEvent::PhaseChanged { phase });
                Ok(())
            }
            ChatCommand::PaginateOlder { limit } => self.paginate_older(limit).await,
            ChatCommand::SendText { content } => {
                self.send(content, MessageKind::Text, Vec::new(), None).await
            }
            ChatCommand::SendAttachment {
                kind,
                content,
                attachments,
            } => self.send(content, kind, attachments, None).await,
            ChatCommand::Reply {
                original_id,
                content,
            } => {
                self.send(content, MessageKind::Text, Vec::new(), Some(original_id))
                    .await
            }
            ChatCommand::Recall { message_id } => {
                let conversation_id = self.reconciler_mut()?.conversation_id().to_owned();
                self.api
                    .recall_message(&conversation_id, &message_id)
                    .await?;
                self.apply_local_change(&message_id, StateChange::Recall)
            }
            ChatCommand::Pin { message_id } => {
                let conversation_id = self.reconciler_mut()?.conversation_id().to_owned();
                self.api
                    .set_pinned(&conversation_id, &message_id, true)
                    .await?;
                self.apply_local_change(&message_id, StateChange::Pin)
            }
            ChatCommand::Unpin { message_id } => {
                let conversation_id = self.reconciler_mut()?.conversation_id().to_owned();
                self.api
                    .set_pinned(&conversation_id, &message_id, false)
                    .await?;
                self.apply_local_change(&message_id, StateChange::Unpin)
            }
        }
    }

    async fn open_conversation(&mut self, conversation_id: String) -> Result<(), ChatError> {
        let phase = self.phase.on_open();
        self.channels.emit(ChatEvent::PhaseChanged { phase });
        self.typing.reset();
        self.reconciler = None;

        let fetched = self
            .api
            .fetch_messages(&conversation_id, None, self.config.page_limit, FetchDirection::Older)
            .await;
        match fetched {
            Ok(page) => {
                let mut reconciler =
                    Reconciler::new(conversation_id.clone(), self.config.reconciler);
                let inserted =
                    reconciler.extend_older(page.messages, page.next_cursor, page.has_more);
                debug!(conversation = %conversation_id, inserted, "conversation loaded");
                self.reconciler = Some(reconciler);
                let phase = self.phase.on_open_result(OpenResult::Loaded);
                self.channels.emit(ChatEvent::PhaseChanged { phase });
                self.emit_timeline();
                Ok(())
            }
            Err(err) if err.category == ChatErrorCategory::NotFound => {
                let phase = self.phase.on_open_result(OpenResult::NotFound);
                self.channels.emit(ChatEvent::PhaseChanged { phase });
                Ok(())
            }
            Err(err) => {
                let phase = self.phase.on_open_result(OpenResult::Failed);
                self.channels.emit(ChatEvent::PhaseChanged { phase });
                Err(err)
            }
        }
    }

    async fn paginate_older(&mut self, limit: u16) -> Result<(), ChatError> {
        let reconciler = self.reconciler_mut()?;
        let conversation_id = reconciler.conversation_id().to_owned();
        let window = reconciler.window();
        if !window.has_more_older {
            debug!("pagination skipped, no older history");
            return Ok(());
        }
        let cursor = window.oldest_cursor.clone();
        let limit = if limit == 0 { self.config.page_limit } else { limit };

        let page = self
            .api
            .fetch_messages(
                &conversation_id,
                cursor.as_deref(),
                limit,
                FetchDirection::Older,
            )
            .await?;
        let reconciler = self.reconciler_mut()?;
        let inserted = reconciler.extend_older(page.messages, page.next_cursor, page.has_more);
        debug!(inserted, "older page merged");
        self.emit_timeline();
        Ok(())
    }

    async fn send(
        &mut self,
        content: String,
        kind: MessageKind,
        attachments: Vec<Attachment>,
        reply_to_id: Option<String>,
    ) -> Result<(), ChatError> {
        let viewer_id = self.config.viewer_id.clone();
        let reconciler = self.reconciler_mut()?;
        let conversation_id = reconciler.conversation_id().to_owned();
        let provisional_id = reconciler
            .create_optimistic(
                now_ms(),
                &viewer_id,
                &content,
                kind,
                attachments.clone(),
                reply_to_id.as_deref(),
            )
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Internal,
                    "optimistic_insert_failed",
                    err.to_string(),
                )
            })?;
        self.emit_timeline();

        let sent = match reply_to_id {
            Some(original_id) => {
                self.api
                    .reply_to_message(&conversation_id, &original_id, &content)
                    .await
            }
            None => {
                self.api
                    .send_message(&conversation_id, &content, kind, attachments)
                    .await
            }
        };

        let reconciler = self.reconciler_mut()?;
        match sent {
            Ok(record) => {
                let confirmed = ConfirmedSend {
                    id: record.id.clone(),
                    created_at_ms: record.created_at_ms,
                    attachments: Some(record.attachments),
                };
                reconciler.confirm_send(&provisional_id, &confirmed);
                self.channels.emit(ChatEvent::SendAck(SendAck {
                    provisional_id,
                    message_id: Some(record.id),
                    error_code: None,
                }));
                self.emit_timeline();
                Ok(())
            }
            Err(err) => {
                reconciler.fail_send(&provisional_id);
                self.channels.emit(ChatEvent::SendAck(SendAck {
                    provisional_id,
                    message_id: None,
                    error_code: Some(err.code.clone()),
                }));
                self.emit_timeline();
                // The failed record stays in the timeline; the ack already
                // carries the error, so the command itself succeeds.
                debug!(code = %err.code, "send rejected");
                Ok(())
            }
        }
    }

    fn handle_remote(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Typing {
                user_id,
                display_name,
            } => {
                if user_id == self.config.viewer_id {
                    return;
                }
                let now = now_ms();
                self.typing.note(user_id, display_name, now);
                self.channels.emit(ChatEvent::TypingChanged {
                    users: self.typing.active(now),
                });
            }
            event => {
                let Some(reconciler) = self.reconciler.as_mut() else {
                    debug!("remote event dropped, no open conversation");
                    return;
                };
                if let RemoteEvent::NewMessage(record) = &event
                    && record.conversation_id != reconciler.conversation_id()
                {
                    debug!(
                        conversation = %record.conversation_id,
                        "remote message for another conversation dropped"
                    );
                    return;
                }
                if reconciler.apply_remote(event) {
                    self.emit_timeline();
                }
            }
        }
    }

    fn apply_local_change(&mut self, message_id: &str, change: StateChange) -> Result<(), ChatError> {
        if self.reconciler_mut()?.apply_state_change(message_id, &change) {
            self.emit_timeline();
        }
        Ok(())
    }

    fn reconciler_mut(&mut self) -> Result<&mut Reconciler, ChatError> {
        let phase = self.phase.phase();
        self.reconciler
            .as_mut()
            .ok_or_else(|| ChatError::invalid_phase(phase, "timeline command"))
    }

    fn emit_timeline(&self) {
        let Some(reconciler) = self.reconciler.as_ref() else {
            return;
        };
        self.channels.emit(ChatEvent::TimelineChanged {
            conversation_id: reconciler.conversation_id().to_owned(),
            records: reconciler.query(&self.config.viewer_id).cloned().collect(),
        });
    }
}

fn is_recoverable(err: &ChatError) -> bool {
    !matches!(
        err.category,
        ChatErrorCategory::Internal | ChatErrorCategory::Serialization
    )
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InMemoryChatApi;
    use chat_core::{ConversationPhase, DeliveryState, MessageRecord};
    use std::time::Duration;
    use tokio::time::timeout;

    const CONVERSATION: &str = "c1";

    async fn seeded_runtime() -> (ChatRuntime, ChatChannels) {
        let api = InMemoryChatApi::default();
        api.seed_conversation(CONVERSATION, Vec::new());
        for n in 0..3 {
            api.send_message(CONVERSATION, &format!("history {n}"), MessageKind::Text, Vec::new())
                .await
                .expect("seed send should work");
        }
        ChatRuntime::new(Arc::new(api), RuntimeConfig::for_user("self"))
    }

    fn remote_message(id: &str, sender: &str, content: &str, created_at_ms: u64) -> MessageRecord {
        MessageRecord {
            id: id.to_owned(),
            provisional_id: None,
            conversation_id: CONVERSATION.to_owned(),
            sender_id: sender.to_owned(),
            content: content.to_owned(),
            kind: MessageKind::Text,
            attachments: Vec::new(),
            created_at_ms,
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

    async fn next_event(stream: &mut EventStream) -> ChatEvent {
        timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("event should arrive in time")
            .expect("event stream should stay open")
    }

    #[tokio::test]
    async fn open_loads_history_and_reaches_ready() {
        let (mut runtime, channels) = seeded_runtime().await;
        let mut events = channels.subscribe();

        runtime
            .handle_command(ChatCommand::OpenConversation {
                conversation_id: CONVERSATION.to_owned(),
            })
            .await
            .expect("open should work");

        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::PhaseChanged {
                phase: ConversationPhase::Opening
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::PhaseChanged {
                phase: ConversationPhase::Ready
            }
        );
        match next_event(&mut events).await {
            ChatEvent::TimelineChanged {
                conversation_id,
                records,
            } => {
                assert_eq!(conversation_id, CONVERSATION);
                assert_eq!(records.len(), 3);
            }
            other => panic!("expected timeline snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_unknown_conversation_reports_not_found_phase() {
        let api = InMemoryChatApi::default();
        let (mut runtime, channels) =
            ChatRuntime::new(Arc::new(api), RuntimeConfig::for_user("self"));
        let mut events = channels.subscribe();

        runtime
            .handle_command(ChatCommand::OpenConversation {
                conversation_id: "missing".to_owned(),
            })
            .await
            .expect("not-found open is not a command error");

        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::PhaseChanged {
                phase: ConversationPhase::Opening
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::PhaseChanged {
                phase: ConversationPhase::NotFound
            }
        );
        assert!(runtime.reconciler.is_none());
    }

    #[tokio::test]
    async fn send_shows_pending_then_promotes_and_acks() {
        let (mut runtime, channels) = seeded_runtime().await;
        let mut events = channels.subscribe();
        runtime
            .handle_command(ChatCommand::OpenConversation {
                conversation_id: CONVERSATION.to_owned(),
            })
            .await
            .expect("open should work");
        // Drain the open events.
        for _ in 0..3 {
            next_event(&mut events).await;
        }

        runtime
            .handle_command(ChatCommand::SendText {
                content: "hello".to_owned(),
            })
            .await
            .expect("send should work");

        match next_event(&mut events).await {
            ChatEvent::TimelineChanged { records, .. } => {
                let last = records.last().expect("optimistic record present");
                assert_eq!(last.delivery_state, DeliveryState::Pending);
                assert!(last.id.starts_with("local-"));
            }
            other => panic!("expected optimistic snapshot, got {other:?}"),
        }
        let ack = match next_event(&mut events).await {
            ChatEvent::SendAck(ack) => ack,
            other => panic!("expected send ack, got {other:?}"),
        };
        assert!(ack.message_id.is_some());
        assert_eq!(ack.error_code, None);
        match next_event(&mut events).await {
            ChatEvent::TimelineChanged { records, .. } => {
                let last = records.last().expect("confirmed record present");
                assert_eq!(Some(last.id.clone()), ack.message_id);
                assert_eq!(last.delivery_state, DeliveryState::Sent);
                assert_eq!(last.provisional_id, Some(ack.provisional_id.clone()));
            }
            other => panic!("expected confirmed snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn echo_after_confirmation_does_not_duplicate() {
        let (mut runtime, _channels) = seeded_runtime().await;
        runtime
            .handle_command(ChatCommand::OpenConversation {
                conversation_id: CONVERSATION.to_owned(),
            })
            .await
            .expect("open should work");
        runtime
            .handle_command(ChatCommand::SendText {
                content: "race me".to_owned(),
            })
            .await
            .expect("send should work");

        let reconciler = runtime.reconciler.as_ref().expect("conversation open");
        let before = reconciler.store().len();
        let confirmed = reconciler
            .store()
            .records()
            .last()
            .expect("sent record present")
            .clone();

        // The realtime echo of our own send arrives after the API response.
        runtime.handle_remote(RemoteEvent::NewMessage(remote_message(
            &confirmed.id,
            "self",
            "race me",
            confirmed.created_at_ms,
        )));

        let reconciler = runtime.reconciler.as_ref().expect("conversation open");
        assert_eq!(reconciler.store().len(), before);
    }

    #[tokio::test]
    async fn remote_message_for_other_conversation_is_dropped() {
        let (mut runtime, _channels) = seeded_runtime().await;
        runtime
            .handle_command(ChatCommand::OpenConversation {
                conversation_id: CONVERSATION.to_owned(),
            })
            .await
            .expect("open should work");
        let before = runtime.reconciler.as_ref().expect("open").store().len();

        let mut stray = remote_message("srv-x", "u2", "elsewhere", now_ms());
        stray.conversation_id = "c-other".to_owned();
        runtime.handle_remote(RemoteEvent::NewMessage(stray));

        assert_eq!(
            runtime.reconciler.as_ref().expect("open").store().len(),
            before
        );
    }

    #[tokio::test]
    async fn typing_event_emits_active_users() {
        let (mut runtime, channels) = seeded_runtime().await;
        let mut events = channels.subscribe();

        runtime.handle_remote(RemoteEvent::Typing {
            user_id: "u2".to_owned(),
            display_name: "Uma".to_owned(),
        });

        match next_event(&mut events).await {
            ChatEvent::TypingChanged { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].user_id, "u2");
                assert_eq!(users[0].display_name, "Uma");
            }
            other => panic!("expected typing update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn own_typing_echo_is_ignored() {
        let (mut runtime, channels) = seeded_runtime().await;
        let events = channels.subscribe();

        runtime.handle_remote(RemoteEvent::Typing {
            user_id: "self".to_owned(),
            display_name: "Me".to_owned(),
        });

        assert_eq!(events.len(), 0);
    }

    #[tokio::test]
    async fn commands_before_open_are_rejected_with_invalid_phase() {
        let (mut runtime, _channels) = seeded_runtime().await;
        let err = runtime
            .handle_command(ChatCommand::SendText {
                content: "too early".to_owned(),
            })
            .await
            .expect_err("send before open should fail");
        assert_eq!(err.code, "invalid_phase");
    }

    #[tokio::test]
    async fn spawned_runtime_round_trips_over_channels() {
        let api = InMemoryChatApi::default();
        api.seed_conversation(CONVERSATION, Vec::new());
        let handle = spawn_runtime(Arc::new(api), RuntimeConfig::for_user("self"));
        let mut events = handle.subscribe();

        handle
            .send(ChatCommand::OpenConversation {
                conversation_id: CONVERSATION.to_owned(),
            })
            .await
            .expect("command should send");

        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::PhaseChanged {
                phase: ConversationPhase::Opening
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::PhaseChanged {
                phase: ConversationPhase::Ready
            }
        );

        handle.shutdown().await;
    }
}
