use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChatCommand, ChatEvent, RemoteEvent};

/// Broadcast event stream type consumed by presentation subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Errors returned by chat channel operations.
#[derive(Debug, Error)]
pub enum ChatChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The remote-event receiver side is closed.
    #[error("remote event channel is closed")]
    RemoteChannelClosed,
}

/// Channel set wiring user intent, realtime pushes and emitted events.
///
/// Commands and remote events feed the runtime over mpsc channels; events
/// fan out to presentation subscribers over a broadcast channel.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    remote_tx: mpsc::Sender<RemoteEvent>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Create a new channel set and return it with both receivers.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<ChatCommand>, mpsc::Receiver<RemoteEvent>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (remote_tx, remote_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                remote_tx,
                event_tx,
            },
            command_rx,
            remote_rx,
        )
    }

    /// Clone the command sender.
    pub fn command_sender(&self) -> mpsc::Sender<ChatCommand> {
        self.command_tx.clone()
    }

    /// Clone the remote-event sender handed to the realtime transport.
    pub fn remote_sender(&self) -> mpsc::Sender<RemoteEvent> {
        self.remote_tx.clone()
    }

    /// Subscribe to emitted chat events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatChannelError::CommandChannelClosed)
    }

    /// Inject one normalized remote event.
    pub async fn send_remote(&self, event: RemoteEvent) -> Result<(), ChatChannelError> {
        self.remote_tx
            .send(event)
            .await
            .map_err(|_| ChatChannelError::RemoteChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }
}
