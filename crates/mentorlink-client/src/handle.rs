//! Consumer-facing handle to a running [`crate::ChatRuntime`].

use mentorlink_core::{ChatError, ConnectionState, RoomId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::CredentialSource;

/// Room membership notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotice {
    /// Room joined; inbound messages for it now invalidate the store.
    Joined {
        /// Room joined.
        room_id: RoomId,
    },
    /// Interest in a room was dropped.
    Left {
        /// Room left.
        room_id: RoomId,
    },
    /// Joining failed. The connection is unaffected.
    JoinFailed {
        /// Room that could not be joined.
        room_id: RoomId,
        /// Failure reason.
        error: ChatError,
        /// Whether the join is retried on the next connect.
        will_retry: bool,
    },
}

pub(crate) type Reply = oneshot::Sender<Result<(), ChatError>>;

/// Commands sent from handles to the runtime task.
#[derive(Debug)]
pub(crate) enum Command {
    Open { credential: String, reply: Reply },
    Close,
    SetActive { room_id: Option<RoomId> },
    JoinRoom { room_id: RoomId, reply: Reply },
    Shutdown,
}

/// Cloneable handle to a chat runtime.
///
/// Dropping every handle shuts the runtime down: the transport is stopped and
/// pending reconnect timers are cancelled.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    notices: broadcast::Sender<RoomNotice>,
}

impl ChatHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<ConnectionState>,
        notices: broadcast::Sender<RoomNotice>,
    ) -> Self {
        Self { commands, state, notices }
    }

    /// Open a connection authenticated with `credential`.
    ///
    /// Suspends until the hub accepts the connection or the manager gives up.
    /// Opening again with the same credential while connected returns
    /// immediately without a second connection.
    ///
    /// # Errors
    ///
    /// - `ChatError::MissingCredential` if the credential is blank
    /// - The terminal error if the connection ends up `Failed`
    /// - `ChatError::Closed` if `close` is called before it connects
    /// - `ChatError::Stopped` if the runtime is gone
    pub async fn open(&self, credential: impl Into<String>) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Open { credential: credential.into(), reply })?;
        rx.await.unwrap_or(Err(ChatError::Stopped))
    }

    /// Open with whatever credential `source` currently holds.
    ///
    /// # Errors
    ///
    /// - `ChatError::MissingCredential` if `source` has no credential
    /// - Anything [`ChatHandle::open`] returns
    pub async fn open_with(&self, source: &impl CredentialSource) -> Result<(), ChatError> {
        let Some(credential) = source.credential() else {
            return Err(ChatError::MissingCredential);
        };
        self.open(credential).await
    }

    /// Close the connection. Safe to call at any time, any number of times.
    pub fn close(&self) {
        let _ = self.send(Command::Close);
    }

    /// Select the active conversation, or clear the selection.
    ///
    /// Does not wait for the join; observe [`ChatHandle::notices`] or use
    /// [`ChatHandle::join_room`] for that.
    pub fn set_active(&self, room_id: Option<RoomId>) {
        let _ = self.send(Command::SetActive { room_id });
    }

    /// Make `room_id` active and wait until it is joined.
    ///
    /// If the connection is not up yet the join is issued after the next
    /// successful connect.
    ///
    /// # Errors
    ///
    /// - `ChatError::Superseded` if another room is selected first
    /// - The hub's error if the join fails
    /// - The connection's error if it fails or is closed meanwhile
    /// - `ChatError::Stopped` if the runtime is gone
    pub async fn join_room(&self, room_id: RoomId) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::JoinRoom { room_id, reply })?;
        rx.await.unwrap_or(Err(ChatError::Stopped))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Receive room membership notices from now on.
    pub fn notices(&self) -> broadcast::Receiver<RoomNotice> {
        self.notices.subscribe()
    }

    /// Stop the runtime even if other handles are alive.
    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }

    /// Wait until the runtime task has exited.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    fn send(&self, command: Command) -> Result<(), ChatError> {
        self.commands.send(command).map_err(|_| ChatError::Stopped)
    }
}
