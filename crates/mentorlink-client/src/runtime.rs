//! Async runtime driving the connection manager.
//!
//! The runtime is a single tokio task that owns the
//! [`ChatConnectionManager`], the live transport, and the reconnect timer. It
//! `select!`s over consumer commands and one internal event channel fed by
//! helper tasks (connect attempts, per-connection hub pumps, timers), feeds
//! each event to the manager, and executes the resulting actions. Because all
//! events funnel through one loop, state transitions are totally ordered and
//! store invalidations happen in arrival order.

use std::sync::Arc;

use mentorlink_core::{
    BackoffPolicy, ChatConnectionManager, ChatError, ConnectionId, ConnectionState, Environment,
    ManagerAction, ManagerConfig, ManagerEvent, RoomId, TieredBackoff, TimerId,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::AbortHandle,
};

use crate::{
    Connector, HubConnection, HubEvent, HubRequest, MessageStore,
    handle::{ChatHandle, Command, Reply, RoomNotice},
};

/// Default capacity of the room notice broadcast channel.
pub const DEFAULT_NOTICE_BUFFER: usize = 64;

/// Runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Manager configuration.
    pub manager: ManagerConfig,
    /// Room notices buffered per subscriber before lagging.
    pub notice_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { manager: ManagerConfig::default(), notice_buffer: DEFAULT_NOTICE_BUFFER }
    }
}

/// Events produced by helper tasks.
#[derive(Debug)]
enum Internal {
    ConnectFinished { connection_id: ConnectionId, result: Result<HubConnection, ChatError> },
    Hub { connection_id: ConnectionId, event: HubEvent },
    TimerFired { timer_id: TimerId },
}

/// Transport that completed its handshake.
struct LiveTransport {
    connection_id: ConnectionId,
    to_hub: mpsc::UnboundedSender<HubRequest>,
    io_task: Option<AbortHandle>,
    pump: AbortHandle,
}

impl LiveTransport {
    fn stop(&self) {
        if let Some(io_task) = &self.io_task {
            io_task.abort();
        }
        self.pump.abort();
    }
}

/// Runtime task state.
///
/// Generic over the transport (`C`), message store (`S`) and environment
/// (`E`) so production and simulation share the same loop.
pub struct ChatRuntime<C, S, E>
where
    C: Connector,
    S: MessageStore,
    E: Environment,
{
    manager: ChatConnectionManager,
    connector: Arc<C>,
    store: S,
    env: E,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state_tx: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<RoomNotice>,
    connecting: Option<(ConnectionId, AbortHandle)>,
    live: Option<LiveTransport>,
    timer: Option<(TimerId, AbortHandle)>,
    outage_since: Option<E::Instant>,
    open_waiters: Vec<Reply>,
    join_waiters: Vec<(RoomId, Reply)>,
}

impl<C, S, E> ChatRuntime<C, S, E>
where
    C: Connector,
    S: MessageStore,
    E: Environment,
{
    /// Spawn a runtime with the default tiered backoff.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(connector: C, store: S, env: E, config: RuntimeConfig) -> ChatHandle {
        Self::spawn_with_backoff(connector, store, env, Box::new(TieredBackoff::default()), config)
    }

    /// Spawn a runtime with an explicit backoff policy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_with_backoff(
        connector: C,
        store: S,
        env: E,
        backoff: Box<dyn BackoffPolicy>,
        config: RuntimeConfig,
    ) -> ChatHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (notices, _) = broadcast::channel(config.notice_buffer.max(1));

        let handle = ChatHandle::new(commands_tx, state_rx, notices.clone());

        let runtime = Self {
            manager: ChatConnectionManager::new(config.manager, backoff),
            connector: Arc::new(connector),
            store,
            env,
            commands,
            internal_tx,
            internal_rx,
            state_tx,
            notices,
            connecting: None,
            live: None,
            timer: None,
            outage_since: None,
            open_waiters: Vec::new(),
            join_waiters: Vec::new(),
        };

        tokio::spawn(runtime.run());
        handle
    }

    /// Run until shut down or every handle is dropped.
    async fn run(mut self) {
        tracing::debug!("chat runtime started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
            }
        }

        let actions = self.manager.close();
        self.execute(actions);
        self.resolve_all(&ChatError::Stopped);

        tracing::debug!("chat runtime stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { credential, reply } => match self.manager.open(credential) {
                Ok(actions) => {
                    self.execute(actions);
                    match self.manager.state() {
                        ConnectionState::Connected => {
                            let _ = reply.send(Ok(()));
                        },
                        _ => self.open_waiters.push(reply),
                    }
                },
                Err(error) => {
                    let _ = reply.send(Err(error));
                },
            },
            Command::Close => {
                let actions = self.manager.close();
                self.execute(actions);
            },
            Command::SetActive { room_id } => {
                let actions = self.manager.set_active(room_id);
                self.execute(actions);
                self.resolve_superseded();
            },
            Command::JoinRoom { room_id, reply } => {
                let actions = self.manager.join_room(room_id);
                self.execute(actions);
                self.resolve_superseded();

                if self.manager.active_room() == Some(room_id) {
                    let _ = reply.send(Ok(()));
                } else {
                    self.join_waiters.push((room_id, reply));
                }
            },
            Command::Shutdown => {},
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::ConnectFinished { connection_id, result } => {
                if self.connecting.as_ref().is_some_and(|(id, _)| *id == connection_id) {
                    self.connecting = None;
                }

                match result {
                    Ok(connection) => {
                        let current = self.manager.current_connection() == Some(connection_id);
                        if !current || self.manager.state().is_connected() {
                            tracing::debug!(connection_id, "discarding stale connection");
                            connection.stop();
                            return;
                        }

                        self.install(connection_id, connection);
                        self.apply(ManagerEvent::TransportOpened { connection_id });
                    },
                    Err(error) => {
                        self.apply(ManagerEvent::TransportFailed { connection_id, error });
                    },
                }
            },
            Internal::Hub { connection_id, event } => {
                if self.live.as_ref().map(|live| live.connection_id) != Some(connection_id) {
                    tracing::trace!(connection_id, "event from stopped connection");
                    return;
                }

                match event {
                    HubEvent::Completion { invocation_id, result } => {
                        self.apply(ManagerEvent::InvocationCompleted { invocation_id, result });
                    },
                    HubEvent::Message(message) => {
                        self.apply(ManagerEvent::MessageReceived { connection_id, message });
                    },
                    HubEvent::Closed { error } => {
                        if let Some(live) = self.live.take() {
                            live.stop();
                        }
                        self.apply(ManagerEvent::TransportClosed { connection_id, error });
                    },
                }
            },
            Internal::TimerFired { timer_id } => {
                if self.timer.as_ref().is_some_and(|(id, _)| *id == timer_id) {
                    self.timer = None;
                }
                self.apply(ManagerEvent::ReconnectDue { timer_id });
            },
        }
    }

    fn apply(&mut self, event: ManagerEvent) {
        match self.manager.handle(event) {
            Ok(actions) => self.execute(actions),
            Err(error) => tracing::warn!(%error, "manager rejected event"),
        }
    }

    fn execute(&mut self, actions: Vec<ManagerAction>) {
        for action in actions {
            match action {
                ManagerAction::StartTransport { connection_id, credential } => {
                    self.start_transport(connection_id, credential);
                },
                ManagerAction::StopTransport { connection_id } => {
                    self.stop_transport(connection_id);
                },
                ManagerAction::ScheduleReconnect { timer_id, delay } => {
                    let env = self.env.clone();
                    let tx = self.internal_tx.clone();
                    let task = tokio::spawn(async move {
                        env.sleep(delay).await;
                        let _ = tx.send(Internal::TimerFired { timer_id });
                    });
                    if let Some((_, previous)) = self.timer.replace((timer_id, task.abort_handle()))
                    {
                        previous.abort();
                    }
                },
                ManagerAction::CancelReconnect { timer_id } => {
                    if let Some((id, task)) = self.timer.take() {
                        if id == timer_id {
                            task.abort();
                        } else {
                            self.timer = Some((id, task));
                        }
                    }
                },
                ManagerAction::InvokeJoin { connection_id, invocation_id, room_id } => {
                    self.invoke(connection_id, HubRequest::Join { invocation_id, room_id });
                },
                ManagerAction::InvokeLeave { connection_id, invocation_id, room_id } => {
                    self.invoke(connection_id, HubRequest::Leave { invocation_id, room_id });
                },
                ManagerAction::Invalidate { room_id } => self.store.invalidate(room_id),
                ManagerAction::StateChanged(state) => self.publish_state(state),
                ManagerAction::RoomJoined { room_id } => {
                    self.resolve_joins(room_id, &Ok(()));
                    let _ = self.notices.send(RoomNotice::Joined { room_id });
                },
                ManagerAction::RoomLeft { room_id } => {
                    let _ = self.notices.send(RoomNotice::Left { room_id });
                },
                ManagerAction::JoinFailed { room_id, error, will_retry } => {
                    self.resolve_joins(room_id, &Err(error.clone()));
                    let _ = self.notices.send(RoomNotice::JoinFailed { room_id, error, will_retry });
                },
            }
        }
    }

    fn start_transport(&mut self, connection_id: ConnectionId, credential: String) {
        let connector = Arc::clone(&self.connector);
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let result = connector.connect(credential).await;
            let _ = tx.send(Internal::ConnectFinished { connection_id, result });
        });

        if let Some((_, previous)) = self.connecting.replace((connection_id, task.abort_handle())) {
            previous.abort();
        }
    }

    fn stop_transport(&mut self, connection_id: ConnectionId) {
        if let Some((id, task)) = self.connecting.take() {
            if id == connection_id {
                task.abort();
            } else {
                self.connecting = Some((id, task));
            }
        }

        if self.live.as_ref().is_some_and(|live| live.connection_id == connection_id) {
            if let Some(live) = self.live.take() {
                tracing::debug!(connection_id, "stopping transport");
                live.stop();
            }
        }
    }

    fn install(&mut self, connection_id: ConnectionId, connection: HubConnection) {
        let (to_hub, mut from_hub, io_task) = connection.into_parts();
        let tx = self.internal_tx.clone();

        let pump = tokio::spawn(async move {
            while let Some(event) = from_hub.recv().await {
                let closed = matches!(event, HubEvent::Closed { .. });
                if tx.send(Internal::Hub { connection_id, event }).is_err() || closed {
                    return;
                }
            }

            let error = Some(ChatError::Closed("hub event stream ended".to_string()));
            let _ = tx.send(Internal::Hub { connection_id, event: HubEvent::Closed { error } });
        });

        if let Some(previous) = self.live.replace(LiveTransport {
            connection_id,
            to_hub,
            io_task,
            pump: pump.abort_handle(),
        }) {
            previous.stop();
        }
    }

    fn invoke(&mut self, connection_id: ConnectionId, request: HubRequest) {
        match &self.live {
            Some(live) if live.connection_id == connection_id => {
                if live.to_hub.send(request).is_err() {
                    // The pump reports the closure.
                    tracing::warn!(connection_id, "hub request channel closed");
                }
            },
            _ => tracing::warn!(connection_id, ?request, "no live transport for invocation"),
        }
    }

    fn publish_state(&mut self, state: ConnectionState) {
        match &state {
            ConnectionState::Connected => {
                if let Some(since) = self.outage_since.take() {
                    let outage = self.env.now() - since;
                    tracing::info!(?outage, "hub connection restored");
                }
                for waiter in self.open_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            },
            ConnectionState::Failed { error } => {
                let error = self
                    .manager
                    .failure()
                    .cloned()
                    .unwrap_or_else(|| ChatError::Closed(error.clone()));
                self.outage_since = None;
                self.resolve_all(&error);
            },
            ConnectionState::Disconnected => {
                self.outage_since = None;
                self.resolve_all(&ChatError::Closed("connection closed by client".to_string()));
            },
            ConnectionState::Reconnecting { .. } => {
                if self.outage_since.is_none() {
                    self.outage_since = Some(self.env.now());
                }
            },
            ConnectionState::Connecting => {},
        }

        self.state_tx.send_replace(state);
    }

    fn resolve_joins(&mut self, room_id: RoomId, result: &Result<(), ChatError>) {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.join_waiters)
            .into_iter()
            .partition(|(room, _)| *room == room_id);
        self.join_waiters = rest;
        for (_, waiter) in matching {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_superseded(&mut self) {
        let desired = self.manager.desired_room();
        let (stale, current): (Vec<_>, Vec<_>) = std::mem::take(&mut self.join_waiters)
            .into_iter()
            .partition(|(room, _)| Some(*room) != desired);
        self.join_waiters = current;

        for (room_id, waiter) in stale {
            let _ = waiter.send(Err(ChatError::Superseded { room_id }));
        }
    }

    fn resolve_all(&mut self, error: &ChatError) {
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for (_, waiter) in self.join_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

impl<C, S, E> Drop for ChatRuntime<C, S, E>
where
    C: Connector,
    S: MessageStore,
    E: Environment,
{
    fn drop(&mut self) {
        if let Some((_, task)) = self.connecting.take() {
            task.abort();
        }
        if let Some(live) = self.live.take() {
            live.stop();
        }
        if let Some((_, task)) = self.timer.take() {
            task.abort();
        }
    }
}
