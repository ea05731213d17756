//! Simulated chat hub.
//!
//! [`SimHub`] implements [`Connector`] with in-memory channels so the real
//! [`mentorlink_client::ChatRuntime`] can be exercised end to end. Tests
//! script connect outcomes, choose how joins are answered, push messages,
//! and drop connections; every call the runtime makes is recorded.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use mentorlink_client::{Connector, HUB_EVENT_BUFFER, HubConnection, HubEvent, HubRequest};
use mentorlink_core::{ChatError, InboundMessage, InvocationId, RoomId};
use tokio::sync::mpsc;

/// How the next connect attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Handshake succeeds.
    Accept,
    /// Connect fails with this error.
    Fail(ChatError),
    /// Connect never completes.
    Hang,
}

/// How join invocations are answered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JoinMode {
    /// Completed successfully as soon as they arrive.
    #[default]
    AutoAck,
    /// Held until [`SimHub::complete`] is called.
    Manual,
    /// Completed with an invocation error.
    Reject(String),
}

/// Call observed by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCall {
    /// Connect attempt with this credential.
    Connect {
        /// Bearer token presented.
        credential: String,
    },
    /// `JoinChat(room_id)`.
    Join {
        /// Connection the call arrived on (0-based).
        connection: usize,
        /// Invocation id.
        invocation_id: InvocationId,
        /// Room requested.
        room_id: RoomId,
    },
    /// `LeaveChat(room_id)`.
    Leave {
        /// Connection the call arrived on (0-based).
        connection: usize,
        /// Invocation id.
        invocation_id: InvocationId,
        /// Room requested.
        room_id: RoomId,
    },
}

#[derive(Debug)]
struct SimConnection {
    events: mpsc::Sender<HubEvent>,
    alive: bool,
    rooms: Vec<RoomId>,
}

#[derive(Debug, Default)]
struct HubState {
    outcomes: VecDeque<ConnectOutcome>,
    join_mode: JoinMode,
    connect_delay: Duration,
    calls: Vec<HubCall>,
    connections: Vec<SimConnection>,
    held: Vec<(usize, InvocationId, RoomId)>,
}

impl HubState {
    /// Record a request and produce the immediate reply, if any.
    fn handle_request(&mut self, connection: usize, request: HubRequest) -> Option<HubEvent> {
        match request {
            HubRequest::Join { invocation_id, room_id } => {
                self.calls.push(HubCall::Join { connection, invocation_id, room_id });
                match self.join_mode.clone() {
                    JoinMode::AutoAck => {
                        self.enter(connection, room_id);
                        Some(HubEvent::Completion { invocation_id, result: Ok(()) })
                    },
                    JoinMode::Manual => {
                        self.held.push((connection, invocation_id, room_id));
                        None
                    },
                    JoinMode::Reject(reason) => Some(HubEvent::Completion {
                        invocation_id,
                        result: Err(ChatError::Invocation { target: "JoinChat".into(), reason }),
                    }),
                }
            },
            HubRequest::Leave { invocation_id, room_id } => {
                self.calls.push(HubCall::Leave { connection, invocation_id, room_id });
                if let Some(conn) = self.connections.get_mut(connection) {
                    conn.rooms.retain(|r| *r != room_id);
                }
                Some(HubEvent::Completion { invocation_id, result: Ok(()) })
            },
        }
    }

    /// Hub-side join semantics: joining a room supersedes the previous one.
    fn enter(&mut self, connection: usize, room_id: RoomId) {
        if let Some(conn) = self.connections.get_mut(connection) {
            conn.rooms.clear();
            conn.rooms.push(room_id);
        }
    }

    fn latest_alive(&self) -> Option<usize> {
        self.connections.iter().rposition(|c| c.alive)
    }
}

/// Marks a connection dead when its serving task ends or is aborted.
struct AliveGuard {
    state: Arc<Mutex<HubState>>,
    connection: usize,
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = state.connections.get_mut(self.connection) {
            conn.alive = false;
        }
    }
}

/// In-memory hub. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimHub {
    state: Arc<Mutex<HubState>>,
}

impl SimHub {
    /// Hub that accepts every connection and acknowledges every join.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of a future connect attempt. Unscripted attempts
    /// are accepted.
    pub fn script_connect(&self, outcome: ConnectOutcome) {
        self.lock().outcomes.push_back(outcome);
    }

    /// Choose how joins are answered from now on.
    pub fn set_join_mode(&self, mode: JoinMode) {
        self.lock().join_mode = mode;
    }

    /// Delay every connect attempt by `delay` (virtual time).
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Every call observed so far.
    pub fn calls(&self) -> Vec<HubCall> {
        self.lock().calls.clone()
    }

    /// Number of connect attempts.
    pub fn connect_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| matches!(c, HubCall::Connect { .. })).count()
    }

    /// Rooms requested via join, in order.
    pub fn joins(&self) -> Vec<RoomId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                HubCall::Join { room_id, .. } => Some(*room_id),
                _ => None,
            })
            .collect()
    }

    /// Rooms requested via leave, in order.
    pub fn leaves(&self) -> Vec<RoomId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                HubCall::Leave { room_id, .. } => Some(*room_id),
                _ => None,
            })
            .collect()
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.lock().connections.iter().filter(|c| c.alive).count()
    }

    /// Rooms the newest live connection is a member of.
    pub fn member_rooms(&self) -> Vec<RoomId> {
        let state = self.lock();
        state.latest_alive().map(|i| state.connections[i].rooms.clone()).unwrap_or_default()
    }

    /// Join invocations held in [`JoinMode::Manual`], oldest first.
    pub fn held_joins(&self) -> Vec<(InvocationId, RoomId)> {
        self.lock().held.iter().map(|(_, id, room)| (*id, *room)).collect()
    }

    /// Answer a held join. Returns `false` if it is unknown or its connection
    /// is gone.
    pub fn complete(&self, invocation_id: InvocationId, result: Result<(), ChatError>) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.held.iter().position(|(_, id, _)| *id == invocation_id) else {
            return false;
        };
        let (connection, _, room_id) = state.held.remove(pos);

        if result.is_ok() {
            state.enter(connection, room_id);
        }

        let conn = &state.connections[connection];
        conn.alive
            && conn.events.try_send(HubEvent::Completion { invocation_id, result }).is_ok()
    }

    /// Push `ReceiveMessage` on the newest live connection.
    pub fn push_message(&self, message: InboundMessage) -> bool {
        let state = self.lock();
        let Some(i) = state.latest_alive() else {
            return false;
        };
        state.connections[i].events.try_send(HubEvent::Message(message)).is_ok()
    }

    /// Close the newest live connection from the hub side.
    pub fn drop_connection(&self, error: Option<ChatError>) -> bool {
        let mut state = self.lock();
        let Some(i) = state.latest_alive() else {
            return false;
        };
        let conn = &mut state.connections[i];
        conn.alive = false;
        conn.rooms.clear();
        conn.events.try_send(HubEvent::Closed { error }).is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for SimHub {
    async fn connect(&self, credential: String) -> Result<HubConnection, ChatError> {
        let (outcome, delay) = {
            let mut state = self.lock();
            state.calls.push(HubCall::Connect { credential });
            (state.outcomes.pop_front().unwrap_or(ConnectOutcome::Accept), state.connect_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            ConnectOutcome::Accept => {},
            ConnectOutcome::Fail(error) => return Err(error),
            ConnectOutcome::Hang => std::future::pending::<()>().await,
        }

        let (to_hub_tx, to_hub_rx) = mpsc::unbounded_channel();
        let (from_hub_tx, from_hub_rx) = mpsc::channel(HUB_EVENT_BUFFER);

        let connection = {
            let mut state = self.lock();
            state.connections.push(SimConnection {
                events: from_hub_tx.clone(),
                alive: true,
                rooms: Vec::new(),
            });
            state.connections.len() - 1
        };

        let guard = AliveGuard { state: Arc::clone(&self.state), connection };
        let task = tokio::spawn(serve(guard, to_hub_rx, from_hub_tx));

        Ok(HubConnection::new(to_hub_tx, from_hub_rx, Some(task.abort_handle())))
    }
}

async fn serve(
    guard: AliveGuard,
    mut requests: mpsc::UnboundedReceiver<HubRequest>,
    events: mpsc::Sender<HubEvent>,
) {
    while let Some(request) = requests.recv().await {
        let reply = {
            let mut state = guard.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.connections[guard.connection].alive {
                break;
            }
            state.handle_request(guard.connection, request)
        };

        if let Some(event) = reply {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }
}
