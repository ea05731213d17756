//! WebSocket transport for the chat hub.
//!
//! Provides [`WebSocketConnector`], which opens a WebSocket to the hub,
//! performs the JSON protocol handshake, and hands back a [`HubConnection`].
//! This is a thin layer that just frames requests and events; connection
//! policy remains in the sans-IO manager.

pub mod protocol;

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use mentorlink_core::{ChatError, InvocationId};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, MissedTickBehavior, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, http::StatusCode},
};

use self::protocol::ServerFrame;
use crate::{Connector, HUB_EVENT_BUFFER, HubConnection, HubEvent, HubRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default time allowed for the socket to open and the handshake to finish.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default interval between client keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default silence from the hub after which the connection is considered dead.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket connector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Hub endpoint (`http(s)://` or `ws(s)://`).
    pub hub_url: String,
    /// Bound on socket open plus handshake.
    pub connect_timeout: Duration,
    /// Keepalive ping interval.
    pub keepalive_interval: Duration,
    /// Maximum silence from the hub.
    pub server_timeout: Duration,
    /// Hub method joining a room.
    pub join_method: String,
    /// Hub method leaving a room.
    pub leave_method: String,
    /// Client method the hub invokes for new messages.
    pub message_target: String,
}

impl ConnectorConfig {
    /// Defaults for the hub at `hub_url`.
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            join_method: "JoinChat".to_string(),
            leave_method: "LeaveChat".to_string(),
            message_target: "ReceiveMessage".to_string(),
        }
    }
}

/// Connects to the hub over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: Arc<ConnectorConfig>,
}

impl WebSocketConnector {
    /// Create a connector.
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config: Arc::new(config) }
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self, credential: String) -> Result<HubConnection, ChatError> {
        let config = Arc::clone(&self.config);
        let url = protocol::hub_url(&config.hub_url, &credential)?;

        tracing::debug!(host = url.host_str().unwrap_or_default(), "opening hub socket");

        let opening = async {
            let (mut ws, _response) =
                connect_async(url.as_str()).await.map_err(map_connect_error)?;
            let leftover = handshake(&mut ws).await?;
            Ok::<_, ChatError>((ws, leftover))
        };

        let (ws, leftover) = timeout(config.connect_timeout, opening)
            .await
            .map_err(|_| ChatError::Timeout { elapsed: config.connect_timeout })??;

        let (to_hub_tx, to_hub_rx) = mpsc::unbounded_channel();
        let (from_hub_tx, from_hub_rx) = mpsc::channel(HUB_EVENT_BUFFER);

        let handle = tokio::spawn(run_connection(ws, config, to_hub_rx, from_hub_tx, leftover));

        Ok(HubConnection::new(to_hub_tx, from_hub_rx, Some(handle.abort_handle())))
    }
}

/// Send the protocol handshake and wait for the reply.
///
/// Returns records that arrived in the same frame as the reply.
async fn handshake(ws: &mut WsStream) -> Result<Vec<String>, ChatError> {
    ws.send(Message::text(protocol::handshake_request())).await.map_err(map_socket_error)?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let mut records = protocol::split_records(text.as_str());
                let Some(reply) = records.next() else {
                    continue;
                };
                protocol::parse_handshake_response(reply)?;
                return Ok(records.map(str::to_string).collect());
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                return Err(ChatError::Closed(format!("closed during handshake: {reason}")));
            },
            Some(Ok(_)) => {},
            Some(Err(e)) => return Err(map_socket_error(e)),
            None => return Err(ChatError::Closed("closed during handshake".to_string())),
        }
    }
}

/// Run the connection, bridging between channels and the socket.
async fn run_connection(
    ws: WsStream,
    config: Arc<ConnectorConfig>,
    mut to_hub: mpsc::UnboundedReceiver<HubRequest>,
    from_hub: mpsc::Sender<HubEvent>,
    leftover: Vec<String>,
) {
    let (mut write, mut read) = ws.split();
    let mut pending: HashMap<InvocationId, String> = HashMap::new();
    let mut last_seen = Instant::now();

    let mut keepalive = tokio::time::interval_at(
        Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for record in &leftover {
        if let Err(error) = dispatch(record, &config, &mut pending, &from_hub).await {
            let _ = from_hub.send(HubEvent::Closed { error: Some(error) }).await;
            return;
        }
    }

    let error = loop {
        tokio::select! {
            request = to_hub.recv() => {
                let Some(request) = request else {
                    // Runtime dropped the connection.
                    let _ = write.send(Message::text(protocol::encode_close())).await;
                    let _ = write.close().await;
                    return;
                };

                let (invocation_id, target, room_id) = match request {
                    HubRequest::Join { invocation_id, room_id } => {
                        (invocation_id, &config.join_method, room_id)
                    },
                    HubRequest::Leave { invocation_id, room_id } => {
                        (invocation_id, &config.leave_method, room_id)
                    },
                };

                let frame = match protocol::encode_invocation(invocation_id, target, room_id) {
                    Ok(frame) => frame,
                    Err(error) => break Some(error),
                };

                tracing::debug!(invocation_id, %target, room_id, "invoking hub method");
                pending.insert(invocation_id, target.clone());

                if let Err(e) = write.send(Message::text(frame)).await {
                    break Some(map_socket_error(e));
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    let mut failed = None;
                    for record in protocol::split_records(text.as_str()) {
                        if let Err(error) = dispatch(record, &config, &mut pending, &from_hub).await {
                            failed = Some(error);
                            break;
                        }
                    }
                    if failed.is_some() {
                        break failed;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map_or_else(
                        || "hub closed the socket".to_string(),
                        |f| format!("hub closed the socket: {} {}", f.code, f.reason.as_str()),
                    );
                    break Some(ChatError::Closed(reason));
                },
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => break Some(map_socket_error(e)),
                None => break Some(ChatError::Closed("socket stream ended".to_string())),
            },
            _ = keepalive.tick() => {
                let silent = last_seen.elapsed();
                if silent >= config.server_timeout {
                    tracing::warn!(?silent, "hub stopped responding");
                    break Some(ChatError::Timeout { elapsed: silent });
                }

                if let Err(e) = write.send(Message::text(protocol::encode_ping())).await {
                    break Some(map_socket_error(e));
                }
            },
        }
    };

    tracing::debug!(?error, "hub connection ended");
    let _ = from_hub.send(HubEvent::Closed { error }).await;
}

/// Handle one record from the hub.
///
/// Errors end the connection. A well-formed message push whose arguments do
/// not decode is logged and dropped instead.
async fn dispatch(
    record: &str,
    config: &ConnectorConfig,
    pending: &mut HashMap<InvocationId, String>,
    from_hub: &mpsc::Sender<HubEvent>,
) -> Result<(), ChatError> {
    let event = match protocol::parse_frame(record)? {
        ServerFrame::Invocation { target, arguments } => {
            if !target.eq_ignore_ascii_case(&config.message_target) {
                tracing::trace!(%target, "ignoring hub invocation");
                return Ok(());
            }
            match protocol::parse_message(&arguments) {
                Ok(message) => HubEvent::Message(message),
                Err(error) => {
                    tracing::warn!(%target, %error, "dropping undecodable hub message");
                    return Ok(());
                },
            }
        },
        ServerFrame::Completion { invocation_id, error } => {
            let target = pending.remove(&invocation_id).unwrap_or_default();
            let result = match error {
                Some(reason) => Err(ChatError::Invocation { target, reason }),
                None => Ok(()),
            };
            HubEvent::Completion { invocation_id, result }
        },
        ServerFrame::Close { error, allow_reconnect } => {
            let reason = error.unwrap_or_else(|| "hub requested close".to_string());
            return Err(match allow_reconnect {
                Some(false) => ChatError::Rejected(reason),
                Some(true) | None => ChatError::Closed(reason),
            });
        },
        ServerFrame::Ping | ServerFrame::Other(_) => return Ok(()),
    };

    from_hub.send(event).await.map_err(|_| ChatError::Stopped)
}

fn map_connect_error(error: tungstenite::Error) -> ChatError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ChatError::Unauthorized(format!("hub refused credential: {status}"))
            } else if status.is_client_error() {
                ChatError::Rejected(format!("hub refused upgrade: {status}"))
            } else {
                ChatError::Transport(format!("hub upgrade failed: {status}"))
            }
        },
        other => map_socket_error(other),
    }
}

fn map_socket_error(error: tungstenite::Error) -> ChatError {
    match error {
        tungstenite::Error::Io(e) => e.into(),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ChatError::Closed(error.to_string())
        },
        tungstenite::Error::Url(e) => ChatError::Protocol(e.to_string()),
        other => ChatError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::websocket::protocol::RECORD_SEPARATOR;

    type ServerStream = WebSocketStream<TcpStream>;

    fn record(json: &str) -> String {
        format!("{json}{RECORD_SEPARATOR}")
    }

    async fn dispatch_one(
        raw: &str,
        pending: &mut HashMap<InvocationId, String>,
    ) -> (Result<(), ChatError>, Option<HubEvent>) {
        let config = ConnectorConfig::new("ws://hub.test/chatHub");
        let (tx, mut rx) = mpsc::channel(8);
        let result = dispatch(raw, &config, pending, &tx).await;
        (result, rx.try_recv().ok())
    }

    #[tokio::test]
    async fn close_record_honours_reconnect_flag() {
        let mut pending = HashMap::new();

        let (result, _) =
            dispatch_one(r#"{"type":7,"error":"banned","allowReconnect":false}"#, &mut pending).await;
        assert_eq!(result, Err(ChatError::Rejected("banned".to_string())));

        let (result, _) =
            dispatch_one(r#"{"type":7,"error":"restarting","allowReconnect":true}"#, &mut pending)
                .await;
        assert_eq!(result, Err(ChatError::Closed("restarting".to_string())));

        let (result, _) = dispatch_one(r#"{"type":7}"#, &mut pending).await;
        assert!(matches!(result, Err(ChatError::Closed(_))));
    }

    #[tokio::test]
    async fn completion_error_names_pending_target() {
        let mut pending = HashMap::from([(4, "JoinChat".to_string())]);

        let (result, event) = dispatch_one(
            r#"{"type":3,"invocationId":"4","error":"not a participant"}"#,
            &mut pending,
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(
            event,
            Some(HubEvent::Completion {
                invocation_id: 4,
                result: Err(ChatError::Invocation {
                    target: "JoinChat".to_string(),
                    reason: "not a participant".to_string(),
                }),
            })
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn undecodable_message_is_dropped_without_ending_session() {
        let mut pending = HashMap::new();

        let (result, event) = dispatch_one(
            r#"{"type":1,"target":"ReceiveMessage","arguments":["u1",null,"2025-03-01T09:30:00Z"]}"#,
            &mut pending,
        )
        .await;
        assert_eq!(result, Ok(()));
        assert_eq!(event, None);

        let (result, event) = dispatch_one(
            r#"{"type":1,"target":"receivemessage","arguments":["u1","hello"]}"#,
            &mut pending,
        )
        .await;
        assert_eq!(result, Ok(()));
        assert!(matches!(event, Some(HubEvent::Message(m)) if m.text == "hello"));
    }

    #[tokio::test]
    async fn malformed_record_and_foreign_targets() {
        let mut pending = HashMap::new();

        let (result, _) = dispatch_one("{", &mut pending).await;
        assert!(matches!(result, Err(ChatError::Protocol(_))));

        let (result, event) =
            dispatch_one(r#"{"type":1,"target":"UserTyping","arguments":[1]}"#, &mut pending)
                .await;
        assert_eq!(result, Ok(()));
        assert_eq!(event, None);
    }

    fn loopback_config(addr: std::net::SocketAddr, keepalive: Duration) -> ConnectorConfig {
        ConnectorConfig {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: keepalive,
            server_timeout: keepalive * 4,
            ..ConnectorConfig::new(format!("http://{addr}/chatHub"))
        }
    }

    async fn next_text(ws: &mut ServerStream) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(_)) => {},
                other => panic!("client went away: {other:?}"),
            }
        }
    }

    /// Accept one client, check its handshake and answer with `reply`.
    async fn accept_hub(listener: &TcpListener, reply: String) -> ServerStream {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        assert!(next_text(&mut ws).await.contains(r#""protocol":"json""#));
        ws.send(Message::text(reply)).await.unwrap();
        ws
    }

    async fn connect_pair(
        keepalive: Duration,
        handshake_reply: String,
    ) -> (HubConnection, ServerStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = WebSocketConnector::new(loopback_config(addr, keepalive));

        let (connection, server) = tokio::join!(
            connector.connect("tok1".to_string()),
            accept_hub(&listener, handshake_reply)
        );
        (connection.unwrap(), server)
    }

    async fn next_event(connection: &mut HubConnection) -> HubEvent {
        timeout(Duration::from_secs(5), connection.from_hub.recv())
            .await
            .expect("no hub event in time")
            .expect("hub task ended")
    }

    #[tokio::test]
    async fn records_sharing_the_handshake_frame_are_dispatched() {
        let reply = format!(
            "{}{}",
            record("{}"),
            record(r#"{"type":1,"target":"ReceiveMessage","arguments":["u1","early"]}"#)
        );
        let (mut connection, _server) = connect_pair(Duration::from_secs(10), reply).await;

        assert!(matches!(
            next_event(&mut connection).await,
            HubEvent::Message(m) if m.text == "early"
        ));
    }

    #[tokio::test]
    async fn invocation_round_trip() {
        let (mut connection, mut server) =
            connect_pair(Duration::from_secs(10), record("{}")).await;

        connection.to_hub.send(HubRequest::Join { invocation_id: 1, room_id: 42 }).unwrap();

        let sent = next_text(&mut server).await;
        let value: serde_json::Value =
            serde_json::from_str(sent.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["target"], "JoinChat");
        assert_eq!(value["arguments"][0], 42);

        server
            .send(Message::text(record(r#"{"type":3,"invocationId":"1","error":"busy"}"#)))
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut connection).await,
            HubEvent::Completion {
                invocation_id: 1,
                result: Err(ChatError::Invocation { target, .. }),
            } if target == "JoinChat"
        ));
    }

    #[tokio::test]
    async fn silent_hub_gets_pinged_then_times_out() {
        let (mut connection, mut server) =
            connect_pair(Duration::from_millis(50), record("{}")).await;

        let ping = next_text(&mut server).await;
        assert!(ping.contains(r#""type":6"#));

        match next_event(&mut connection).await {
            HubEvent::Closed { error: Some(error @ ChatError::Timeout { .. }) } => {
                assert!(error.is_transient());
            },
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hub_close_without_reconnect_is_rejected() {
        let (mut connection, mut server) =
            connect_pair(Duration::from_secs(10), record("{}")).await;

        server
            .send(Message::text(record(
                r#"{"type":7,"error":"session revoked","allowReconnect":false}"#,
            )))
            .await
            .unwrap();

        assert_eq!(next_event(&mut connection).await, HubEvent::Closed {
            error: Some(ChatError::Rejected("session revoked".to_string())),
        });
    }

    #[tokio::test]
    async fn malformed_message_push_keeps_connection_open() {
        let (mut connection, mut server) =
            connect_pair(Duration::from_secs(10), record("{}")).await;

        let frame = format!(
            "{}{}",
            record(r#"{"type":1,"target":"ReceiveMessage","arguments":["u1",null]}"#),
            record(r#"{"type":1,"target":"ReceiveMessage","arguments":["u1","after"]}"#)
        );
        server.send(Message::text(frame)).await.unwrap();

        assert!(matches!(
            next_event(&mut connection).await,
            HubEvent::Message(m) if m.text == "after"
        ));
    }
}
