//! Mentorlink command-line client.
//!
//! Connects to the chat hub, follows one conversation, and logs connection
//! state, room notices and history invalidations.
//!
//! # Usage
//!
//! ```bash
//! # Follow room 42
//! MENTORLINK_TOKEN=... mentorlink --hub https://api.example.com/chatHub --room 42
//!
//! # Explicit leave calls and a custom reconnect schedule
//! mentorlink --hub wss://hub.local/chatHub --leave-policy explicit --backoff-ms 0,1000,5000
//! ```
//!
//! Commands on stdin: `/join <room>`, `/leave`, `/open`, `/close`, `/status`,
//! `/quit`.

mod command;
mod error;

use std::{sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use mentorlink_client::{
    ChatHandle, ChatRuntime, CredentialSource, InvalidationChannel, LeavePolicy, ManagerConfig,
    RoomId, RoomNotice, RuntimeConfig, StaticCredential, SystemEnv, TieredBackoff,
    websocket::{ConnectorConfig, WebSocketConnector},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    command::{Input, parse},
    error::CliError,
};

/// Mentorlink chat client
#[derive(Parser, Debug)]
#[command(name = "mentorlink")]
#[command(about = "Real-time mentorship chat connection client")]
#[command(version)]
struct Args {
    /// Hub endpoint (http(s) or ws(s))
    #[arg(long, env = "MENTORLINK_HUB")]
    hub: String,

    /// Bearer token
    #[arg(long, env = "MENTORLINK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Conversation to follow on startup
    #[arg(long)]
    room: Option<RoomId>,

    /// How switching rooms is sent to the hub
    #[arg(long, value_enum, default_value_t = LeavePolicyArg::Implicit)]
    leave_policy: LeavePolicyArg,

    /// Reconnect delays in milliseconds, comma separated
    #[arg(long, value_delimiter = ',')]
    backoff_ms: Vec<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LeavePolicyArg {
    /// Joining a room supersedes the previous one
    Implicit,
    /// Leave the previous room before joining
    Explicit,
}

impl From<LeavePolicyArg> for LeavePolicy {
    fn from(arg: LeavePolicyArg) -> Self {
        match arg {
            LeavePolicyArg::Implicit => Self::Implicit,
            LeavePolicyArg::Explicit => Self::Explicit,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let backoff = if args.backoff_ms.is_empty() {
        TieredBackoff::default()
    } else {
        TieredBackoff::new(args.backoff_ms.iter().copied().map(Duration::from_millis).collect())?
    };

    let config = RuntimeConfig {
        manager: ManagerConfig { leave_policy: args.leave_policy.into(), ..Default::default() },
        ..Default::default()
    };

    let credential = Arc::new(match args.token {
        Some(token) => StaticCredential::new(token),
        None => StaticCredential::signed_out(),
    });

    let (store, mut invalidations) = InvalidationChannel::new();
    let connector = WebSocketConnector::new(ConnectorConfig::new(&args.hub));

    tracing::info!(hub = %args.hub, backoff = ?backoff.tiers(), "mentorlink starting");

    let handle = ChatRuntime::spawn_with_backoff(
        connector,
        store,
        SystemEnv::new(),
        Box::new(backoff),
        config,
    );

    watch_state(&handle);
    watch_notices(&handle);
    tokio::spawn(async move {
        while let Some(room_id) = invalidations.recv().await {
            tracing::info!(room_id, "history changed, refetch");
        }
    });

    if let Some(room_id) = args.room {
        handle.set_active(Some(room_id));
    }
    spawn_open(&handle, &credential);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };

        let Some(line) = line else {
            break;
        };

        let input = match parse(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(error) => {
                tracing::warn!(%error, "ignoring input");
                continue;
            },
        };

        match input {
            Input::Join(room_id) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    match handle.join_room(room_id).await {
                        Ok(()) => tracing::info!(room_id, "now following room"),
                        Err(error) => tracing::warn!(room_id, %error, "join did not complete"),
                    }
                });
            },
            Input::Leave => handle.set_active(None),
            Input::Open => spawn_open(&handle, &credential),
            Input::Close => handle.close(),
            Input::Status => tracing::info!(state = %handle.state(), "status"),
            Input::Quit => break,
        }
    }

    tracing::info!("shutting down");
    handle.shutdown();
    handle.closed().await;

    Ok(())
}

fn spawn_open(handle: &ChatHandle, credential: &Arc<StaticCredential>) {
    if credential.credential().is_none() {
        tracing::warn!("no token configured; set --token or MENTORLINK_TOKEN");
        return;
    }

    let handle = handle.clone();
    let credential = Arc::clone(credential);
    tokio::spawn(async move {
        if let Err(error) = handle.open_with(&credential).await {
            tracing::error!(%error, "could not connect");
        }
    });
}

fn watch_state(handle: &ChatHandle) {
    let mut states = handle.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state.error() {
                Some(error) => tracing::warn!(%state, error, "connection state"),
                None => tracing::info!(%state, "connection state"),
            }
        }
    });
}

fn watch_notices(handle: &ChatHandle) {
    let mut notices = handle.notices();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(RoomNotice::Joined { room_id }) => tracing::info!(room_id, "joined room"),
                Ok(RoomNotice::Left { room_id }) => tracing::info!(room_id, "left room"),
                Ok(RoomNotice::JoinFailed { room_id, error, will_retry }) => {
                    tracing::warn!(room_id, %error, will_retry, "join failed");
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "room notices lagged");
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
