//! Interactive commands typed on stdin.

use mentorlink_client::RoomId;

use crate::error::CliError;

/// One parsed input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// `/join <room>`: make a room active and wait for the join.
    Join(RoomId),
    /// `/leave`: clear the active room.
    Leave,
    /// `/open`: connect with the configured token.
    Open,
    /// `/close`: disconnect.
    Close,
    /// `/status`: log the connection state.
    Status,
    /// `/quit`: shut down and exit.
    Quit,
}

/// Parse a line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Input>, CliError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let argument = words.next();

    if words.next().is_some() {
        return Err(CliError::InvalidCommand(format!("too many arguments: {line}")));
    }

    let input = match (command, argument) {
        ("/join" | "/j", Some(room)) => {
            let room = room
                .parse()
                .map_err(|_| CliError::InvalidCommand(format!("not a room id: {room}")))?;
            Input::Join(room)
        },
        ("/join" | "/j", None) => {
            return Err(CliError::InvalidCommand("usage: /join <room>".to_string()));
        },
        ("/leave", None) => Input::Leave,
        ("/open", None) => Input::Open,
        ("/close", None) => Input::Close,
        ("/status", None) => Input::Status,
        ("/quit" | "/q", None) => Input::Quit,
        _ => {
            return Err(CliError::InvalidCommand(format!(
                "unknown command {line:?} (try /join, /leave, /open, /close, /status, /quit)"
            )));
        },
    };

    Ok(Some(input))
}
