//! Text-command endpoint between the operator GUI and the coordinator.
//!
//! The wire format is one LF-terminated UTF-8 line per message. Requests
//! arrive on the command pipe, the verdict goes out on the response pipe,
//! and dispatch in between is serialized through a capacity-1 channel.

use std::fmt;
use std::str::FromStr;

use tokio::sync::{mpsc, oneshot};

#[cfg(windows)]
#[path = "ipc/windows.rs"]
pub mod platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enter,
    Exit,
    Status,
    Refresh,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown command `{0}`")]
pub struct UnknownCommand(String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENTER" => Ok(Command::Enter),
            "EXIT" => Ok(Command::Exit),
            "STATUS" => Ok(Command::Status),
            "REFRESH" => Ok(Command::Refresh),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Enter => "ENTER",
            Command::Exit => "EXIT",
            Command::Status => "STATUS",
            Command::Refresh => "REFRESH",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reply::Ok => "OK",
            Reply::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Sender half of the capacity-1 dispatch queue into the coordinator.
pub type Dispatch = mpsc::Sender<(Command, oneshot::Sender<Reply>)>;

/// Hands one command to the coordinator and waits for the verdict. A gone
/// coordinator answers `ERROR`; the endpoint must keep serving regardless.
pub async fn dispatch(dispatch: &Dispatch, command: Command) -> Reply {
    let (reply_tx, reply_rx) = oneshot::channel();
    if dispatch.send((command, reply_tx)).await.is_err() {
        return Reply::Error;
    }

    reply_rx.await.unwrap_or(Reply::Error)
}
