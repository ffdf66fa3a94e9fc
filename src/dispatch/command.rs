//! Out-of-band control commands.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Commands accepted on the command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Kill every worker and begin a staged shutdown.
    Stop,
}

/// A token on the command queue that names no known command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command token {token:?}")]
pub struct UnknownCommand {
    /// The rejected token.
    pub token: String,
}

impl Command {
    /// Wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
        }
    }

    /// Decode a raw command payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UnknownCommand> {
        String::from_utf8_lossy(bytes).parse()
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stop" => Ok(Self::Stop),
            other => Err(UnknownCommand {
                token: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
