//! Device line protocol: `COMMAND|arg1|arg2|...`, one command per line.

use thiserror::Error;

/// Probe sent to a device whose connection has been write-idle.
pub const PING: &str = "PING";
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";
pub const DATA_RECEIVED: &str = "DATA_RECEIVED";

const DELIMITER: char = '|';
const FULLWIDTH_DELIMITER: char = '\u{FF5C}';

/// A parsed device command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Register {
        id: String,
        name: String,
        kind: String,
    },
    /// The argument is carried for logging only; the session's own id is
    /// the one touched.
    Heartbeat { id: String },
    /// Everything after the command, re-joined with `|`.
    Data { payload: String },
    Pong { id: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::Data { .. } => "DATA",
            Self::Pong { .. } => "PONG",
        }
    }
}

/// A line the session answers with an error reply. `Display` is the reply.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad format")]
    BadFormat,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("bad register format, expected REGISTER|id|name|type")]
    BadRegister,
    #[error("must register first")]
    NotRegistered,
    #[error("device id mismatch")]
    IdMismatch,
}

/// Reply to a successful `REGISTER`.
pub fn registered_reply(id: &str) -> String {
    format!("registered, id={id}")
}

/// Split a line into trimmed tokens.
///
/// Full-width pipes count as delimiters. Trailing empty tokens are dropped,
/// so `DATA|` yields a single token.
pub fn tokenize(line: &str) -> Vec<String> {
    let normalized = line.trim().replace(FULLWIDTH_DELIMITER, "|");
    let mut tokens: Vec<String> = normalized
        .split(DELIMITER)
        .map(|t| t.trim().to_string())
        .collect();
    while tokens.last().is_some_and(String::is_empty) {
        let _ = tokens.pop();
    }
    tokens
}

/// Parse one line into a [`Command`].
pub fn parse_line(line: &str) -> Result<Command, ProtocolError> {
    let tokens = tokenize(line);
    let Some((command, args)) = tokens.split_first() else {
        return Err(ProtocolError::BadFormat);
    };
    if args.is_empty() {
        return Err(ProtocolError::BadFormat);
    }

    match command.as_str() {
        "REGISTER" => match args {
            [id, name, kind] if !id.is_empty() => Ok(Command::Register {
                id: id.clone(),
                name: name.clone(),
                kind: kind.clone(),
            }),
            _ => Err(ProtocolError::BadRegister),
        },
        "HEARTBEAT" => Ok(Command::Heartbeat {
            id: args[0].clone(),
        }),
        "DATA" => Ok(Command::Data {
            payload: args.join("|"),
        }),
        "PONG" => Ok(Command::Pong {
            id: args[0].clone(),
        }),
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}
