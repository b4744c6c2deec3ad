//! Message protocol definitions
//!
//! Line-delimited JSON protocol using Serde's internally tagged enums.
//! Every object carries a `kind` field with a kebab-case value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Client → Server message
///
/// Fields a client adds beyond these (a forged `from` or `timestamp` on a
/// chat line, for instance) are ignored during deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Claim a username (must be the first line of a session)
    Join { from: String },
    /// Broadcast to every other member
    Chat { body: String },
    /// Direct message to one member, echoed to the sender
    Whisper { to: String, body: String },
}

/// Server → Client message
///
/// `from` and `timestamp` are always assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Chat message relayed from a member
    Chat {
        from: String,
        body: String,
        timestamp: DateTime<Utc>,
    },
    /// Whisper relayed to its target and echoed to its sender
    Whisper {
        from: String,
        to: String,
        body: String,
        timestamp: DateTime<Utc>,
    },
    /// Join / leave notices
    System {
        body: String,
        timestamp: DateTime<Utc>,
    },
    /// Error addressed to a single connection
    Error {
        body: String,
        timestamp: DateTime<Utc>,
    },
    /// Sorted list of registered usernames
    PresenceList {
        names: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    /// Notice broadcast when `name` joins
    pub fn joined(name: &str, timestamp: DateTime<Utc>) -> Self {
        ServerMessage::System {
            body: format!("'{}' has joined the chat.", name),
            timestamp,
        }
    }

    /// Notice broadcast when `name` leaves
    pub fn left(name: &str, timestamp: DateTime<Utc>) -> Self {
        ServerMessage::System {
            body: format!("'{}' has left the chat.", name),
            timestamp,
        }
    }

    /// Error sent to the sender of a whisper whose target is not online
    pub fn unknown_recipient(name: &str, timestamp: DateTime<Utc>) -> Self {
        ServerMessage::Error {
            body: format!("User '{}' is not online.", name),
            timestamp,
        }
    }

    /// Wire name of this message's kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::Whisper { .. } => "whisper",
            ServerMessage::System { .. } => "system",
            ServerMessage::Error { .. } => "error",
            ServerMessage::PresenceList { .. } => "presence-list",
        }
    }
}

/// Convert a handshake rejection into the notice sent to the rejected connection
impl From<&AppError> for ServerMessage {
    fn from(err: &AppError) -> Self {
        let body = match err {
            AppError::NameTaken(_) => "Username is already taken.".to_string(),
            AppError::InvalidJoin(reason) => format!("Invalid join request: {}", reason),
            AppError::ServerFull => "Server is full.".to_string(),
            // Transport errors are not typically reported (connection is gone)
            _ => "Internal error".to_string(),
        };
        ServerMessage::Error {
            body,
            timestamp: Utc::now(),
        }
    }
}
