//! Error types for the chat relay
//!
//! Defines session-level errors, line codec errors and delivery errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Session-level errors
///
/// Covers both fatal transport errors and handshake rejections
/// (which are reported to the offending connection before it is closed).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error on the inbound stream (fatal)
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// First line was not a join request carrying a usable username
    #[error("Invalid join request: {0}")]
    InvalidJoin(String),

    /// Username is already claimed by another connection
    #[error("Username already in use: {0}")]
    NameTaken(String),

    /// Connection ceiling reached
    #[error("Server is full")]
    ServerFull,

    /// Peer closed the connection before completing the handshake
    #[error("Connection closed during handshake")]
    ClosedDuringHandshake,
}

/// Line codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// IO error on the underlying stream
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Outbound message could not be serialized
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Message send errors
///
/// Occurs when a line cannot be queued for a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The connection is closed (peer gone or handle closed)
    #[error("Connection closed")]
    Closed,

    /// The connection's outbound queue is full
    #[error("Outbound queue full")]
    Backlogged,
}
