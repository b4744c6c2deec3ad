//! Session handler
//!
//! Drives one accepted connection through its lifecycle:
//! `AwaitingJoin → Active → Closed`.
//!
//! - `AwaitingJoin`: the first line must be a join carrying a free, valid
//!   username. Anything else is reported to the caller and the connection is
//!   dropped without touching the registry.
//! - `Active`: every inbound line is stamped with the session's username and
//!   the server time, routed against a registry snapshot, and queued on each
//!   recipient's handle. Malformed lines are logged and skipped.
//! - `Closed`: the username is unregistered, the remaining members get a
//!   leave notice and a fresh presence list, and the connection is released.

use chrono::Utc;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::codec::{ChatCodec, Frame};
use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::error::{AppError, CodecError};
use crate::message::{ClientMessage, ServerMessage};
use crate::registry::{Registry, Snapshot};
use crate::router::{self, Delivery, Recipients};
use crate::types::is_valid_username;

/// Handle a new TCP connection
///
/// Returns once the session is closed and its outbound queue is flushed, or
/// abandoned after `config.close_grace` if the peer stopped reading.
/// Handshake rejections are returned as errors after the rejection notice has
/// been delivered.
pub async fn handle_connection(
    stream: TcpStream,
    registry: Registry,
    config: &ServerConfig,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let (read_half, write_half) = stream.into_split();
    let frames = FramedRead::new(read_half, ChatCodec::new(config.max_line_length));
    let (handle, writer) = ConnectionHandle::spawn(
        write_half,
        ChatCodec::new(config.max_line_length),
        config.outbound_buffer,
    );

    debug!("Connection {} from {}", handle.id(), peer_addr);

    let result = run_session(frames, &handle, &registry).await;

    // Release the connection on every exit path.
    handle.finish(writer, config.close_grace).await;

    result
}

/// Run the session state machine over an already-split connection
pub async fn run_session<R>(
    mut frames: FramedRead<R, ChatCodec>,
    handle: &ConnectionHandle,
    registry: &Registry,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    let name = match await_join(&mut frames, handle, registry).await {
        Ok(name) => name,
        Err(e) => {
            warn!("Handshake failed for {}: {}", handle.id(), e);
            if !matches!(e, AppError::ClosedDuringHandshake | AppError::Codec(_)) {
                let _ = handle.send(ServerMessage::from(&e));
            }
            return Err(e);
        }
    };

    info!("Client {} joined as '{}'", handle.id(), name);
    let now = Utc::now();
    broadcast(registry, ServerMessage::joined(&name, now), Recipients::AllExcept(&name));
    broadcast_presence(registry);

    let result = active(&mut frames, handle, registry, &name).await;

    registry.unregister(&name);
    info!("Client '{}' ({}) left", name, handle.id());
    broadcast(registry, ServerMessage::left(&name, Utc::now()), Recipients::All);
    broadcast_presence(registry);

    result
}

/// Read the join line and claim the username
async fn await_join<R>(
    frames: &mut FramedRead<R, ChatCodec>,
    handle: &ConnectionHandle,
    registry: &Registry,
) -> Result<String, AppError>
where
    R: AsyncRead + Unpin,
{
    let frame = frames
        .next()
        .await
        .ok_or(AppError::ClosedDuringHandshake)??;

    let name = match frame {
        Frame::Message(ClientMessage::Join { from }) => from,
        Frame::Message(other) => {
            return Err(AppError::InvalidJoin(format!(
                "expected join, got {:?}",
                other
            )));
        }
        Frame::Malformed { reason, .. } => return Err(AppError::InvalidJoin(reason)),
    };

    if !is_valid_username(&name) {
        return Err(AppError::InvalidJoin(
            "username is blank or contains control characters".to_string(),
        ));
    }

    if !registry.register(&name, handle.clone()) {
        return Err(AppError::NameTaken(name));
    }

    Ok(name)
}

/// Relay messages until the peer goes away or the connection is closed
async fn active<R>(
    frames: &mut FramedRead<R, ChatCodec>,
    handle: &ConnectionHandle,
    registry: &Registry,
    name: &str,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = handle.closed() => {
                debug!("Connection for '{}' closed by writer", name);
                return Ok(());
            }
        };

        match frame {
            None => {
                debug!("Client '{}' closed the stream", name);
                return Ok(());
            }
            Some(Err(CodecError::Io(e))) => {
                debug!("Read from '{}' failed: {}", name, e);
                return Ok(());
            }
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Frame::Malformed { line, reason })) => {
                warn!("Dropping malformed line from '{}': {} ({:?})", name, reason, line);
            }
            Some(Ok(Frame::Message(ClientMessage::Join { .. }))) => {
                warn!("Ignoring repeated join from '{}'", name);
            }
            Some(Ok(Frame::Message(msg))) => {
                let snapshot = registry.snapshot();
                let deliveries = router::route(&msg, name, Utc::now(), snapshot.names());
                let delivered = deliver(&snapshot, deliveries);
                debug!("Routed message from '{}' to {} recipient(s)", name, delivered);
            }
        }
    }
}

/// Queue each delivery on its recipient's handle
///
/// A failed send skips that recipient; the recipient's own session is
/// responsible for noticing its dead connection. Returns the number of
/// successful deliveries.
pub fn deliver(snapshot: &Snapshot, deliveries: Vec<Delivery>) -> usize {
    let mut delivered = 0;
    for Delivery { recipient, message } in deliveries {
        let Some(handle) = snapshot.get(&recipient) else {
            continue;
        };
        match handle.send(message) {
            Ok(()) => delivered += 1,
            Err(e) => debug!("Skipping delivery to '{}': {}", recipient, e),
        }
    }
    delivered
}

/// Send a server-generated message to the selected members
pub fn broadcast(registry: &Registry, message: ServerMessage, recipients: Recipients<'_>) -> usize {
    let snapshot = registry.snapshot();
    let deliveries = router::fan_out(message, snapshot.names(), recipients);
    deliver(&snapshot, deliveries)
}

/// Send the current presence list to every member
pub fn broadcast_presence(registry: &Registry) -> usize {
    let snapshot = registry.snapshot();
    let list = router::presence_list(snapshot.names(), Utc::now());
    debug!("Broadcasting presence list to {} member(s)", snapshot.len());
    let deliveries = router::fan_out(list, snapshot.names(), Recipients::All);
    deliver(&snapshot, deliveries)
}
