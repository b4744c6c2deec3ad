//! Connection handle definition
//!
//! A `ConnectionHandle` is the sending side of one accepted socket. Lines are
//! queued on a bounded channel and written by a dedicated writer task, so a
//! write to one peer never blocks the session that issued it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tracing::debug;

use crate::codec::ChatCodec;
use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::ClientId;

/// Default capacity of a connection's outbound queue
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Default time a closing connection gets to flush its queue
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Handle to one live connection
///
/// Cheap to clone; clones share the same queue and liveness flag, which is
/// what lets the registry hand out snapshots by value.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Unique identifier for this connection
    id: ClientId,
    /// Server → Client line queue
    sender: mpsc::Sender<ServerMessage>,
    /// Set to true once the connection is closed
    closed: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Create a handle and spawn the writer task that drains it into `writer`.
    ///
    /// The returned `JoinHandle` completes once the queue is flushed and the
    /// write half has been shut down.
    pub fn spawn<W>(writer: W, codec: ChatCodec, buffer: usize) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            id: ClientId::new(),
            sender,
            closed: Arc::new(closed),
        };
        let task = tokio::spawn(write_loop(
            handle.id,
            FramedWrite::new(writer, codec),
            receiver,
            handle.closed.clone(),
        ));
        (handle, task)
    }

    /// Unique id of this connection
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue one line for this connection
    ///
    /// Never waits: fails with `Closed` if the connection is gone and with
    /// `Backlogged` if the peer is not keeping up with its queue.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the connection. Lines already queued are still flushed.
    ///
    /// Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Check whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.sender.is_closed()
    }

    /// Close the connection and wait for `writer` to flush, at most `grace`
    ///
    /// A writer still blocked on a peer that stopped reading after `grace` is
    /// aborted, which drops the write half.
    pub async fn finish(&self, mut writer: JoinHandle<()>, grace: Duration) {
        self.close();
        match timeout(grace, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Write task for {} failed: {}", self.id, e),
            Err(_) => {
                debug!("Write task for {} stalled, aborting", self.id);
                writer.abort();
            }
        }
    }

    /// Wait until the connection is closed, locally or after a write failure
    pub async fn closed(&self) {
        // The sender lives in `self`, so this only returns once the flag is set.
        wait_closed(&mut self.closed.subscribe()).await;
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn write_loop<W>(
    id: ClientId,
    mut sink: FramedWrite<W, ChatCodec>,
    mut receiver: mpsc::Receiver<ServerMessage>,
    closed: Arc<watch::Sender<bool>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed_rx = closed.subscribe();

    loop {
        tokio::select! {
            // Drain queued lines before honouring a close request.
            biased;
            msg = receiver.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    debug!("Write to {} failed: {}", id, e);
                    break;
                }
            }
            _ = wait_closed(&mut closed_rx) => break,
        }
    }

    // Refuse further sends, then flush and shut down the write half.
    closed.send_replace(true);
    receiver.close();
    if let Err(e) = sink.close().await {
        debug!("Shutdown of {} failed: {}", id, e);
    }
    debug!("Write task ended for {}", id);
}
