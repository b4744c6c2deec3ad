//! ChatServer listener
//!
//! Accepts connections forever and spawns one session task per connection.
//! The registry is the only state the sessions share.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::codec::ChatCodec;
use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::message::ServerMessage;
use crate::registry::Registry;

/// The chat relay server
pub struct ChatServer {
    listener: TcpListener,
    registry: Registry,
    config: Arc<ServerConfig>,
    /// Present only when a connection ceiling is configured
    slots: Option<Arc<Semaphore>>,
}

impl ChatServer {
    /// Bind the listen address from `config`
    pub async fn bind(config: ServerConfig) -> Result<Self, AppError> {
        let listener = TcpListener::bind(&config.addr).await?;
        let slots = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Ok(Self {
            listener,
            registry: Registry::new(),
            config: Arc::new(config),
            slots,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared registry of this server
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Run the accept loop
    ///
    /// Never returns in normal operation; accept errors are logged and the
    /// loop continues.
    pub async fn run(self) {
        info!("Chat relay listening on {}", self.config.addr);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => self.spawn_session(stream, addr),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        info!("New connection from {}", addr);

        let permit = match &self.slots {
            None => None,
            Some(slots) => match slots.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("Refusing {}: connection limit reached", addr);
                    tokio::spawn(refuse(stream, Arc::clone(&self.config)));
                    return;
                }
            },
        };

        let registry = self.registry.clone();
        let config = Arc::clone(&self.config);

        // Spawn handler task for each connection
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry, &config).await {
                warn!("Session from {} ended: {}", addr, e);
            }
            debug!("Connection from {} released", addr);
            drop(permit);
        });
    }
}

/// Tell a connection over the ceiling why it is being dropped
async fn refuse(stream: TcpStream, config: Arc<ServerConfig>) {
    let (_read_half, write_half) = stream.into_split();
    let codec = ChatCodec::new(config.max_line_length);
    let (handle, writer) = ConnectionHandle::spawn(write_half, codec, 1);
    let _ = handle.send(ServerMessage::from(&AppError::ServerFull));
    handle.finish(writer, config.close_grace).await;
}
