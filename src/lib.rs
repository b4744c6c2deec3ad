//! Line-delimited JSON Chat Relay Library
//!
//! A TCP chat relay: each connection claims a username, then exchanges one
//! JSON object per line with the server.
//!
//! # Features
//! - Username claiming with first-come uniqueness
//! - Broadcast chat to every other member
//! - Whispers to one member, echoed to the sender
//! - Join / leave notices and sorted presence lists
//! - Server-assigned sender identity and timestamps
//!
//! # Architecture
//! - `ChatServer` accepts connections and spawns one session task each
//! - Sessions share a single `Registry` (username → `ConnectionHandle`)
//! - Routing is pure (`router`); sessions snapshot the registry, route, then
//!   queue lines on each recipient's handle without holding the registry lock
//! - Each handle owns a writer task, so a slow peer never blocks a sender
//!
//! # Example
//! ```ignore
//! use chat_relay::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::bind(ServerConfig::default()).await.unwrap();
//!     server.run().await;
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use codec::{ChatCodec, Frame};
pub use config::{Args, ServerConfig, DEFAULT_PORT};
pub use connection::ConnectionHandle;
pub use error::{AppError, CodecError, SendError};
pub use handler::handle_connection;
pub use message::{ClientMessage, ServerMessage};
pub use registry::{Registry, Snapshot};
pub use router::{route, Delivery, Recipients};
pub use server::ChatServer;
pub use types::ClientId;
