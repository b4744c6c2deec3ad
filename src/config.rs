//! Server configuration
//!
//! Built from command-line flags; every field has a default so the server
//! starts with no arguments at all.

use std::time::Duration;

use clap::Parser;

use crate::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::connection::{DEFAULT_CLOSE_GRACE, DEFAULT_OUTBOUND_BUFFER};

/// Default listen port
pub const DEFAULT_PORT: u16 = 8888;

/// Default listen host (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Runtime settings for the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind, `host:port`
    pub addr: String,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Longest accepted inbound line in bytes
    pub max_line_length: usize,
    /// Optional ceiling on concurrent sessions (None = unlimited)
    pub max_connections: Option<usize>,
    /// Time a closing connection gets to flush before it is dropped
    pub close_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_connections: None,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "chat_relay")]
#[command(about = "Line-delimited JSON chat relay over TCP", long_about = None)]
pub struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Lines queued per connection before deliveries to it are dropped
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,

    /// Longest accepted inbound line in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Refuse connections beyond this many concurrent sessions
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Milliseconds a closing connection gets to flush its queue
    #[arg(long, default_value_t = DEFAULT_CLOSE_GRACE.as_millis() as u64)]
    pub close_grace_ms: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            addr: format!("{}:{}", args.host, args.port),
            outbound_buffer: args.outbound_buffer,
            max_line_length: args.max_line_length,
            max_connections: args.max_connections,
            close_grace: Duration::from_millis(args.close_grace_ms),
        }
    }
}
