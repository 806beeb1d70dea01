//! IPC channel abstraction

use crate::endpoint::ReceiveCallback;
use crate::handshake::ConnectionState;
use crate::name::Role;
use nix::errno::Errno;
use std::time::Duration;
use thiserror::Error;

/// IPC error type
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to create queue {name}: {source}")]
    QueueCreateFailed { name: String, source: Errno },
    #[error("Failed to open queue {name}: {source}")]
    QueueOpenFailed { name: String, source: Errno },
    #[error("Peer queue {0} does not exist")]
    PeerNotFound(String),
    #[error("Handshake with {peer} timed out after {timeout:?}")]
    HandshakeTimeout { peer: String, timeout: Duration },
    #[error("Handshake response mismatch: expected {expected:?}, got {received:?}")]
    ProtocolMismatch { expected: String, received: String },
    #[error("Send failed: {0}")]
    SendFailed(#[source] Errno),
    #[error("Receive failed: {0}")]
    ReceiveFailed(#[source] Errno),
    #[error("Channel closed")]
    Closed,
    #[error("Timeout")]
    Timeout,
    #[error("Invalid queue name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("Cannot {operation} on a {role} endpoint")]
    WrongRole { operation: &'static str, role: Role },
    #[error("Message too large: {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-oriented IPC channel.
///
/// This is the operation set every transport backend exposes. Construction
/// (`init`) is backend specific and therefore not part of the trait.
pub trait IpcChannel: Send + Sync {
    /// Wait for a peer to connect (server side)
    fn accept(&self) -> Result<(), IpcError>;

    /// Connect to the peer listening on `peer` (client side)
    fn connect(&self, peer: &str) -> Result<(), IpcError>;

    /// Send a message, returning the number of bytes sent
    fn send(&self, data: &[u8]) -> Result<usize, IpcError>;

    /// Receive one message into `buf`, returning its length
    fn recv(&self, buf: &mut [u8]) -> Result<usize, IpcError>;

    /// Install the callback invoked for every inbound message
    fn register_receive_callback(&self, callback: ReceiveCallback) -> Result<(), IpcError>;

    /// Tear down the channel. Safe to call more than once.
    fn close(&self);
}
