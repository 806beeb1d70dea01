//! mqlink IPC - Connection-oriented IPC over POSIX message queues
//!
//! POSIX message queues are connectionless: a named queue only supports
//! open, close, send and receive. This crate layers a point-to-point
//! connection on top of them:
//! - Each endpoint creates one queue it reads from
//! - A handshake tells each side the name of the queue to write to
//! - A per-endpoint dispatch thread delivers inbound messages to a callback
//!   or to a pull-style inbox
//!
//! # Example
//!
//! ```rust,ignore
//! use mqlink_ipc::{MqEndpoint, Role};
//!
//! // Server side
//! let server = MqEndpoint::init("/IPC_SERVER.5555", Role::Server)?;
//! server.accept()?;
//!
//! // Client side
//! let client = MqEndpoint::init("/IPC_CLIENT.4242", Role::Client)?;
//! client.connect("/IPC_SERVER.5555")?;
//! client.send(b"ping")?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod channel;
mod dispatcher;
pub mod endpoint;
pub mod gate;
pub mod handshake;
pub mod name;
pub mod queue;
pub mod transport;

pub use channel::{IpcChannel, IpcError};
pub use endpoint::{MqEndpoint, ReceiveCallback, Responder};
pub use gate::Gate;
pub use handshake::ConnectionState;
pub use name::{QueueName, Role, MAX_QUEUE_NAME_LEN};
pub use queue::{AccessMode, MessageQueue};
pub use transport::{TransportConfig, TransportConfigBuilder};
