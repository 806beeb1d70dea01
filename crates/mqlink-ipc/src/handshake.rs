//! Connection handshake
//!
//! Exchanges queue names so that each side learns where to write.
//!
//! ```text
//!        client                                   server
//!   create /IPC_CLIENT.<pid>               create /IPC_SERVER.<id>
//!   open server queue (write)                     |
//!   send "/IPC_CLIENT.<pid>"  ---------------->  dispatcher signals gate
//!   wait on gate (timeout)                 accept: open client queue (write)
//!   dispatcher checks echo    <----------------  send "/IPC_CLIENT.<pid>"
//!   gate signalled, connected                    connected
//! ```
//!
//! The server echoes the client's own queue name back. Named queues live in
//! a shared namespace, so the client only accepts a confirmation that carries
//! its own name; anything else is recorded as a protocol violation and the
//! client keeps waiting until the timeout.

use crate::channel::IpcError;
use crate::dispatcher::Phase;
use crate::endpoint::Shared;
use crate::name::{QueueName, Role};
use crate::queue::{AccessMode, MessageQueue};
use std::fmt;
use tracing::{debug, info, warn};

/// Connection state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Read queue exists, no handshake started
    Created,
    /// Server is waiting for a client to announce its queue name
    AwaitingPeerInfo,
    /// Client has opened the server's queue
    PeerOpened,
    /// Client has announced itself and waits for the echo
    AwaitingConfirm,
    /// Both directions are open
    Connected,
    /// The handshake failed. A client may `connect` again; a server has to
    /// be torn down and created afresh.
    Failed,
    /// `deinit` has run
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Created => "created",
            ConnectionState::AwaitingPeerInfo => "awaiting peer info",
            ConnectionState::PeerOpened => "peer opened",
            ConnectionState::AwaitingConfirm => "awaiting confirmation",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl Shared {
    /// Move to `to`. Fails with `Closed` once the endpoint is torn down.
    fn advance(&self, to: ConnectionState) -> Result<(), IpcError> {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return Err(IpcError::Closed);
        }
        debug!("{} {}: {} -> {}", self.role, self.read_name, *state, to);
        *state = to;
        Ok(())
    }

    /// Check that a handshake may start on this endpoint
    fn begin(&self, operation: &'static str, role: Role) -> Result<(), IpcError> {
        if self.role != role {
            return Err(IpcError::WrongRole {
                operation,
                role: self.role,
            });
        }
        let state = *self.state.lock();
        match state {
            ConnectionState::Created => Ok(()),
            // A server may already have switched its dispatcher past the
            // handshake, so only a client starts over.
            ConnectionState::Failed if role == Role::Client => {
                self.reset_handshake();
                Ok(())
            }
            state => Err(IpcError::InvalidState { operation, state }),
        }
    }

    /// Undo what an earlier failed attempt left behind so the next
    /// confirmation is judged afresh.
    fn reset_handshake(&self) {
        let mut phase = self.phase.lock();
        *phase = Phase::Handshake;
        self.handshake.clear();
        self.violation.lock().take();
        debug!("{} {}: retrying handshake", self.role, self.read_name);
    }

    /// Record the outcome of a handshake. A teardown that raced the
    /// handshake wins and is reported as `Closed`.
    fn finish<T>(&self, result: Result<T, IpcError>) -> Result<T, IpcError> {
        match result {
            Ok(value) => {
                self.advance(ConnectionState::Connected)?;
                Ok(value)
            }
            Err(err) => {
                let mut state = self.state.lock();
                if *state == ConnectionState::Closed {
                    return Err(IpcError::Closed);
                }
                *state = ConnectionState::Failed;
                Err(err)
            }
        }
    }

    /// Server side: block until a client announces itself, then open its
    /// queue and echo its name back.
    pub(crate) fn accept(&self) -> Result<QueueName, IpcError> {
        self.begin("accept", Role::Server)?;
        self.advance(ConnectionState::AwaitingPeerInfo)?;
        info!("Server {} waiting for a client", self.read_name);

        let result = (|| -> Result<QueueName, IpcError> {
            let peer = self.handshake.wait(None)?;
            let writer = MessageQueue::open_peer(&peer, AccessMode::Write)?;
            writer.send(peer.as_bytes(), self.config.message_priority)?;
            *self.writer.write() = Some(writer);
            Ok(peer)
        })();

        let peer = self.finish(result)?;
        info!("Server {} accepted client {}", self.read_name, peer);
        Ok(peer)
    }

    /// Client side: announce our queue name to `peer` and wait for the echo.
    pub(crate) fn connect(&self, peer: &str) -> Result<QueueName, IpcError> {
        self.begin("connect", Role::Client)?;
        let peer = QueueName::new(peer)?;

        // The server's queue must already exist; fail fast if it does not.
        let writer = match MessageQueue::open_peer(&peer, AccessMode::Write) {
            Ok(writer) => writer,
            Err(err) => return self.finish(Err(err)),
        };
        *self.writer.write() = Some(writer);
        self.advance(ConnectionState::PeerOpened)?;

        let result = (|| -> Result<(), IpcError> {
            self.send(self.read_name.as_bytes())?;
            self.advance(ConnectionState::AwaitingConfirm)?;

            let timeout = self.config.handshake_timeout();
            match self.handshake.wait(Some(timeout)) {
                Ok(_) => Ok(()),
                Err(IpcError::Timeout) => Err(self.violation.lock().take().unwrap_or_else(|| {
                    IpcError::HandshakeTimeout {
                        peer: peer.to_string(),
                        timeout,
                    }
                })),
                Err(err) => Err(err),
            }
        })();

        if result.is_err() {
            if let Some(mut writer) = self.writer.write().take() {
                writer.close();
            }
        }
        self.finish(result)?;
        info!("Client {} connected to {}", self.read_name, peer);
        Ok(peer)
    }

    /// Handle one message received while the dispatcher is in the handshake
    /// phase and return the phase for the next message.
    pub(crate) fn on_handshake_message(&self, payload: &[u8]) -> Phase {
        match self.role {
            Role::Server => match QueueName::from_bytes(payload) {
                Ok(peer) => {
                    debug!("Server {} received peer name {}", self.read_name, peer);
                    self.handshake.signal(peer);
                    Phase::Steady
                }
                Err(err) => {
                    warn!("Server {} ignoring handshake message: {}", self.read_name, err);
                    Phase::Handshake
                }
            },
            Role::Client => {
                if payload == self.read_name.as_bytes() {
                    debug!("Client {} handshake confirmed", self.read_name);
                    self.handshake.signal(self.read_name.clone());
                    Phase::Steady
                } else {
                    let received = String::from_utf8_lossy(payload).into_owned();
                    warn!(
                        "Client {} connect response check failed: got {:?}",
                        self.read_name, received
                    );
                    *self.violation.lock() = Some(IpcError::ProtocolMismatch {
                        expected: self.read_name.to_string(),
                        received,
                    });
                    Phase::Handshake
                }
            }
        }
    }
}
