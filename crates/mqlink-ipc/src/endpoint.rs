//! Message queue endpoint
//!
//! An endpoint pairs a locally created read queue with a write queue opened on
//! the peer's read queue once the handshake completes. Inbound messages are
//! dispatched on the endpoint's own thread: to the registered receive
//! callback if there is one, otherwise into an inbox drained by
//! [`MqEndpoint::receive`].
//!
//! The inbox holds at most `queue_depth` messages. While it is full the
//! dispatcher leaves further messages in the kernel queue, so once that fills
//! up too the peer's `send` fails with `SendFailed(EAGAIN)`.
//!
//! # Example
//!
//! ```rust,ignore
//! use mqlink_ipc::{MqEndpoint, Role};
//!
//! let server = MqEndpoint::init("/SRV", Role::Server)?;
//! server.register_receive_callback(Box::new(|responder, msg| {
//!     let _ = responder.send(msg);
//! }))?;
//! server.accept()?;
//!
//! // in another process
//! let client = MqEndpoint::init("/CLI.42", Role::Client)?;
//! client.connect("/SRV")?;
//! client.send(b"ping")?;
//! let mut buf = [0u8; 1024];
//! let len = client.receive(&mut buf)?;
//! ```

use crate::channel::{IpcChannel, IpcError};
use crate::dispatcher::{Dispatcher, Phase};
use crate::gate::Gate;
use crate::handshake::ConnectionState;
use crate::name::{QueueName, Role};
use crate::queue::MessageQueue;
use crate::transport::TransportConfig;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Callback invoked on the dispatch thread for every inbound message
pub type ReceiveCallback = Box<dyn FnMut(&Responder, &[u8]) + Send + 'static>;

/// Endpoint state shared with the dispatch thread
pub(crate) struct Shared {
    pub(crate) role: Role,
    pub(crate) config: TransportConfig,
    pub(crate) read_name: QueueName,
    pub(crate) writer: RwLock<Option<MessageQueue>>,
    pub(crate) state: Mutex<ConnectionState>,
    /// Handler for the next inbound message
    pub(crate) phase: Mutex<Phase>,
    /// Server: peer queue names. Client: confirmed echoes.
    pub(crate) handshake: Gate<QueueName>,
    /// Last mismatched confirmation seen by a connecting client
    pub(crate) violation: Mutex<Option<IpcError>>,
    pub(crate) inbox: Gate<Vec<u8>>,
    callback: Mutex<Option<ReceiveCallback>>,
    has_callback: AtomicBool,
}

impl Shared {
    pub(crate) fn new(role: Role, config: TransportConfig, read_name: QueueName) -> Self {
        Self {
            role,
            config,
            read_name,
            writer: RwLock::new(None),
            state: Mutex::new(ConnectionState::Created),
            phase: Mutex::new(Phase::Handshake),
            handshake: Gate::new(),
            violation: Mutex::new(None),
            inbox: Gate::new(),
            callback: Mutex::new(None),
            has_callback: AtomicBool::new(false),
        }
    }

    pub(crate) fn send(&self, data: &[u8]) -> Result<usize, IpcError> {
        if data.len() > self.config.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
        }
        let writer = self.writer.read();
        match writer.as_ref() {
            Some(queue) => queue.send(data, self.config.message_priority),
            None => Err(IpcError::InvalidState {
                operation: "send",
                state: *self.state.lock(),
            }),
        }
    }

    /// Block the dispatch thread while the inbox is full and no callback
    /// would take the next message. Returns `false` once the inbox is closed.
    pub(crate) fn wait_for_inbox_room(&self) -> bool {
        self.inbox.wait_for_room(self.config.queue_depth, || {
            self.has_callback.load(Ordering::Acquire)
        })
    }

    /// Steady-state handler, run on the dispatch thread
    pub(crate) fn on_message(self: &Arc<Self>, payload: &[u8]) {
        // Taken out of the slot for the call so the callback may replace
        // itself or tear the endpoint down without deadlocking.
        let callback = self.callback.lock().take();
        match callback {
            Some(mut callback) => {
                let responder = Responder {
                    shared: Arc::clone(self),
                };
                callback(&responder, payload);

                let mut slot = self.callback.lock();
                if slot.is_none() && !self.inbox.is_closed() {
                    *slot = Some(callback);
                }
            }
            None => self.inbox.signal(payload.to_vec()),
        }
    }
}

/// Send half of an endpoint, handed to the receive callback
#[derive(Clone)]
pub struct Responder {
    shared: Arc<Shared>,
}

impl Responder {
    /// Send a message to the endpoint's peer
    pub fn send(&self, data: &[u8]) -> Result<usize, IpcError> {
        self.shared.send(data)
    }

    /// Name of the queue the message arrived on
    pub fn read_name(&self) -> &QueueName {
        &self.shared.read_name
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }
}

/// POSIX message queue endpoint
pub struct MqEndpoint {
    shared: Arc<Shared>,
    dispatcher: Mutex<Dispatcher>,
}

impl MqEndpoint {
    /// Create the endpoint's read queue under `name` with the default
    /// configuration and start dispatching.
    pub fn init(name: &str, role: Role) -> Result<Self, IpcError> {
        Self::with_config(name, role, TransportConfig::default())
    }

    /// Create an endpoint with an explicit configuration
    pub fn with_config(name: &str, role: Role, config: TransportConfig) -> Result<Self, IpcError> {
        config.validate()?;
        let read_name = QueueName::new(name)?;
        let queue = MessageQueue::create(&read_name, &config)?;

        let shared = Arc::new(Shared::new(role, config, read_name.clone()));

        let dispatcher = match Dispatcher::spawn(queue, Arc::clone(&shared)) {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                MessageQueue::unlink(&read_name);
                return Err(err);
            }
        };

        info!("Initialized {} endpoint {}", role, read_name);
        Ok(Self {
            shared,
            dispatcher: Mutex::new(dispatcher),
        })
    }

    /// Wait, without a time limit, for a client to connect. Server only.
    pub fn accept(&self) -> Result<(), IpcError> {
        self.shared.accept().map(drop)
    }

    /// Connect to the server listening on `peer`. Client only.
    ///
    /// Fails immediately with `PeerNotFound` if `peer` does not exist, and
    /// with `HandshakeTimeout` (or `ProtocolMismatch` if a wrong confirmation
    /// was seen) when no valid confirmation arrives in time. After a failure
    /// the client may call `connect` again.
    pub fn connect(&self, peer: &str) -> Result<(), IpcError> {
        self.shared.connect(peer).map(drop)
    }

    /// Send a message to the peer. Never blocks; a full queue is an error.
    pub fn send(&self, data: &[u8]) -> Result<usize, IpcError> {
        self.shared.send(data)
    }

    /// Take the next inbound message, waiting up to the configured receive
    /// timeout.
    ///
    /// Only messages that arrived while no callback was registered end up
    /// here. Taking one lets the dispatcher pull the next message off the
    /// queue.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, IpcError> {
        self.receive_timeout(buf, self.shared.config.receive_timeout())
    }

    /// Like [`receive`](Self::receive) with an explicit timeout
    pub fn receive_timeout(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, IpcError> {
        let message = self.shared.inbox.wait(timeout)?;
        self.copy_out(message, buf)
    }

    /// Take an inbound message if one is already waiting
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<Option<usize>, IpcError> {
        match self.shared.inbox.try_wait() {
            Some(message) => self.copy_out(message?, buf).map(Some),
            None => Ok(None),
        }
    }

    fn copy_out(&self, message: Vec<u8>, buf: &mut [u8]) -> Result<usize, IpcError> {
        if message.len() > buf.len() {
            let needed = message.len();
            self.shared.inbox.restore(message);
            return Err(IpcError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }
        buf[..message.len()].copy_from_slice(&message);
        Ok(message.len())
    }

    /// Install the callback run on the dispatch thread for every message
    /// received after this call. Replaces any previous callback.
    pub fn register_receive_callback(&self, callback: ReceiveCallback) -> Result<(), IpcError> {
        if self.shared.inbox.is_closed() {
            return Err(IpcError::Closed);
        }
        *self.shared.callback.lock() = Some(callback);
        self.shared.has_callback.store(true, Ordering::Release);
        self.shared.inbox.notify_room();
        Ok(())
    }

    /// Tear the endpoint down: wake blocked callers with `Closed`, stop the
    /// dispatcher, close both queues and unlink the read queue.
    ///
    /// Best effort and idempotent.
    pub fn deinit(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            debug!("{} {}: {} -> closed", self.shared.role, self.shared.read_name, *state);
            *state = ConnectionState::Closed;
        }

        self.shared.handshake.close();
        self.shared.inbox.close();
        self.dispatcher.lock().stop();

        if let Some(mut writer) = self.shared.writer.write().take() {
            writer.close();
        }
        MessageQueue::unlink(&self.shared.read_name);
        self.shared.callback.lock().take();
        self.shared.has_callback.store(false, Ordering::Release);

        info!("Closed {} endpoint {}", self.shared.role, self.shared.read_name);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Name of the locally owned queue this endpoint reads from
    pub fn read_name(&self) -> &QueueName {
        &self.shared.read_name
    }

    /// Name of the peer queue this endpoint writes to, once known
    pub fn write_name(&self) -> Option<QueueName> {
        self.shared.writer.read().as_ref().map(|q| q.name().clone())
    }

    /// A send handle usable from other threads
    pub fn responder(&self) -> Responder {
        Responder {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for MqEndpoint {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl IpcChannel for MqEndpoint {
    fn accept(&self) -> Result<(), IpcError> {
        MqEndpoint::accept(self)
    }

    fn connect(&self, peer: &str) -> Result<(), IpcError> {
        MqEndpoint::connect(self, peer)
    }

    fn send(&self, data: &[u8]) -> Result<usize, IpcError> {
        MqEndpoint::send(self, data)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, IpcError> {
        self.receive(buf)
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) -> Result<(), IpcError> {
        MqEndpoint::register_receive_callback(self, callback)
    }

    fn close(&self) {
        self.deinit();
    }
}
