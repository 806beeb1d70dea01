//! Notification dispatcher
//!
//! Each endpoint owns one dispatch thread. The thread owns the endpoint's
//! read queue and blocks in `poll(2)` until the queue becomes readable or the
//! endpoint is torn down. Every wakeup drains the queue until it is empty,
//! so several messages arriving between two wakeups each get dispatched.
//!
//! Messages are handled strictly one after another, so the switch from the
//! handshake phase to the steady phase happens between two messages and the
//! handshake message is always consumed by the handshake handler.
//!
//! In the steady phase a message is only taken off the queue once there is
//! somewhere to put it. With no callback and a full inbox the dispatcher
//! parks until `receive` makes room, leaving the backlog in the kernel queue
//! where it throttles the sender.

use crate::channel::IpcError;
use crate::endpoint::Shared;
use crate::handshake::ConnectionState;
use crate::queue::MessageQueue;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, trace};

/// Which handler the next inbound message goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Handshake,
    Steady,
}

enum Readiness {
    Readable,
    Shutdown,
}

/// Handle to a running dispatch thread
pub(crate) struct Dispatcher {
    wake: Option<UnixStream>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Dispatcher {
    /// Start dispatching messages arriving on `queue`
    pub(crate) fn spawn(queue: MessageQueue, shared: Arc<Shared>) -> Result<Self, IpcError> {
        let (wake, wake_rx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;

        let name = format!("mqlink{}", queue.name());
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(queue, wake_rx, shared))?;

        Ok(Self {
            wake: Some(wake),
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it to close the read queue.
    ///
    /// Called from the dispatch thread itself (a callback tearing down its
    /// own endpoint) the thread is only told to stop.
    pub(crate) fn stop(&mut self) {
        if let Some(wake) = self.wake.take() {
            if let Err(e) = wake.shutdown(Shutdown::Both) {
                debug!("Dispatcher wake socket shutdown failed: {}", e);
            }
        }

        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread::current().id() == self.thread_id {
            return;
        }
        if thread.join().is_err() {
            error!("Dispatcher thread panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(queue: MessageQueue, wake: UnixStream, shared: Arc<Shared>) {
    let mut buf = vec![0u8; shared.config.max_message_size];
    debug!("Dispatcher started for {}", queue.name());

    'dispatch: loop {
        match wait_readable(&queue, &wake) {
            Ok(Readiness::Readable) => {}
            Ok(Readiness::Shutdown) => break,
            Err(err) => {
                error!("Dispatcher for {} stopped: {}", queue.name(), err);
                let phase = *shared.phase.lock();
                fail(&shared, phase, err);
                break;
            }
        }

        loop {
            let steady = *shared.phase.lock() == Phase::Steady;
            if steady && !shared.wait_for_inbox_room() {
                break 'dispatch;
            }

            match queue.receive(&mut buf) {
                Ok(Some(len)) => {
                    let mut phase = shared.phase.lock();
                    let current = *phase;
                    trace!("{} received {} bytes ({:?})", queue.name(), len, current);
                    match current {
                        Phase::Handshake => *phase = shared.on_handshake_message(&buf[..len]),
                        Phase::Steady => {
                            drop(phase);
                            shared.on_message(&buf[..len]);
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!("Receive on {} failed: {}", queue.name(), err);
                    let phase = *shared.phase.lock();
                    fail(&shared, phase, err);
                    break 'dispatch;
                }
            }
        }
    }

    debug!("Dispatcher stopped for {}", queue.name());
}

/// Route a fatal dispatcher error to whoever is waiting on this endpoint
fn fail(shared: &Shared, phase: Phase, err: IpcError) {
    {
        let mut state = shared.state.lock();
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Failed;
    }
    match phase {
        Phase::Handshake => shared.handshake.fail(err),
        Phase::Steady => shared.inbox.fail(err),
    }
}

/// Block until the queue has a message or the wake socket is shut down
fn wait_readable(queue: &MessageQueue, wake: &UnixStream) -> Result<Readiness, IpcError> {
    let raw = queue.raw_fd().ok_or(IpcError::Closed)?;
    // SAFETY: the descriptor belongs to `queue`, which outlives this call.
    let queue_fd = unsafe { BorrowedFd::borrow_raw(raw) };

    loop {
        let mut fds = [
            PollFd::new(queue_fd, PollFlags::POLLIN),
            PollFd::new(wake.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(IpcError::ReceiveFailed(e)),
        }

        let wake_events = fds[1].revents().unwrap_or(PollFlags::empty());
        if !wake_events.is_empty() && wake_closed(wake) {
            return Ok(Readiness::Shutdown);
        }

        let queue_events = fds[0].revents().unwrap_or(PollFlags::empty());
        if queue_events.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Err(IpcError::ReceiveFailed(Errno::EBADF));
        }
        if queue_events.contains(PollFlags::POLLIN) {
            return Ok(Readiness::Readable);
        }
    }
}

fn wake_closed(wake: &UnixStream) -> bool {
    use std::io::Read;

    let mut byte = [0u8; 1];
    match (&*wake).read(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{QueueName, Role};
    use crate::transport::TransportConfig;
    use std::time::Duration;

    fn shared(role: Role) -> Arc<Shared> {
        let name = QueueName::new("/mqlink-dispatch-unit").unwrap();
        Arc::new(Shared::new(role, TransportConfig::default(), name))
    }

    #[test]
    fn test_fail_during_handshake_wakes_connect() {
        let shared = shared(Role::Client);
        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.handshake.wait(None))
        };
        thread::sleep(Duration::from_millis(20));

        fail(&shared, Phase::Handshake, IpcError::ReceiveFailed(Errno::EBADF));

        assert!(matches!(
            waiter.join().unwrap(),
            Err(IpcError::ReceiveFailed(Errno::EBADF))
        ));
        assert_eq!(*shared.state.lock(), ConnectionState::Failed);
        assert_eq!(shared.inbox.pending(), 0);
    }

    #[test]
    fn test_fail_when_steady_wakes_receive() {
        let shared = shared(Role::Server);
        *shared.state.lock() = ConnectionState::Connected;
        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.inbox.wait(None))
        };
        thread::sleep(Duration::from_millis(20));

        fail(&shared, Phase::Steady, IpcError::ReceiveFailed(Errno::EIO));

        assert!(matches!(
            waiter.join().unwrap(),
            Err(IpcError::ReceiveFailed(Errno::EIO))
        ));
        assert_eq!(*shared.state.lock(), ConnectionState::Failed);
        assert_eq!(shared.handshake.pending(), 0);
    }

    #[test]
    fn test_fail_after_teardown_is_ignored() {
        let shared = shared(Role::Client);
        *shared.state.lock() = ConnectionState::Closed;

        fail(&shared, Phase::Handshake, IpcError::ReceiveFailed(Errno::EBADF));

        assert_eq!(*shared.state.lock(), ConnectionState::Closed);
        assert_eq!(shared.handshake.pending(), 0);
    }
}
