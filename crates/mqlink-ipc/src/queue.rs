//! POSIX message queue handle
//!
//! Thin ownership wrapper over `mq_open`/`mq_send`/`mq_receive`. Every queue
//! is opened non-blocking: a full queue fails a send and an empty queue fails
//! a receive with `EAGAIN` instead of parking the calling thread.

use crate::channel::IpcError;
use crate::name::QueueName;
use crate::transport::TransportConfig;
use nix::errno::Errno;
use nix::mqueue::{
    mq_attr_member_t, mq_close, mq_open, mq_receive, mq_send, mq_unlink, MqAttr, MqdT, MQ_OFlag,
};
use nix::sys::stat::Mode;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Direction a peer queue is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// An open message queue descriptor plus the name it was opened under
#[derive(Debug)]
pub struct MessageQueue {
    name: QueueName,
    mqd: Option<MqdT>,
}

impl MessageQueue {
    /// Create a fresh queue under `name` for reading.
    ///
    /// Any stale queue left under the same name is removed first.
    pub fn create(name: &QueueName, config: &TransportConfig) -> Result<Self, IpcError> {
        let attr = MqAttr::new(
            0,
            attr_member("queue_depth", config.queue_depth)?,
            attr_member("max_message_size", config.max_message_size)?,
            0,
        );

        match mq_unlink(name.as_str()) {
            Ok(()) => debug!("Removed stale queue {}", name),
            Err(Errno::ENOENT) => {}
            Err(e) => debug!("Could not remove stale queue {}: {}", name, e),
        }

        let flags = MQ_OFlag::O_RDWR | MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | MQ_OFlag::O_NONBLOCK;
        let mode = Mode::from_bits_truncate(config.queue_mode as _);

        let mqd = mq_open(name.as_str(), flags, mode, Some(&attr)).map_err(|source| {
            IpcError::QueueCreateFailed {
                name: name.to_string(),
                source,
            }
        })?;

        debug!(
            "Created queue {} (depth={}, msgsize={})",
            name, config.queue_depth, config.max_message_size
        );
        Ok(Self {
            name: name.clone(),
            mqd: Some(mqd),
        })
    }

    /// Open an existing queue created by the peer. Never creates it.
    pub fn open_peer(name: &QueueName, mode: AccessMode) -> Result<Self, IpcError> {
        let access = match mode {
            AccessMode::Read => MQ_OFlag::O_RDONLY,
            AccessMode::Write => MQ_OFlag::O_WRONLY,
        };

        let mqd = mq_open(
            name.as_str(),
            access | MQ_OFlag::O_NONBLOCK,
            Mode::empty(),
            None,
        )
        .map_err(|source| match source {
            Errno::ENOENT => IpcError::PeerNotFound(name.to_string()),
            source => IpcError::QueueOpenFailed {
                name: name.to_string(),
                source,
            },
        })?;

        debug!("Opened peer queue {} for {:?}", name, mode);
        Ok(Self {
            name: name.clone(),
            mqd: Some(mqd),
        })
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.mqd.is_some()
    }

    /// Raw descriptor, for readiness polling
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.mqd.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Send one message with `priority`
    pub fn send(&self, data: &[u8], priority: u32) -> Result<usize, IpcError> {
        let mqd = self.mqd.as_ref().ok_or(IpcError::Closed)?;
        mq_send(mqd, data, priority).map_err(IpcError::SendFailed)?;
        Ok(data.len())
    }

    /// Receive one message into `buf`.
    ///
    /// `buf` must be at least the queue's message size. Returns
    /// `Ok(None)` when the queue is empty.
    pub fn receive(&self, buf: &mut [u8]) -> Result<Option<usize>, IpcError> {
        let mqd = self.mqd.as_ref().ok_or(IpcError::Closed)?;
        let mut priority = 0u32;
        loop {
            match mq_receive(mqd, buf, &mut priority) {
                Ok(len) => return Ok(Some(len)),
                Err(Errno::EAGAIN) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(IpcError::ReceiveFailed(e)),
            }
        }
    }

    /// Close the descriptor. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            match mq_close(mqd) {
                Ok(()) => debug!("Closed queue {}", self.name),
                Err(e) => warn!("Failed to close queue {}: {}", self.name, e),
            }
        }
    }

    /// Remove the queue's name from the system. Missing names are ignored.
    pub fn unlink(name: &QueueName) {
        match mq_unlink(name.as_str()) {
            Ok(()) => debug!("Unlinked queue {}", name),
            Err(Errno::ENOENT) => {}
            Err(e) => warn!("Failed to unlink queue {}: {}", name, e),
        }
    }
}

fn attr_member(field: &str, value: usize) -> Result<mq_attr_member_t, IpcError> {
    mq_attr_member_t::try_from(value)
        .map_err(|_| IpcError::InvalidConfig(format!("{field} {value} is out of range")))
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_name(tag: &str) -> QueueName {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        QueueName::new(format!("/mqlink-queue-{}-{}-{}", tag, std::process::id(), n)).unwrap()
    }

    #[test]
    fn test_create_send_receive() {
        let name = unique_name("rw");
        let config = TransportConfig::default();
        let reader = MessageQueue::create(&name, &config).unwrap();
        let writer = MessageQueue::open_peer(&name, AccessMode::Write).unwrap();

        assert_eq!(writer.send(b"hello", 10).unwrap(), 5);

        let mut buf = vec![0u8; config.max_message_size];
        let len = reader.receive(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(reader.receive(&mut buf).unwrap(), None);

        drop(writer);
        drop(reader);
        MessageQueue::unlink(&name);
    }

    #[test]
    fn test_create_replaces_stale_queue() {
        let name = unique_name("stale");
        let config = TransportConfig::default();
        let first = MessageQueue::create(&name, &config).unwrap();
        let writer = MessageQueue::open_peer(&name, AccessMode::Write).unwrap();
        writer.send(b"old", 10).unwrap();

        let second = MessageQueue::create(&name, &config).unwrap();
        let mut buf = vec![0u8; config.max_message_size];
        assert_eq!(second.receive(&mut buf).unwrap(), None);

        drop((first, second, writer));
        MessageQueue::unlink(&name);
    }

    #[test]
    fn test_open_peer_for_reading() {
        let name = unique_name("ro");
        let config = TransportConfig::default();
        let owner = MessageQueue::create(&name, &config).unwrap();
        owner.send(b"self", 1).unwrap();

        let reader = MessageQueue::open_peer(&name, AccessMode::Read).unwrap();
        let mut buf = vec![0u8; config.max_message_size];
        assert_eq!(reader.receive(&mut buf).unwrap(), Some(4));
        assert!(reader.send(b"nope", 1).is_err());

        drop((owner, reader));
        MessageQueue::unlink(&name);
    }

    #[test]
    fn test_open_missing_peer() {
        let name = unique_name("missing");
        let err = MessageQueue::open_peer(&name, AccessMode::Write).unwrap_err();
        assert!(matches!(err, IpcError::PeerNotFound(_)));
    }

    #[test]
    fn test_full_queue_fails_send() {
        let name = unique_name("full");
        let config = TransportConfig::builder().queue_depth(2).build();
        let _reader = MessageQueue::create(&name, &config).unwrap();
        let writer = MessageQueue::open_peer(&name, AccessMode::Write).unwrap();

        writer.send(b"1", 10).unwrap();
        writer.send(b"2", 10).unwrap();
        let err = writer.send(b"3", 10).unwrap_err();
        assert!(matches!(err, IpcError::SendFailed(Errno::EAGAIN)));

        MessageQueue::unlink(&name);
    }

    #[test]
    fn test_create_rejects_unrepresentable_attributes() {
        let name = unique_name("attr");
        let config = TransportConfig::builder().queue_depth(usize::MAX).build();
        let err = MessageQueue::create(&name, &config).unwrap_err();
        assert!(matches!(err, IpcError::InvalidConfig(ref msg) if msg.contains("queue_depth")));

        let config = TransportConfig::builder().max_message_size(usize::MAX).build();
        let err = MessageQueue::create(&name, &config).unwrap_err();
        assert!(matches!(err, IpcError::InvalidConfig(ref msg) if msg.contains("max_message_size")));

        assert!(matches!(
            MessageQueue::open_peer(&name, AccessMode::Read),
            Err(IpcError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let name = unique_name("close");
        let mut queue = MessageQueue::create(&name, &TransportConfig::default()).unwrap();
        queue.close();
        queue.close();
        assert!(!queue.is_open());
        assert!(matches!(queue.send(b"x", 0), Err(IpcError::Closed)));
        MessageQueue::unlink(&name);
        MessageQueue::unlink(&name);
    }
}
