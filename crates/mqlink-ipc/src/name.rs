//! Queue naming

use crate::channel::IpcError;
use std::fmt;

/// Longest queue name accepted, including the leading slash
pub const MAX_QUEUE_NAME_LEN: usize = 255;

/// Side of the connection an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates a well-known queue and waits for clients
    Server,
    /// Connects to a server's well-known queue
    Client,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::Server => "IPC_SERVER",
            Role::Client => "IPC_CLIENT",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// A validated POSIX message queue name such as `/IPC_CLIENT.4242`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(String);

impl QueueName {
    /// Validate `name` as a queue name
    pub fn new(name: impl Into<String>) -> Result<Self, IpcError> {
        let name = name.into();
        let reason = if !name.starts_with('/') {
            Some("must start with '/'")
        } else if name.len() < 2 {
            Some("must have at least one character after '/'")
        } else if name.len() > MAX_QUEUE_NAME_LEN {
            Some("longer than 255 bytes")
        } else if name[1..].contains('/') {
            Some("must not contain '/' after the first character")
        } else if name.contains('\0') {
            Some("must not contain NUL")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(IpcError::InvalidName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// Conventional name for `role` and instance `id`, e.g. `/IPC_SERVER.5555`
    pub fn for_role(role: Role, id: impl fmt::Display) -> Result<Self, IpcError> {
        Self::new(format!("/{}.{}", role.prefix(), id))
    }

    /// Conventional name for `role` scoped to the current process
    pub fn for_process(role: Role) -> Self {
        Self(format!("/{}.{}", role.prefix(), std::process::id()))
    }

    /// Parse a name received over the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IpcError> {
        match std::str::from_utf8(bytes) {
            Ok(s) => Self::new(s),
            Err(_) => Err(IpcError::InvalidName {
                name: String::from_utf8_lossy(bytes).into_owned(),
                reason: "not valid UTF-8",
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for QueueName {
    type Error = IpcError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
