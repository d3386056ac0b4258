//! Node identity.
//!
//! A node id names one runtime process: a random 128-bit host component
//! generated at process start plus the OS process id, 160 bits total on
//! the wire. The all-zero value is the distinguished *none* id ("no
//! node"). Node ids order totally, which gives BASP a deterministic
//! tie-break when two nodes dial each other simultaneously.

use std::fmt;

use crate::codec::{ByteSink, ByteSource};
use crate::error::Error;

/// Size of a serialized node id in bytes (host part + process id).
pub const NODE_ID_WIRE_SIZE: usize = 20;

/// Identity of one runtime process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    host: [u8; 16],
    pid: u32,
}

impl NodeId {
    /// The distinguished "no node" id.
    pub const fn none() -> NodeId {
        NodeId { host: [0u8; 16], pid: 0 }
    }

    /// Generate a fresh node id for this process.
    ///
    /// The host part is random per process start; nothing is persisted
    /// across restarts.
    pub fn generate() -> NodeId {
        NodeId {
            host: rand::random(),
            pid: std::process::id(),
        }
    }

    /// Build a node id from raw parts (tests and decoding).
    pub fn from_parts(host: [u8; 16], pid: u32) -> NodeId {
        NodeId { host, pid }
    }

    pub fn is_none(&self) -> bool {
        *self == NodeId::none()
    }

    pub fn host(&self) -> &[u8; 16] {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Serialize as 20 big-endian bytes: host part, then process id.
    pub fn write_to(&self, sink: &mut ByteSink) {
        sink.put_bytes(&self.host);
        sink.put_u32(self.pid);
    }

    /// Inverse of [`NodeId::write_to`].
    pub fn read_from(source: &mut ByteSource<'_>) -> Result<NodeId, Error> {
        let mut host = [0u8; 16];
        host.copy_from_slice(source.take(16)?);
        let pid = source.get_u32()?;
        Ok(NodeId { host, pid })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        for b in &self.host[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "#{}", self.pid)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
