//! The fixed-size BASP wire header.
//!
//! 78 bytes, all integers big-endian:
//!
//! ```text
//! operation:       u8
//! flags:           u8
//! payload_len:     u32
//! operation_data:  u64   // opcode-specific (handshakes: version)
//! source_node:     20 B
//! dest_node:       20 B
//! source_actor:    u64
//! dest_actor:      u64
//! sequence_number: u64   // per-peer, strictly increasing
//! ```
//!
//! Each opcode constrains which fields must be present and which must
//! be zero; [`Header::valid`] is that predicate. A header failing it
//! closes the connection.

use crate::actor::cell::ActorId;
use crate::codec::{ByteSink, ByteSource};
use crate::error::Error;
use crate::node::NodeId;

/// Protocol version carried in handshake `operation_data`.
pub const BASP_VERSION: u64 = 1;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 78;

/// Flag: the receiver is addressed by registered name (in the payload)
/// instead of by actor id.
pub const NAMED_RECEIVER_FLAG: u8 = 0x01;

/// Wire operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    ServerHandshake = 0,
    ClientHandshake = 1,
    DirectMessage = 2,
    RoutedMessage = 3,
    MonitorMessage = 4,
    DownMessage = 5,
    Heartbeat = 6,
    AnnounceProxy = 7,
    KillProxy = 8,
}

impl Operation {
    pub fn from_u8(raw: u8) -> Option<Operation> {
        Some(match raw {
            0 => Operation::ServerHandshake,
            1 => Operation::ClientHandshake,
            2 => Operation::DirectMessage,
            3 => Operation::RoutedMessage,
            4 => Operation::MonitorMessage,
            5 => Operation::DownMessage,
            6 => Operation::Heartbeat,
            7 => Operation::AnnounceProxy,
            8 => Operation::KillProxy,
            _ => return None,
        })
    }
}

/// One BASP frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub operation: Operation,
    pub flags: u8,
    pub payload_len: u32,
    pub operation_data: u64,
    pub source_node: NodeId,
    pub dest_node: NodeId,
    pub source_actor: ActorId,
    pub dest_actor: ActorId,
    pub sequence_number: u64,
}

impl Header {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn write_to(&self, sink: &mut ByteSink) {
        sink.put_u8(self.operation as u8);
        sink.put_u8(self.flags);
        sink.put_u32(self.payload_len);
        sink.put_u64(self.operation_data);
        self.source_node.write_to(sink);
        self.dest_node.write_to(sink);
        sink.put_u64(self.source_actor);
        sink.put_u64(self.dest_actor);
        sink.put_u64(self.sequence_number);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut sink = ByteSink::with_capacity(HEADER_SIZE);
        self.write_to(&mut sink);
        sink.into_vec()
    }

    pub fn read_from(source: &mut ByteSource<'_>) -> Result<Header, Error> {
        let operation = Operation::from_u8(source.get_u8()?).ok_or(Error::MalformedHeader)?;
        Ok(Header {
            operation,
            flags: source.get_u8()?,
            payload_len: source.get_u32()?,
            operation_data: source.get_u64()?,
            source_node: NodeId::read_from(source)?,
            dest_node: NodeId::read_from(source)?,
            source_actor: source.get_u64()?,
            dest_actor: source.get_u64()?,
            sequence_number: source.get_u64()?,
        })
    }

    /// The per-opcode validity predicate. Sequence numbers are checked
    /// statefully by the peer, not here.
    pub fn valid(&self) -> bool {
        let named = self.has_flag(NAMED_RECEIVER_FLAG);
        match self.operation {
            Operation::ServerHandshake => {
                !self.source_node.is_none()
                    && self.dest_actor == 0
                    && self.operation_data != 0
            }
            Operation::ClientHandshake => {
                !self.source_node.is_none()
                    && self.source_node != self.dest_node
                    && self.source_actor == 0
                    && self.dest_actor == 0
            }
            Operation::DirectMessage => {
                (self.dest_actor != 0 || named) && self.payload_len != 0
            }
            Operation::RoutedMessage => {
                !self.dest_node.is_none()
                    && (self.dest_actor != 0 || named)
                    && self.payload_len != 0
            }
            Operation::MonitorMessage => {
                self.payload_len != 0
                    && self.operation_data == 0
                    && self.source_actor == 0
                    && self.dest_actor == 0
            }
            Operation::DownMessage => {
                self.payload_len != 0
                    && self.operation_data == 0
                    && self.source_actor != 0
                    && self.dest_actor == 0
            }
            Operation::Heartbeat => {
                !self.source_node.is_none()
                    && !self.dest_node.is_none()
                    && self.source_node != self.dest_node
                    && self.payload_len == 0
                    && self.operation_data == 0
                    && self.source_actor == 0
                    && self.dest_actor == 0
            }
            Operation::AnnounceProxy => {
                !self.source_node.is_none()
                    && !self.dest_node.is_none()
                    && self.source_node != self.dest_node
                    && self.source_actor == 0
                    && self.dest_actor != 0
                    && self.payload_len == 0
                    && self.operation_data == 0
            }
            Operation::KillProxy => {
                !self.source_node.is_none()
                    && !self.dest_node.is_none()
                    && self.source_node != self.dest_node
                    && self.source_actor != 0
                    && self.dest_actor == 0
                    && self.payload_len != 0
                    && self.operation_data == 0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> (NodeId, NodeId) {
        (
            NodeId::from_parts([1; 16], 100),
            NodeId::from_parts([2; 16], 200),
        )
    }

    fn base(op: Operation) -> Header {
        let (a, b) = nodes();
        Header {
            operation: op,
            flags: 0,
            payload_len: 0,
            operation_data: 0,
            source_node: a,
            dest_node: b,
            source_actor: 0,
            dest_actor: 0,
            sequence_number: 7,
        }
    }

    #[test]
    fn test_roundtrip_all_opcodes() {
        let (a, b) = nodes();
        for raw in 0..=8u8 {
            let hdr = Header {
                operation: Operation::from_u8(raw).unwrap(),
                flags: 1,
                payload_len: 256,
                operation_data: 42,
                source_node: a,
                dest_node: b,
                source_actor: 11,
                dest_actor: 22,
                sequence_number: 33,
            };
            let bytes = hdr.to_bytes();
            assert_eq!(bytes.len(), HEADER_SIZE);
            let mut src = ByteSource::new(&bytes);
            assert_eq!(Header::read_from(&mut src).unwrap(), hdr);
            assert!(src.is_empty());
        }
    }

    #[test]
    fn test_unknown_operation_is_malformed() {
        let mut hdr = base(Operation::Heartbeat).to_bytes();
        hdr[0] = 0xFF;
        let mut src = ByteSource::new(&hdr);
        assert_eq!(Header::read_from(&mut src), Err(Error::MalformedHeader));
    }

    #[test]
    fn test_truncated_header_is_eof() {
        let bytes = base(Operation::Heartbeat).to_bytes();
        let mut src = ByteSource::new(&bytes[..HEADER_SIZE - 1]);
        assert_eq!(Header::read_from(&mut src), Err(Error::UnexpectedEof));
    }

    #[test]
    fn test_server_handshake_requires_nonzero_operation_data() {
        let mut good = base(Operation::ServerHandshake);
        good.operation_data = BASP_VERSION;
        assert!(good.valid());
        let mut bad = good;
        bad.operation_data = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.dest_actor = 42;
        assert!(!bad.valid());
        let mut bad = good;
        bad.source_node = NodeId::none();
        assert!(!bad.valid());
    }

    #[test]
    fn test_client_handshake_may_not_send_actor_ids() {
        let mut good = base(Operation::ClientHandshake);
        good.operation_data = BASP_VERSION;
        assert!(good.valid());
        for (sa, da) in [(42, 42), (42, 0), (0, 42)] {
            let mut bad = good;
            bad.source_actor = sa;
            bad.dest_actor = da;
            assert!(!bad.valid(), "actor ids ({sa},{da}) must invalidate");
        }
        let mut bad = good;
        bad.dest_node = bad.source_node;
        assert!(!bad.valid());
    }

    #[test]
    fn test_direct_message_needs_destination_and_payload() {
        let mut good = base(Operation::DirectMessage);
        good.payload_len = 256;
        good.dest_actor = 42;
        assert!(good.valid());
        let mut bad = good;
        bad.payload_len = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.dest_actor = 0;
        assert!(!bad.valid());
        // A named receiver substitutes for the actor id.
        let mut named = good;
        named.dest_actor = 0;
        named.flags = NAMED_RECEIVER_FLAG;
        assert!(named.valid());
    }

    #[test]
    fn test_routed_message_needs_destination_and_payload() {
        let mut good = base(Operation::RoutedMessage);
        good.payload_len = 256;
        good.dest_actor = 42;
        assert!(good.valid());
        let mut bad = good;
        bad.payload_len = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.dest_actor = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.dest_node = NodeId::none();
        assert!(!bad.valid());
    }

    #[test]
    fn test_monitor_message_payload_only() {
        let mut good = base(Operation::MonitorMessage);
        good.payload_len = 256;
        assert!(good.valid());
        let mut bad = good;
        bad.payload_len = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.operation_data = 42;
        assert!(!bad.valid());
    }

    #[test]
    fn test_down_message_payload_and_source_only() {
        let mut good = base(Operation::DownMessage);
        good.payload_len = 256;
        good.source_actor = 42;
        assert!(good.valid());
        let mut bad = good;
        bad.dest_actor = 23;
        assert!(!bad.valid());
        let mut bad = good;
        bad.payload_len = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.operation_data = 1;
        assert!(!bad.valid());
    }

    #[test]
    fn test_heartbeat_all_zero_except_opcode() {
        let good = base(Operation::Heartbeat);
        assert!(good.valid());
        let mut bad = good;
        bad.payload_len = 1;
        assert!(!bad.valid());
        let mut bad = good;
        bad.operation_data = 1;
        assert!(!bad.valid());
        let mut bad = good;
        bad.source_actor = 1;
        assert!(!bad.valid());
        let mut bad = good;
        bad.dest_actor = 1;
        assert!(!bad.valid());
        let mut bad = good;
        bad.dest_node = bad.source_node;
        assert!(!bad.valid());
    }

    #[test]
    fn test_announce_proxy_shape() {
        let mut good = base(Operation::AnnounceProxy);
        good.dest_actor = 42;
        assert!(good.valid());
        let mut bad = good;
        bad.source_actor = 1;
        assert!(!bad.valid());
        let mut bad = good;
        bad.dest_actor = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.payload_len = 8;
        assert!(!bad.valid());
        let mut bad = good;
        bad.operation_data = 1;
        assert!(!bad.valid());
    }

    #[test]
    fn test_kill_proxy_shape() {
        let mut good = base(Operation::KillProxy);
        good.source_actor = 42;
        good.payload_len = 9;
        assert!(good.valid());
        let mut bad = good;
        bad.dest_actor = 1;
        assert!(!bad.valid());
        let mut bad = good;
        bad.payload_len = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.source_actor = 0;
        assert!(!bad.valid());
        let mut bad = good;
        bad.operation_data = 3;
        assert!(!bad.valid());
    }
}
