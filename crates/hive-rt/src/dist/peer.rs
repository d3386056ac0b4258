//! Per-connection peer state: handshake progress, sequence tracking,
//! frame assembly, and heartbeat accounting.
//!
//! One [`Peer`] exists per connection handle. It owns the outbound
//! frame buffer (drained by the host through the instance's `flush`)
//! and the strictly-increasing sequence counters: outbound stamped into
//! every frame, inbound checked against every arriving header. The
//! transport is expected to be ordered, so any gap is protocol
//! corruption and closes the connection.

use crate::actor::cell::ActorId;
use crate::codec::ByteSink;
use crate::error::Error;
use crate::node::NodeId;

use super::header::{Header, Operation};
use super::routing::ConnectionId;

/// Output buffer size beyond which the instance reports back-pressure.
pub const OUT_HIGH_WATER: usize = 64 * 1024;

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Waiting for the peer's `server_handshake`.
    AwaitingServerHandshake,
    /// Server handshake accepted; waiting for the confirming
    /// `client_handshake`.
    AwaitingClientHandshake,
    Ready,
    Closed,
}

/// Which side of the TCP connection we are. Feeds the deterministic
/// duplicate-connection tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    /// We accepted this connection.
    Server,
    /// We dialed this connection.
    Client,
}

/// What the lower layer is currently reading for this connection.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadPhase {
    Header,
    Payload(Header),
}

pub(crate) struct Peer {
    pub conn: ConnectionId,
    pub role: ConnRole,
    pub state: PeerState,
    /// Learned from the peer's server handshake.
    pub node: Option<NodeId>,
    /// The peer's published actor, if any.
    pub published: Option<ActorId>,
    pub read_phase: ReadPhase,
    seq_out: u64,
    seq_in: u64,
    /// Frames waiting for the host to flush.
    pub out_buf: Vec<u8>,
    // Heartbeat accounting, driven by `on_tick`.
    pub sent_since_tick: bool,
    pub received_since_tick: bool,
    pub ticks_without_rx: u32,
}

impl Peer {
    pub fn new(conn: ConnectionId, role: ConnRole) -> Peer {
        Peer {
            conn,
            role,
            state: PeerState::AwaitingServerHandshake,
            node: None,
            published: None,
            read_phase: ReadPhase::Header,
            seq_out: 0,
            seq_in: 0,
            out_buf: Vec::new(),
            sent_since_tick: false,
            received_since_tick: false,
            ticks_without_rx: 0,
        }
    }

    /// Append one frame to the outbound buffer, stamping the next
    /// sequence number.
    #[allow(clippy::too_many_arguments)]
    pub fn frame(
        &mut self,
        source_node: NodeId,
        operation: Operation,
        flags: u8,
        operation_data: u64,
        dest_node: NodeId,
        source_actor: ActorId,
        dest_actor: ActorId,
        payload: &[u8],
    ) {
        let hdr = Header {
            operation,
            flags,
            payload_len: payload.len() as u32,
            operation_data,
            source_node,
            dest_node,
            source_actor,
            dest_actor,
            sequence_number: self.next_seq_out(),
        };
        debug_assert!(hdr.valid(), "framing an invalid {:?} header", operation);
        self.push_frame(&hdr, payload);
    }

    /// Forward a routed frame: keep every header field except the
    /// sequence number, which belongs to this hop.
    pub fn forward_frame(&mut self, hdr: &Header, payload: &[u8]) {
        let hdr = Header { sequence_number: self.next_seq_out(), ..*hdr };
        self.push_frame(&hdr, payload);
    }

    fn push_frame(&mut self, hdr: &Header, payload: &[u8]) {
        let mut sink = ByteSink::with_capacity(super::header::HEADER_SIZE + payload.len());
        hdr.write_to(&mut sink);
        sink.put_bytes(payload);
        self.out_buf.extend_from_slice(sink.as_slice());
        self.sent_since_tick = true;
    }

    fn next_seq_out(&mut self) -> u64 {
        let seq = self.seq_out;
        self.seq_out += 1;
        seq
    }

    /// Validate the inbound sequence number of an accepted header.
    pub fn accept_seq(&mut self, hdr: &Header) -> Result<(), Error> {
        if hdr.sequence_number != self.seq_in {
            return Err(Error::OutOfOrderSequence {
                expected: self.seq_in,
                got: hdr.sequence_number,
            });
        }
        self.seq_in += 1;
        self.received_since_tick = true;
        Ok(())
    }

    pub fn over_high_water(&self) -> bool {
        self.out_buf.len() > OUT_HIGH_WATER
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
