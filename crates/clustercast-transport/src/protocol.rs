//! Wire format for data packets and control messages.
//!
//! Every datagram on the cluster socket is one of two shapes, distinguished
//! by its first word:
//!
//! - **Data packet** (`pipe_id != 0`): `u32 pipe_id | u32 stream_pos |
//!   payload`, sent master-to-slaves.
//! - **Control message** (`pipe_id == 0`): a fixed-size struct, either a
//!   [`MasterMessage`] (master-to-slaves) or a [`SlaveMessage`]
//!   (slave-to-master, unicast).
//!
//! All multi-word fields travel in native byte order; the cluster is assumed
//! homogeneous and datagrams never leave it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Pipe id value reserved for control messages.
pub const CONTROL_PIPE_ID: u32 = 0;

/// Maximum payload bytes carried by one data packet. Together with the
/// 8-byte packet header this fits a 1500-byte Ethernet MTU with room for
/// the IP and UDP headers.
pub const MAX_PAYLOAD_SIZE: usize = 1464;

/// Size of the data-packet wire header: pipe id + stream position.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Capacity of a full datagram buffer (header plus payload).
pub const DATAGRAM_CAPACITY: usize = PACKET_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Wire size of an encoded [`MasterMessage`].
pub const MASTER_MESSAGE_SIZE: usize = 20;

/// Wire size of an encoded [`SlaveMessage`].
pub const SLAVE_MESSAGE_SIZE: usize = 32;

// A slave reads every datagram into a packet buffer and reinterprets it as
// a control message when the leading word is zero, so control messages must
// fit the packet buffer.
const _: () = assert!(MASTER_MESSAGE_SIZE <= DATAGRAM_CAPACITY);
const _: () = assert!(SLAVE_MESSAGE_SIZE <= DATAGRAM_CAPACITY);

/// Discriminant of a master-to-slaves control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MasterMessageId {
    /// Handshake completion broadcast.
    Connection = 0,
    /// Liveness reply to a slave ping request.
    Ping = 1,
    /// Pipe-creation completion broadcast.
    CreatePipe = 2,
    /// Barrier completion broadcast.
    Barrier = 3,
    /// Gather completion broadcast carrying the folded value.
    Gather = 4,
}

impl MasterMessageId {
    fn from_wire(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Connection),
            1 => Ok(Self::Ping),
            2 => Ok(Self::CreatePipe),
            3 => Ok(Self::Barrier),
            4 => Ok(Self::Gather),
            other => Err(TransportError::InvalidMessage {
                reason: format!("unknown master message id {other}"),
            }),
        }
    }
}

/// Discriminant of a slave-to-master control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlaveMessageId {
    /// Handshake announcement, repeated until the master answers.
    Connection = 0,
    /// Liveness probe after a silence period.
    Ping = 1,
    /// Pipe-creation rendezvous message.
    CreatePipe = 2,
    /// Positive acknowledgment of the stream up to `stream_pos`.
    Acknowledgment = 3,
    /// Negative acknowledgment: a gap was observed at `stream_pos`.
    PacketLoss = 4,
    /// Barrier rendezvous message.
    Barrier = 5,
    /// Gather rendezvous message carrying the slave's contribution.
    Gather = 6,
}

impl SlaveMessageId {
    fn from_wire(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Connection),
            1 => Ok(Self::Ping),
            2 => Ok(Self::CreatePipe),
            3 => Ok(Self::Acknowledgment),
            4 => Ok(Self::PacketLoss),
            5 => Ok(Self::Barrier),
            6 => Ok(Self::Gather),
            other => Err(TransportError::InvalidMessage {
                reason: format!("unknown slave message id {other}"),
            }),
        }
    }
}

/// Control message broadcast by the master to the slave group.
///
/// Wire layout: `u32 0 | u8 id | 3 pad | u32 pipe_id | u32 barrier_id |
/// u32 master_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterMessage {
    /// Message discriminant.
    pub id: MasterMessageId,
    /// Pipe the message refers to (0 for connection/ping).
    pub pipe_id: u32,
    /// Barrier sequence number for barrier/gather completions.
    pub barrier_id: u32,
    /// Folded gather result (gather completions only).
    pub master_value: u32,
}

impl MasterMessage {
    /// Creates a message with all pipe/barrier fields zeroed.
    pub fn new(id: MasterMessageId) -> Self {
        Self {
            id,
            pipe_id: 0,
            barrier_id: 0,
            master_value: 0,
        }
    }

    /// Encodes the message into its fixed wire representation.
    pub fn encode(&self) -> [u8; MASTER_MESSAGE_SIZE] {
        let mut buf = [0u8; MASTER_MESSAGE_SIZE];
        buf[0..4].copy_from_slice(&CONTROL_PIPE_ID.to_ne_bytes());
        buf[4] = self.id as u8;
        buf[8..12].copy_from_slice(&self.pipe_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.barrier_id.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.master_value.to_ne_bytes());
        buf
    }

    /// Decodes a datagram previously produced by [`encode`](Self::encode).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MASTER_MESSAGE_SIZE {
            return Err(TransportError::InvalidMessage {
                reason: format!("master message truncated to {} bytes", buf.len()),
            });
        }
        if read_u32(buf, 0) != CONTROL_PIPE_ID {
            return Err(TransportError::InvalidMessage {
                reason: "master message without control marker".into(),
            });
        }
        Ok(Self {
            id: MasterMessageId::from_wire(buf[4])?,
            pipe_id: read_u32(buf, 8),
            barrier_id: read_u32(buf, 12),
            master_value: read_u32(buf, 16),
        })
    }
}

/// Control message unicast by a slave to the master.
///
/// Wire layout: `u32 0 | u8 id | 3 pad | u32 node_index | u32 pipe_id |
/// u32 barrier_id | u32 stream_pos | u32 packet_pos | u32 slave_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveMessage {
    /// Message discriminant.
    pub id: SlaveMessageId,
    /// Index of the sending slave (1-based).
    pub node_index: u32,
    /// Pipe the message refers to (0 for connection/ping).
    pub pipe_id: u32,
    /// Barrier sequence number for rendezvous messages.
    pub barrier_id: u32,
    /// The slave's current stream position (acknowledgment semantics).
    pub stream_pos: u32,
    /// Stream position of the datagram that revealed a gap.
    pub packet_pos: u32,
    /// The slave's gather contribution.
    pub slave_value: u32,
}

impl SlaveMessage {
    /// Creates a message for `pipe_id` with all positions zeroed.
    pub fn new(node_index: u32, id: SlaveMessageId, pipe_id: u32) -> Self {
        Self {
            id,
            node_index,
            pipe_id,
            barrier_id: 0,
            stream_pos: 0,
            packet_pos: 0,
            slave_value: 0,
        }
    }

    /// Encodes the message into its fixed wire representation.
    pub fn encode(&self) -> [u8; SLAVE_MESSAGE_SIZE] {
        let mut buf = [0u8; SLAVE_MESSAGE_SIZE];
        buf[0..4].copy_from_slice(&CONTROL_PIPE_ID.to_ne_bytes());
        buf[4] = self.id as u8;
        buf[8..12].copy_from_slice(&self.node_index.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.pipe_id.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.barrier_id.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.stream_pos.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.packet_pos.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.slave_value.to_ne_bytes());
        buf
    }

    /// Decodes a datagram previously produced by [`encode`](Self::encode).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SLAVE_MESSAGE_SIZE {
            return Err(TransportError::InvalidMessage {
                reason: format!("slave message truncated to {} bytes", buf.len()),
            });
        }
        if read_u32(buf, 0) != CONTROL_PIPE_ID {
            return Err(TransportError::InvalidMessage {
                reason: "slave message without control marker".into(),
            });
        }
        Ok(Self {
            id: SlaveMessageId::from_wire(buf[4])?,
            node_index: read_u32(buf, 8),
            pipe_id: read_u32(buf, 12),
            barrier_id: read_u32(buf, 16),
            stream_pos: read_u32(buf, 20),
            packet_pos: read_u32(buf, 24),
            slave_value: read_u32(buf, 28),
        })
    }
}

/// Returns true if the datagram is a data packet rather than a control
/// message. Zero-length datagrams are neither.
pub fn is_data_datagram(buf: &[u8]) -> bool {
    buf.len() >= PACKET_HEADER_SIZE && read_u32(buf, 0) != CONTROL_PIPE_ID
}

/// Reduction operator for [`gather`](crate::Multiplexer::gather).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatherOp {
    /// Logical conjunction; operands are treated as booleans, result is 0/1.
    And,
    /// Logical disjunction; operands are treated as booleans, result is 0/1.
    Or,
    /// Unsigned minimum.
    Min,
    /// Unsigned maximum.
    Max,
    /// Wrapping unsigned sum.
    Sum,
    /// Wrapping unsigned product.
    Product,
}

impl GatherOp {
    /// Folds one operand into the accumulator.
    pub fn fold(self, acc: u32, value: u32) -> u32 {
        match self {
            GatherOp::And => u32::from(acc != 0 && value != 0),
            GatherOp::Or => u32::from(acc != 0 || value != 0),
            GatherOp::Min => acc.min(value),
            GatherOp::Max => acc.max(value),
            GatherOp::Sum => acc.wrapping_add(value),
            GatherOp::Product => acc.wrapping_mul(value),
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_message_roundtrip() {
        let mut msg = MasterMessage::new(MasterMessageId::Gather);
        msg.pipe_id = 7;
        msg.barrier_id = 42;
        msg.master_value = 0xDEAD_BEEF;

        let wire = msg.encode();
        assert_eq!(wire.len(), MASTER_MESSAGE_SIZE);
        assert_eq!(MasterMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn slave_message_roundtrip() {
        let mut msg = SlaveMessage::new(3, SlaveMessageId::PacketLoss, 9);
        msg.stream_pos = 1000;
        msg.packet_pos = 2464;

        let wire = msg.encode();
        assert_eq!(wire.len(), SLAVE_MESSAGE_SIZE);
        assert_eq!(SlaveMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_truncated() {
        let wire = MasterMessage::new(MasterMessageId::Ping).encode();
        assert!(MasterMessage::decode(&wire[..10]).is_err());

        let wire = SlaveMessage::new(1, SlaveMessageId::Ping, 0).encode();
        assert!(SlaveMessage::decode(&wire[..20]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_id() {
        let mut wire = MasterMessage::new(MasterMessageId::Ping).encode();
        wire[4] = 200;
        assert!(matches!(
            MasterMessage::decode(&wire),
            Err(TransportError::InvalidMessage { .. })
        ));

        let mut wire = SlaveMessage::new(1, SlaveMessageId::Ping, 0).encode();
        wire[4] = 200;
        assert!(SlaveMessage::decode(&wire).is_err());
    }

    #[test]
    fn decode_rejects_data_header() {
        // A data packet starts with a nonzero pipe id and must never decode
        // as a control message.
        let mut wire = [0u8; SLAVE_MESSAGE_SIZE];
        wire[0..4].copy_from_slice(&5u32.to_ne_bytes());
        assert!(SlaveMessage::decode(&wire).is_err());
        assert!(MasterMessage::decode(&wire).is_err());
        assert!(is_data_datagram(&wire));
    }

    #[test]
    fn data_datagram_detection() {
        assert!(!is_data_datagram(&[]));
        assert!(!is_data_datagram(&[1, 0, 0]));
        let wire = MasterMessage::new(MasterMessageId::Connection).encode();
        assert!(!is_data_datagram(&wire));
    }

    #[test]
    fn gather_fold_boolean_ops() {
        assert_eq!(GatherOp::And.fold(1, 7), 1);
        assert_eq!(GatherOp::And.fold(1, 0), 0);
        assert_eq!(GatherOp::And.fold(0, 1), 0);
        assert_eq!(GatherOp::Or.fold(0, 0), 0);
        assert_eq!(GatherOp::Or.fold(0, 9), 1);
    }

    #[test]
    fn gather_fold_arithmetic_ops() {
        assert_eq!(GatherOp::Min.fold(7, 3), 3);
        assert_eq!(GatherOp::Max.fold(7, 3), 7);
        assert_eq!(GatherOp::Sum.fold(u32::MAX, 2), 1);
        assert_eq!(GatherOp::Product.fold(1 << 31, 2), 0);
    }
}
