#![warn(missing_docs)]

//! Reliable, ordered, multi-stream broadcast transport for a master/slave
//! compute cluster over a single UDP socket.
//!
//! One master node and N slave nodes share one datagram socket: the master
//! sends via unicast, broadcast or IP multicast to all slaves, slaves reply
//! unicast to the master. Over that socket the [`Multiplexer`] carries any
//! number of independent logical byte streams ("pipes"), each offering:
//! - reliable ordered packet delivery master-to-slaves, driven by negative
//!   acknowledgments and a sliding acknowledgment window,
//! - a collective barrier,
//! - a collective reduction ([`gather`](Multiplexer::gather)) over one
//!   integer per node.
//!
//! Each node runs one background receiver thread; the public API blocks on
//! per-pipe condition variables.

pub mod config;
pub mod error;
pub mod fault;
pub mod metrics;
pub mod mux;
pub mod packet;
pub mod pipe;
pub mod protocol;

mod pool;
mod udp;

pub use config::{ClusterTopology, MuxConfig};
pub use error::{Result, TransportError};
pub use fault::DropFn;
pub use metrics::MetricsSnapshot;
pub use mux::Multiplexer;
pub use packet::Packet;
pub use pipe::PipeStats;
pub use protocol::{GatherOp, MAX_PAYLOAD_SIZE};
