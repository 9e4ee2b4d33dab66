//! Configuration for a multiplexer node: cluster topology and protocol
//! tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Placement of one node within the cluster and the shared socket addresses.
///
/// Node index 0 is the master; indices `1..=num_slaves` are slaves. The
/// slave group may be an IPv4 multicast address (224.0.0.0/4), in which case
/// the master selects its interface for outgoing multicast and slaves join
/// the group; any other address enables broadcast on the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Number of slave nodes in the cluster.
    pub num_slaves: u32,
    /// This node's index: 0 for the master, 1..=num_slaves for slaves.
    pub node_index: u32,
    /// Host name or address of the master node.
    pub master_host: String,
    /// UDP port the master binds and slaves send to.
    pub master_port: u16,
    /// Multicast group or broadcast address the master sends to.
    pub slave_group: String,
    /// UDP port the slaves bind and the master sends to.
    pub slave_port: u16,
}

impl ClusterTopology {
    /// True for the coordinator node (index 0).
    pub fn is_master(&self) -> bool {
        self.node_index == 0
    }
}

/// Protocol tunables with the documented defaults.
///
/// All of these may also be adjusted after construction through the
/// setters on [`Multiplexer`](crate::Multiplexer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Times each master control broadcast is repeated on the wire.
    pub master_message_burst_size: u32,
    /// Times each slave control message is repeated on the wire.
    pub slave_message_burst_size: u32,
    /// How long a slave waits for any datagram between handshake bursts.
    pub connection_wait_timeout: Duration,
    /// Silence period after which a slave emits a ping burst.
    pub ping_timeout: Duration,
    /// Ping rounds before the silence is treated as a dead connection.
    /// Clamped to at least 2.
    pub max_ping_requests: u32,
    /// Receive wait slice before a slave emits a loss probe.
    pub receive_wait_timeout: Duration,
    /// Wait slice between a slave's barrier rendezvous bursts.
    pub barrier_wait_timeout: Duration,
    /// Master send window, in packets.
    pub send_buffer_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            master_message_burst_size: 1,
            slave_message_burst_size: 1,
            connection_wait_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(10),
            max_ping_requests: 3,
            receive_wait_timeout: Duration::from_millis(250),
            barrier_wait_timeout: Duration::from_millis(100),
            send_buffer_size: 20,
        }
    }
}

impl MuxConfig {
    /// Enforces the documented lower bounds (at least two ping rounds).
    pub fn clamped(mut self) -> Self {
        if self.max_ping_requests < 2 {
            self.max_ping_requests = 2;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = MuxConfig::default();
        assert_eq!(config.master_message_burst_size, 1);
        assert_eq!(config.slave_message_burst_size, 1);
        assert_eq!(config.connection_wait_timeout, Duration::from_millis(500));
        assert_eq!(config.ping_timeout, Duration::from_secs(10));
        assert_eq!(config.max_ping_requests, 3);
        assert_eq!(config.receive_wait_timeout, Duration::from_millis(250));
        assert_eq!(config.barrier_wait_timeout, Duration::from_millis(100));
        assert_eq!(config.send_buffer_size, 20);
    }

    #[test]
    fn clamp_enforces_minimum_ping_rounds() {
        let config = MuxConfig {
            max_ping_requests: 0,
            ..Default::default()
        };
        assert_eq!(config.clamped().max_ping_requests, 2);

        let config = MuxConfig {
            max_ping_requests: 7,
            ..Default::default()
        };
        assert_eq!(config.clamped().max_ping_requests, 7);
    }

    #[test]
    fn topology_roles() {
        let mut topology = ClusterTopology {
            num_slaves: 3,
            node_index: 0,
            master_host: "master".into(),
            master_port: 26000,
            slave_group: "239.255.0.1".into(),
            slave_port: 26001,
        };
        assert!(topology.is_master());
        topology.node_index = 2;
        assert!(!topology.is_master());
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = MuxConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: MuxConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.send_buffer_size, config.send_buffer_size);
        assert_eq!(back.ping_timeout, config.ping_timeout);
    }
}
