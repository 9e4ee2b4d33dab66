//! The cluster socket: one bound UDP socket plus the fixed "other endpoint"
//! address (for the master the slave group, for a slave the master).
//!
//! Socket construction goes through `socket2` because the required options
//! (SO_REUSEADDR/SO_REUSEPORT before bind, the outgoing multicast
//! interface) are not reachable through `std::net::UdpSocket`. After setup
//! the socket converts into a plain `UdpSocket` for I/O.
//!
//! Receives are bounded: the socket carries a short read timeout and
//! [`Wire::recv_deadline`] polls in slices so the receiver thread observes
//! the shutdown flag promptly (there is no thread cancellation).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ClusterTopology;
use crate::error::{Result, TransportError};

/// Granularity at which blocking receives re-check deadline and shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound cluster socket and the peer address all transmissions go to.
pub(crate) struct Wire {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl Wire {
    /// Creates and configures the socket for the given node.
    ///
    /// Master and slaves bind INADDR_ANY on their respective ports. A
    /// multicast slave group makes the master select its interface for
    /// outgoing multicast and the slaves join the group; any other group
    /// address enables broadcast.
    pub fn open(topology: &ClusterTopology) -> Result<Self> {
        let node = topology.node_index;
        let master_addr = resolve_ipv4(&topology.master_host, node)?;
        let group_addr = resolve_ipv4(&topology.slave_group, node)?;
        let local_port = if topology.is_master() {
            topology.master_port
        } else {
            topology.slave_port
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(
            |source| TransportError::Bind {
                node,
                port: local_port,
                source,
            },
        )?;
        socket
            .set_reuse_address(true)
            .map_err(|source| TransportError::SocketOption {
                node,
                option: "SO_REUSEADDR",
                source,
            })?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(|source| TransportError::SocketOption {
                node,
                option: "SO_REUSEPORT",
                source,
            })?;
        socket
            .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)).into())
            .map_err(|source| TransportError::Bind {
                node,
                port: local_port,
                source,
            })?;

        if group_addr.is_multicast() {
            if topology.is_master() {
                // Route outgoing multicast through the interface that owns
                // the master address.
                socket.set_multicast_if_v4(&master_addr).map_err(|source| {
                    TransportError::SocketOption {
                        node,
                        option: "IP_MULTICAST_IF",
                        source,
                    }
                })?;
            } else {
                // Membership is per interface; INADDR_ANY follows the
                // default route, which is wrong for single-host clusters,
                // so join on loopback when the master lives there.
                let interface = if master_addr.is_loopback() {
                    master_addr
                } else {
                    Ipv4Addr::UNSPECIFIED
                };
                socket
                    .join_multicast_v4(&group_addr, &interface)
                    .map_err(|source| TransportError::SocketOption {
                        node,
                        option: "IP_ADD_MEMBERSHIP",
                        source,
                    })?;
            }
        } else {
            socket
                .set_broadcast(true)
                .map_err(|source| TransportError::SocketOption {
                    node,
                    option: "SO_BROADCAST",
                    source,
                })?;
        }

        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|source| TransportError::SocketOption {
                node,
                option: "SO_RCVTIMEO",
                source,
            })?;

        let socket: UdpSocket = socket.into();
        let peer = if topology.is_master() {
            SocketAddr::V4(SocketAddrV4::new(group_addr, topology.slave_port))
        } else {
            SocketAddr::V4(SocketAddrV4::new(master_addr, topology.master_port))
        };

        tracing::debug!(node, %peer, local_port, "cluster socket bound");
        Ok(Self { socket, peer })
    }

    /// Transmits one datagram to the other endpoint.
    pub fn send(&self, datagram: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(datagram, self.peer)
    }

    /// Receives one datagram, giving up after `timeout` or as soon as the
    /// stop flag is raised. Returns `None` in both of those cases; callers
    /// inspect the flag to tell them apart.
    pub fn recv_deadline(
        &self,
        buf: &mut [u8],
        timeout: Duration,
        stop: &AtomicBool,
    ) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            match self.socket.recv(buf) {
                Ok(len) => return Some(len),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
                Err(e) => {
                    // Transient receive errors are recoverable on a
                    // datagram socket; back off one poll slice.
                    tracing::warn!(error = %e, "socket receive error");
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Port the socket is actually bound to.
    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}

fn resolve_ipv4(host: &str, node: u32) -> Result<Ipv4Addr> {
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve {
            node,
            host: host.to_string(),
        })?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(TransportError::Resolve {
        node,
        host: host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterTopology;

    fn topology(node_index: u32, master_port: u16, slave_port: u16, group: &str) -> ClusterTopology {
        ClusterTopology {
            num_slaves: 1,
            node_index,
            master_host: "127.0.0.1".into(),
            master_port,
            slave_group: group.into(),
            slave_port,
        }
    }

    #[test]
    fn resolve_accepts_literal_addresses() {
        assert_eq!(
            resolve_ipv4("127.0.0.1", 0).unwrap(),
            Ipv4Addr::new(127, 0, 0, 1)
        );
        assert!(resolve_ipv4("definitely-not-a-host.invalid.", 3).is_err());
    }

    #[test]
    fn unicast_pair_exchanges_datagrams() {
        let master = Wire::open(&topology(0, 47101, 47102, "127.0.0.1")).unwrap();
        let slave = Wire::open(&topology(1, 47101, 47102, "127.0.0.1")).unwrap();
        let stop = AtomicBool::new(false);

        master.send(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let len = slave
            .recv_deadline(&mut buf, Duration::from_secs(2), &stop)
            .expect("datagram should arrive");
        assert_eq!(&buf[..len], b"hello");

        slave.send(b"reply").unwrap();
        let len = master
            .recv_deadline(&mut buf, Duration::from_secs(2), &stop)
            .expect("reply should arrive");
        assert_eq!(&buf[..len], b"reply");
    }

    #[test]
    fn multicast_group_delivery() {
        let master = Wire::open(&topology(0, 47103, 47104, "239.255.77.1")).unwrap();
        let slave = Wire::open(&topology(1, 47103, 47104, "239.255.77.1")).unwrap();
        let stop = AtomicBool::new(false);

        master.send(b"cast").unwrap();
        let mut buf = [0u8; 64];
        let len = slave
            .recv_deadline(&mut buf, Duration::from_secs(2), &stop)
            .expect("multicast datagram should arrive");
        assert_eq!(&buf[..len], b"cast");
    }

    #[test]
    fn recv_deadline_times_out() {
        let wire = Wire::open(&topology(1, 47105, 47106, "127.0.0.1")).unwrap();
        let stop = AtomicBool::new(false);
        let mut buf = [0u8; 16];
        let started = Instant::now();
        assert!(wire
            .recv_deadline(&mut buf, Duration::from_millis(150), &stop)
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn recv_deadline_honors_stop_flag() {
        let wire = Wire::open(&topology(1, 47107, 47108, "127.0.0.1")).unwrap();
        let stop = AtomicBool::new(true);
        let mut buf = [0u8; 16];
        let started = Instant::now();
        assert!(wire
            .recv_deadline(&mut buf, Duration::from_secs(30), &stop)
            .is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn local_port_reports_bound_port() {
        let wire = Wire::open(&topology(0, 47109, 47110, "127.0.0.1")).unwrap();
        assert_eq!(wire.local_port().unwrap(), 47109);
    }
}
