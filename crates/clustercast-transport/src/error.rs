//! Error types for the clustercast transport layer.

use thiserror::Error;

/// Errors surfaced by the multiplexer and its wire layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A host name in the cluster topology did not resolve to an IPv4 address.
    #[error("node {node}: unable to resolve {host}")]
    Resolve {
        /// Index of the node reporting the error.
        node: u32,
        /// The host name or group address that failed to resolve.
        host: String,
    },

    /// The UDP socket could not be created or bound to the local port.
    #[error("node {node}: unable to bind UDP socket to port {port}")]
    Bind {
        /// Index of the node reporting the error.
        node: u32,
        /// The local port the bind was attempted on.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// A socket option required by the topology could not be applied.
    #[error("node {node}: socket option {option} failed")]
    SocketOption {
        /// Index of the node reporting the error.
        node: u32,
        /// Name of the option that failed (e.g. `IP_ADD_MEMBERSHIP`).
        option: &'static str,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The cluster topology is internally inconsistent.
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// Why the topology was rejected.
        reason: String,
    },

    /// An operation referenced a pipe id that is not (or no longer) open.
    #[error("unknown pipe id {0}")]
    UnknownPipe(u32),

    /// A master-only operation was invoked on a slave, or vice versa.
    #[error("node {node}: {operation} is not valid on this node role")]
    WrongRole {
        /// Index of the node reporting the error.
        node: u32,
        /// The operation that was misused.
        operation: &'static str,
    },

    /// A payload exceeded the fixed per-packet capacity.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Maximum payload capacity of a packet.
        max: usize,
    },

    /// A control message failed to decode.
    #[error("invalid control message: {reason}")]
    InvalidMessage {
        /// Why the message was rejected.
        reason: String,
    },

    /// The receiver thread terminated on a fatal condition; all subsequent
    /// operations on this multiplexer fail with this error.
    #[error("node {node}: receiver terminated: {reason}")]
    ReceiverTerminated {
        /// Index of the node reporting the error.
        node: u32,
        /// Description of the fatal condition.
        reason: String,
    },

    /// Passthrough for socket I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
