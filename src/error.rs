use thiserror::Error;

use crate::protocol::message::WireError;

/// Operation-level faults surfaced to callers of the node API.
///
/// Datagram-level faults (malformed bodies, unknown correlation ids) are
/// logged and dropped at the transport seam and never appear here.
#[derive(Debug, Error)]
pub enum KadError {
    /// A lookup saw no progress within the operation timeout.
    #[error("lookup timed out before converging")]
    RoutingTimeout,

    /// A content lookup converged without a matching item.
    #[error("no content matched the lookup parameters")]
    ContentNotFound,

    /// Socket bind/send/receive failure, or a snapshot file fault.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    /// An outgoing message could not be encoded within the wire limits.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The node is shutting down; in-flight work is abandoned.
    #[error("node is shutting down")]
    Shutdown,

    /// A snapshot file did not parse.
    #[error("malformed snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}
