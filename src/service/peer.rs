//! One accepted client connection and its node-side counterpart.

use crate::node::NodeId;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// An accepted TCP connection, bound to the node chosen at accept time.
///
/// Owns both streams; dropping the peer closes them. The node binding is
/// stable for the peer's lifetime.
pub struct Peer {
    client: TcpStream,
    node_stream: TcpStream,
    node: NodeId,
    addr: SocketAddr,
}

impl Peer {
    pub(crate) fn new(
        client: TcpStream,
        node_stream: TcpStream,
        node: NodeId,
        addr: SocketAddr,
    ) -> Self {
        Self { client, node_stream, node, addr }
    }

    /// Handle of the client-facing socket; the peer table key.
    pub fn client_fd(&self) -> RawFd {
        self.client.as_raw_fd()
    }

    /// Handle of the node-facing socket.
    pub fn node_fd(&self) -> RawFd {
        self.node_stream.as_raw_fd()
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Client's remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn client_stream(&self) -> &TcpStream {
        &self.client
    }

    pub(crate) fn node_side(&self) -> &TcpStream {
        &self.node_stream
    }
}
