//! The API surface a service sees while it runs.
//!
//! A [`ServiceScope`] borrows the node and the service's own context for
//! the duration of one `init` or `dispatch` call. It carries the send
//! operations (copying and ownership-transferring), the administrative
//! command channel, and the socket requests (tagged with this service's
//! handle as the owner).

use std::net::SocketAddr;
use std::sync::Arc;

use warren_core::{Address, Handle, MessageKind, Payload};
use warren_socket::{SocketError, UdpAddress};

use crate::command;
use crate::context::ServiceContext;
use crate::node::{Node, SendError, SessionPolicy};

/// One service's view of the runtime during a callback.
pub struct ServiceScope<'a> {
    node: &'a Arc<Node>,
    ctx: &'a Arc<ServiceContext>,
}

impl<'a> ServiceScope<'a> {
    pub(crate) fn new(node: &'a Arc<Node>, ctx: &'a Arc<ServiceContext>) -> ServiceScope<'a> {
        ServiceScope { node, ctx }
    }

    /// This service's handle.
    pub fn handle(&self) -> Handle {
        self.ctx.handle()
    }

    /// The hosting node.
    pub fn node(&self) -> &Arc<Node> {
        self.node
    }

    /// Allocate a fresh request session.
    pub fn new_session(&self) -> i32 {
        self.ctx.new_session()
    }

    fn resolve_session(&self, policy: SessionPolicy) -> i32 {
        match policy {
            SessionPolicy::None => 0,
            SessionPolicy::Assigned(session) => session,
            SessionPolicy::Alloc => self.ctx.new_session(),
        }
    }

    /// Send a copy of `payload` to `destination`. The caller keeps
    /// ownership of the slice. Returns the session.
    pub fn send(
        &self,
        destination: Handle,
        kind: MessageKind,
        session: SessionPolicy,
        payload: &[u8],
    ) -> Result<i32, SendError> {
        let session = self.resolve_session(session);
        self.node.send_message(
            self.handle(),
            destination,
            kind,
            session,
            Payload::from(payload.to_vec()),
        )
    }

    /// Send an owned buffer without copying.
    pub fn send_owned(
        &self,
        destination: Handle,
        kind: MessageKind,
        session: SessionPolicy,
        payload: Vec<u8>,
    ) -> Result<i32, SendError> {
        let session = self.resolve_session(session);
        self.node
            .send_message(self.handle(), destination, kind, session, Payload::from(payload))
    }

    /// Send to a textual address (`:hex` or `.name`).
    pub fn send_name(
        &self,
        destination: &str,
        kind: MessageKind,
        session: SessionPolicy,
        payload: &[u8],
    ) -> Result<i32, SendError> {
        let address: Address = destination
            .parse()
            .map_err(|_| SendError::UnknownName(destination.to_string()))?;
        let handle = match address {
            Address::Handle(h) => h,
            Address::Name(name) => self
                .node
                .find_name(&name)
                .ok_or(SendError::UnknownName(destination.to_string()))?,
        };
        self.send(handle, kind, session, payload)
    }

    /// Execute an administrative command (string in, string out).
    pub fn command(&self, name: &str, param: &str) -> Option<String> {
        command::execute(self.node, self.ctx, name, param)
    }

    // -- socket requests ----------------------------------------------------

    fn opaque(&self) -> u64 {
        u64::from(self.handle().raw())
    }

    /// Listen on `host:port` (port 0 picks an ephemeral port). The
    /// socket delivers events only after [`socket_start`].
    ///
    /// [`socket_start`]: ServiceScope::socket_start
    pub fn socket_listen(
        &self,
        host: &str,
        port: u16,
        backlog: i32,
    ) -> Result<(i32, SocketAddr), SocketError> {
        self.node
            .socket_controller()
            .listen(self.opaque(), host, port, backlog)
    }

    /// Begin a non-blocking TCP connect; completion arrives as a socket
    /// `Connect` (or `Error`) message.
    pub fn socket_connect(&self, host: &str, port: u16) -> Result<i32, SocketError> {
        self.node.socket_controller().connect(self.opaque(), host, port)
    }

    /// Adopt an external fd.
    pub fn socket_bind(&self, fd: std::os::unix::io::RawFd) -> Result<i32, SocketError> {
        self.node.socket_controller().bind(self.opaque(), fd)
    }

    /// Start delivering events for a socket, claiming ownership.
    pub fn socket_start(&self, id: i32) {
        self.node.socket_controller().start(self.opaque(), id);
    }

    /// Close after queued writes drain.
    pub fn socket_close(&self, id: i32) {
        self.node.socket_controller().close(self.opaque(), id);
    }

    /// Close immediately, discarding queued writes.
    pub fn socket_shutdown(&self, id: i32) {
        self.node.socket_controller().shutdown(self.opaque(), id);
    }

    /// Set `TCP_NODELAY`.
    pub fn socket_nodelay(&self, id: i32) {
        self.node.socket_controller().nodelay(id);
    }

    /// High-priority send.
    pub fn socket_send(&self, id: i32, data: Vec<u8>) -> Result<(), SocketError> {
        self.node.socket_controller().send(id, data)
    }

    /// Low-priority send.
    pub fn socket_send_lowpriority(&self, id: i32, data: Vec<u8>) -> Result<(), SocketError> {
        self.node.socket_controller().send_lowpriority(id, data)
    }

    /// Create a UDP socket, optionally bound.
    pub fn socket_udp(
        &self,
        addr: Option<&str>,
        port: u16,
    ) -> Result<(i32, Option<SocketAddr>), SocketError> {
        self.node.socket_controller().udp(self.opaque(), addr, port)
    }

    /// Associate a default peer with a UDP socket.
    pub fn socket_udp_connect(&self, id: i32, host: &str, port: u16) -> Result<(), SocketError> {
        self.node.socket_controller().udp_connect(id, host, port)
    }

    /// Send one datagram to an explicit peer.
    pub fn socket_udp_send(
        &self,
        id: i32,
        address: &UdpAddress,
        data: Vec<u8>,
    ) -> Result<(), SocketError> {
        self.node.socket_controller().udp_send(id, address, data)
    }
}
