//! Glue between the socket reactor and the service world.
//!
//! The reactor knows nothing about services; this module runs it on a
//! dedicated thread and converts every [`SocketEvent`] into a `Socket`
//! message pushed at the owning service's mailbox, the same delivery
//! path as any inter-service send.

use std::sync::Arc;

use tracing::debug;
use warren_core::{
    Handle, Message, MessageKind, Payload, SocketData, SocketEventKind, SocketMessage,
};
use warren_socket::{EventData, Polled, SocketEvent, SocketEventType, SocketServer};

use crate::node::Node;

/// The reactor thread body: poll until the exit command, forwarding
/// events and waking workers once per fresh poll batch.
pub(crate) fn socket_thread(node: Arc<Node>, mut server: SocketServer) {
    loop {
        match server.poll() {
            Polled::Exit => break,
            Polled::Event { event, waited } => {
                forward(&node, event);
                if waited {
                    node.gate().wakeup(0);
                } else if node.total_services() == 0 {
                    break;
                }
            }
        }
    }
}

fn forward(node: &Node, event: SocketEvent) {
    let kind = match event.kind {
        SocketEventType::Data => SocketEventKind::Data,
        SocketEventType::Open => SocketEventKind::Connect,
        SocketEventType::Close => SocketEventKind::Close,
        SocketEventType::Accept => SocketEventKind::Accept,
        SocketEventType::Error => SocketEventKind::Error,
        SocketEventType::Udp => SocketEventKind::Udp,
        SocketEventType::Warning => SocketEventKind::Warning,
    };
    let data = match event.data {
        EventData::None => SocketData::None,
        EventData::Bytes(bytes) => SocketData::Bytes(bytes.into_boxed_slice()),
        EventData::Text(text) => SocketData::Info(text),
    };
    let owner = Handle::from_raw(event.opaque as u32);
    let message = Message {
        source: Handle::INVALID,
        session: 0,
        kind: MessageKind::Socket,
        payload: Payload::from(SocketMessage {
            kind,
            id: event.id,
            ud: event.ud,
            data,
        }),
    };
    // Closing here would block the reactor loop; a dead owner just
    // loses the event.
    if node.push_message(owner, message).is_err() {
        debug!("socket event for dead service {}", owner);
    }
}
