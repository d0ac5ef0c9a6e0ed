//! The inter-service message model.
//!
//! Every interaction in the runtime (cross-service sends, timer
//! expirations, socket events) becomes a [`Message`] appended to the
//! destination service's mailbox. The payload is an owned value: the
//! dispatcher hands the whole message to the service callback by value,
//! so dropping it frees the payload and keeping (or forwarding) it is a
//! plain move. Senders that pass a borrowed slice get copy semantics;
//! senders that pass an owned buffer transfer it without copying.

use std::fmt;

use crate::handle::Handle;

/// Hard payload cap (24-bit length field on the wire): just under 16 MiB.
/// Sends above this limit fail synchronously.
pub const MAX_PAYLOAD: usize = (1 << 24) - 1;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The 8-bit message type tag. Values are stable wire constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Administrative text, rendered by the logger service.
    Text = 0,
    /// A reply correlated to a request by session id.
    Response = 1,
    /// Reserved.
    Multicast = 2,
    /// User-defined traffic.
    Client = 3,
    /// Runtime signals (log reopen and similar).
    System = 4,
    /// Cross-node traffic (delivered through the harbor hook).
    Harbor = 5,
    /// A socket reactor event; the payload is a [`SocketMessage`].
    Socket = 6,
    /// Delivery-failure notification.
    Error = 7,
}

impl MessageKind {
    /// Decode a wire tag. Unknown tags return `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => MessageKind::Text,
            1 => MessageKind::Response,
            2 => MessageKind::Multicast,
            3 => MessageKind::Client,
            4 => MessageKind::System,
            5 => MessageKind::Harbor,
            6 => MessageKind::Socket,
            7 => MessageKind::Error,
            _ => return None,
        })
    }

    /// The stable wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Text => "text",
            MessageKind::Response => "response",
            MessageKind::Multicast => "multicast",
            MessageKind::Client => "client",
            MessageKind::System => "system",
            MessageKind::Harbor => "harbor",
            MessageKind::Socket => "socket",
            MessageKind::Error => "error",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// An owned message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No payload (timer responses, error notifications, …).
    Empty,
    /// An opaque byte buffer, owned by the message.
    Bytes(Box<[u8]>),
    /// A socket reactor event.
    Socket(Box<SocketMessage>),
}

impl Payload {
    /// Length in bytes; socket events count their inline data.
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Bytes(b) => b.len(),
            Payload::Socket(m) => m.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the raw bytes of a `Bytes` payload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the bytes as UTF-8 text, if they are.
    pub fn as_text(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        if v.is_empty() {
            Payload::Empty
        } else {
            Payload::Bytes(v.into_boxed_slice())
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::from(s.into_bytes())
    }
}

impl From<SocketMessage> for Payload {
    fn from(m: SocketMessage) -> Self {
        Payload::Socket(Box::new(m))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One mailbox entry.
#[derive(Debug)]
pub struct Message {
    /// The sender's handle; [`Handle::INVALID`] for runtime-generated
    /// messages (timer responses, socket events, system signals).
    pub source: Handle,
    /// Request-response correlation id; `0` when no reply is expected.
    pub session: i32,
    /// The type tag.
    pub kind: MessageKind,
    /// The owned payload.
    pub payload: Payload,
}

impl Message {
    /// A runtime-generated message with no payload.
    pub fn system(kind: MessageKind, session: i32) -> Self {
        Message {
            source: Handle::INVALID,
            session,
            kind,
            payload: Payload::Empty,
        }
    }

    /// The timer expiration reply delivered to a waiting session.
    pub fn timer_response(session: i32) -> Self {
        Message::system(MessageKind::Response, session)
    }
}

// ---------------------------------------------------------------------------
// Socket events (service-facing)
// ---------------------------------------------------------------------------

/// Socket event discriminant as seen by services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketEventKind {
    /// TCP data arrived; `data` holds the bytes.
    Data = 1,
    /// A connect/bind/start completed; `data` holds the peer address text.
    Connect = 2,
    /// The socket closed.
    Close = 3,
    /// A listener accepted a connection; `ud` is the new socket id and
    /// `data` holds `ip:port` of the peer.
    Accept = 4,
    /// A fatal socket error; `data` holds the reason text.
    Error = 5,
    /// A UDP datagram arrived; `data` holds the bytes with the encoded
    /// peer address appended.
    Udp = 6,
    /// The write buffer crossed its warning threshold; `ud` is the
    /// buffered size in KiB.
    Warning = 7,
}

/// Event data variants: nothing, raw bytes, or short descriptive text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketData {
    None,
    Bytes(Box<[u8]>),
    Info(String),
}

impl SocketData {
    pub fn len(&self) -> usize {
        match self {
            SocketData::None => 0,
            SocketData::Bytes(b) => b.len(),
            SocketData::Info(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the bytes of a `Bytes` variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SocketData::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// A reactor event forwarded to the owning service as a `Socket` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketMessage {
    pub kind: SocketEventKind,
    /// The socket slot id the event concerns.
    pub id: i32,
    /// Event-dependent integer: byte count for data/udp, the accepted
    /// socket id for accept, KiB for warning, otherwise 0.
    pub ud: i32,
    pub data: SocketData,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        for tag in 0..=7u8 {
            let kind = MessageKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(MessageKind::from_tag(8), None);
        assert_eq!(MessageKind::Socket.tag(), 6);
        assert_eq!(MessageKind::Error.tag(), 7);
    }

    #[test]
    fn payload_from_empty_vec_is_empty() {
        let p = Payload::from(Vec::new());
        assert_eq!(p, Payload::Empty);
        assert!(p.is_empty());
    }

    #[test]
    fn payload_text_round_trip() {
        let p = Payload::from("May overload".to_string());
        assert_eq!(p.as_text(), Some("May overload"));
        assert_eq!(p.len(), 12);
    }

    #[test]
    fn timer_response_shape() {
        let m = Message::timer_response(42);
        assert_eq!(m.source, Handle::INVALID);
        assert_eq!(m.session, 42);
        assert_eq!(m.kind, MessageKind::Response);
        assert_eq!(m.payload, Payload::Empty);
    }

    #[test]
    fn max_payload_is_24_bits() {
        assert_eq!(MAX_PAYLOAD, 0x00ff_ffff);
    }
}
