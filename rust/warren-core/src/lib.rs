//! Core types for the Warren service runtime.
//!
//! This crate defines the vocabulary shared by every other Warren crate:
//! service [`Handle`]s, the [`Message`] model with its payload ownership
//! rules, the process-wide [`Env`] string map, and the node [`Config`].
//! It contains no threads and no I/O; the runtime and reactor crates
//! build on top of it.

pub mod config;
pub mod env;
pub mod handle;
pub mod message;

pub use config::Config;
pub use env::Env;
pub use handle::{Address, AddressParseError, Handle};
pub use message::{
    Message, MessageKind, Payload, SocketData, SocketEventKind, SocketMessage, MAX_PAYLOAD,
};
