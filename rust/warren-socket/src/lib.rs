//! The Warren socket reactor.
//!
//! A single reactor thread owns a readiness poller (epoll on Linux,
//! kqueue on the BSDs and macOS) and a fixed table of 2^16 socket slots.
//! Every cross-thread request reaches the reactor through a control
//! channel paired with a self-pipe, so slot internals need no locking
//! beyond the narrow direct-write path.
//!
//! The crate knows nothing about services: [`SocketServer::poll`] yields
//! [`SocketEvent`]s tagged with an opaque owner token, and the embedding
//! runtime forwards them wherever it wants. [`SocketController`] is the
//! cheaply cloneable request side usable from any thread.
//!
//! ```no_run
//! use warren_socket::{Polled, SocketServer};
//!
//! let (mut server, controller) = SocketServer::pair().unwrap();
//! let (id, addr) = controller.listen(1, "127.0.0.1", 0, 32).unwrap();
//! println!("listening on {addr}");
//! controller.start(1, id);
//! std::thread::spawn(move || loop {
//!     match server.poll() {
//!         Polled::Exit => break,
//!         Polled::Event { event, .. } => println!("{:?}", event.kind),
//!     }
//! });
//! ```

mod address;
mod buffer;
mod poll;
mod server;
mod sys;

pub use address::{UdpAddress, UDP_ADDRESS_SIZE};
pub use server::{
    EventData, Polled, SocketController, SocketError, SocketEvent, SocketEventType, SocketServer,
    MAX_SOCKET,
};
