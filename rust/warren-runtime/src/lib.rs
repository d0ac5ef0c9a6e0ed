//! The Warren service runtime.
//!
//! Warren hosts many thousands of independent *services* in one process.
//! Each service is a single-threaded entity with a private mailbox,
//! identified by a 32-bit [`Handle`]; a fixed pool of worker threads
//! cooperatively dispatches mailbox messages so every service processes
//! its inbox serially while the process uses all cores. A hierarchical
//! timer wheel delivers delayed wake-ups at 10 ms resolution, and a
//! single-threaded socket reactor multiplexes non-blocking TCP/UDP I/O
//! into the same mailboxes.
//!
//! The usual embedding:
//!
//! ```no_run
//! use std::sync::Arc;
//! use warren_runtime::{run, Config, LoggerModule, ModuleRegistry};
//!
//! let modules = ModuleRegistry::new();
//! modules.install("logger", Arc::new(LoggerModule));
//! // ... install your own service modules, name one in `bootstrap` ...
//! run(Config::default(), modules).unwrap();
//! ```

mod command;
mod context;
mod dispatch;
mod harbor;
mod module;
mod monitor;
mod node;
mod queue;
mod registry;
mod scope;
mod service_log;
mod socket;
mod timer;

pub mod services;

pub use context::{current_handle, ServiceContext};
pub use harbor::{Harbor, RemoteSender};
pub use module::{Module, ModuleRegistry, Service, ServiceError, SignalHook};
pub use monitor::{StuckDispatch, WorkerMonitor};
pub use node::{run, LaunchError, Node, SendError, SessionPolicy, StartError};
pub use scope::ServiceScope;
pub use services::LoggerModule;

pub use warren_core::{
    Address, Config, Env, Handle, Message, MessageKind, Payload, SocketData, SocketEventKind,
    SocketMessage, MAX_PAYLOAD,
};
pub use warren_socket::{SocketError, UdpAddress};
