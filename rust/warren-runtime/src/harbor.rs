//! The cross-node delivery hook.
//!
//! Handles carry a node id in their upper 8 bits; a destination whose
//! node id is neither zero nor the local id is remote. Actual transport
//! is an external collaborator: the embedding host may install a
//! [`RemoteSender`], otherwise remote sends are reported and dropped.

use std::sync::{Arc, PoisonError, RwLock};

use warren_core::{Handle, MessageKind, Payload};

/// Transport hook for messages addressed to another node.
pub trait RemoteSender: Send + Sync {
    fn send(
        &self,
        destination: Handle,
        source: Handle,
        kind: MessageKind,
        session: i32,
        payload: Payload,
    );
}

pub struct Harbor {
    node: u8,
    remote: RwLock<Option<Arc<dyn RemoteSender>>>,
}

impl Harbor {
    pub fn new(node: u8) -> Harbor {
        Harbor {
            node,
            remote: RwLock::new(None),
        }
    }

    /// The local node id.
    pub fn node(&self) -> u8 {
        self.node
    }

    /// True when `handle` lives on another node.
    pub fn is_remote(&self, handle: Handle) -> bool {
        handle.node() != 0 && handle.node() != self.node
    }

    /// Install the transport hook.
    pub fn install(&self, sender: Arc<dyn RemoteSender>) {
        *self.remote.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Forward a remote-addressed message; `false` when no transport is
    /// installed (the caller reports and drops).
    pub fn send(
        &self,
        destination: Handle,
        source: Handle,
        kind: MessageKind,
        session: i32,
        payload: Payload,
    ) -> bool {
        let sender = self
            .remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sender {
            Some(s) => {
                s.send(destination, source, kind, session, payload);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn remoteness_depends_on_node_bits() {
        let harbor = Harbor::new(2);
        assert!(!harbor.is_remote(Handle::assemble(2, 5)));
        assert!(!harbor.is_remote(Handle::assemble(0, 5)));
        assert!(harbor.is_remote(Handle::assemble(3, 5)));
    }

    #[test]
    fn send_without_transport_reports_failure() {
        let harbor = Harbor::new(1);
        assert!(!harbor.send(
            Handle::assemble(2, 1),
            Handle::assemble(1, 1),
            MessageKind::Client,
            0,
            Payload::Empty
        ));
    }

    #[test]
    fn installed_transport_receives_remote_sends() {
        struct Capture(Mutex<Vec<Handle>>);
        impl RemoteSender for Capture {
            fn send(&self, dest: Handle, _src: Handle, _k: MessageKind, _s: i32, _p: Payload) {
                self.0.lock().unwrap().push(dest);
            }
        }
        let harbor = Harbor::new(1);
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        harbor.install(Arc::clone(&capture) as Arc<dyn RemoteSender>);
        let dest = Handle::assemble(9, 42);
        assert!(harbor.send(dest, Handle::assemble(1, 1), MessageKind::Client, 7, Payload::Empty));
        assert_eq!(capture.0.lock().unwrap().as_slice(), &[dest]);
    }
}
