//! A TCP echo service, mostly useful as a smoke test for the reactor.
//!
//! Launch with `echo <host> <port>` (port 0 picks an ephemeral port).
//! Every accepted connection is started immediately and has its data
//! written straight back.

use warren_runtime::{
    Message, Module, Payload, Service, ServiceError, ServiceScope, SocketData, SocketEventKind,
};

pub struct EchoModule;

impl Module for EchoModule {
    fn create(&self) -> Box<dyn Service> {
        Box::new(Echo)
    }
}

struct Echo;

impl Service for Echo {
    fn init(&mut self, scope: &ServiceScope<'_>, args: &str) -> Result<(), ServiceError> {
        let mut parts = args.split_whitespace();
        let host = parts.next().unwrap_or("127.0.0.1");
        let port: u16 = parts
            .next()
            .unwrap_or("0")
            .parse()
            .map_err(|_| ServiceError::new(format!("bad echo port in {:?}", args)))?;
        let (id, addr) = scope
            .socket_listen(host, port, 32)
            .map_err(|e| ServiceError::new(format!("echo listen failed: {}", e)))?;
        scope.socket_start(id);
        scope
            .node()
            .report(scope.handle(), format!("echo listening on {}", addr));
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        let Payload::Socket(event) = message.payload else {
            return;
        };
        match event.kind {
            SocketEventKind::Accept => scope.socket_start(event.ud),
            SocketEventKind::Data => {
                if let SocketData::Bytes(bytes) = event.data {
                    let _ = scope.socket_send(event.id, bytes.into_vec());
                }
            }
            _ => {}
        }
    }
}
