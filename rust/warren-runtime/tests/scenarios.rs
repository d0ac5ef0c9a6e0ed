//! End-to-end node scenarios: full thread topology, real sockets.
//!
//! Each test builds a node with scenario-specific service modules,
//! drives it from the outside (loopback sockets, channels handed into
//! the modules), and winds it down with `ABORT` so the run thread can be
//! joined. Assertions happen in the test body, because a panic inside a
//! service callback would be contained by the dispatcher, not fail the
//! test.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use warren_runtime::{
    run, Address, Config, Handle, LoggerModule, Message, MessageKind, ModuleRegistry, Payload,
    Service, ServiceError, ServiceScope, SessionPolicy, SocketData, SocketEventKind, UdpAddress,
};

fn base_modules() -> ModuleRegistry {
    let modules = ModuleRegistry::new();
    modules.install("logger", Arc::new(LoggerModule));
    modules
}

fn start_node(
    modules: ModuleRegistry,
    bootstrap: &str,
    logfile: Option<String>,
) -> thread::JoinHandle<()> {
    let mut config = Config::default();
    config.thread = 4;
    config.bootstrap = Some(bootstrap.to_string());
    config.logger = logfile;
    thread::spawn(move || {
        run(config, modules).expect("node runs to completion");
    })
}

fn parse_handle(addr: &str) -> Handle {
    match addr.parse().expect("handle address") {
        Address::Handle(h) => h,
        Address::Name(_) => panic!("expected a handle address, got {addr}"),
    }
}

fn text_of(message: &Message) -> &str {
    message.payload.as_text().unwrap_or("")
}

// ---------------------------------------------------------------------------
// Timer fires exactly once
// ---------------------------------------------------------------------------

struct TimerDriver {
    tx: Sender<(u32, Duration)>,
    session: i32,
    sentinel: i32,
    fired: u32,
    first_at: Option<Duration>,
    started: Instant,
}

impl Service for TimerDriver {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        self.session = scope.command("TIMEOUT", "10").unwrap().parse().unwrap();
        self.sentinel = scope.command("TIMEOUT", "40").unwrap().parse().unwrap();
        self.started = Instant::now();
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        if message.kind != MessageKind::Response {
            return;
        }
        if message.session == self.session {
            self.fired += 1;
            self.first_at.get_or_insert(self.started.elapsed());
        } else if message.session == self.sentinel {
            let _ = self
                .tx
                .send((self.fired, self.first_at.unwrap_or_default()));
            scope.command("ABORT", "");
        }
    }
}

#[test]
fn timer_fires_exactly_once() {
    let (tx, rx): (Sender<(u32, Duration)>, Receiver<(u32, Duration)>) = unbounded();
    let modules = base_modules();
    modules.install("timerdriver", {
        let tx = tx.clone();
        Arc::new(move || {
            Box::new(TimerDriver {
                tx: tx.clone(),
                session: 0,
                sentinel: 0,
                fired: 0,
                first_at: None,
                started: Instant::now(),
            }) as Box<dyn Service>
        })
    });
    let node = start_node(modules, "timerdriver", None);

    let (fired, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(fired, 1, "one response per TIMEOUT session");
    assert!(
        elapsed >= Duration::from_millis(90),
        "never fires early: {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(1), "fires promptly: {elapsed:?}");
    node.join().unwrap();
}

// ---------------------------------------------------------------------------
// Back-pressure: mailbox overload reporting
// ---------------------------------------------------------------------------

struct Sink {
    tx: Sender<(usize, usize)>,
}

impl Service for Sink {
    fn init(&mut self, _scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        match text_of(&message) {
            "block" => thread::sleep(Duration::from_millis(700)),
            "report" => {
                let first: usize = scope.command("STAT", "overload").unwrap().parse().unwrap();
                let second: usize = scope.command("STAT", "overload").unwrap().parse().unwrap();
                let _ = self.tx.send((first, second));
                scope.command("ABORT", "");
            }
            _ => {}
        }
    }
}

struct Flooder {
    sink: Handle,
}

impl Service for Flooder {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        let addr = scope
            .command("LAUNCH", "sink")
            .ok_or_else(|| ServiceError::new("can't launch sink"))?;
        self.sink = parse_handle(&addr);
        scope.command("TIMEOUT", "0");
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        if message.kind != MessageKind::Response {
            return;
        }
        let payload = vec![0u8; 1024];
        scope
            .send(self.sink, MessageKind::Client, SessionPolicy::None, b"block")
            .unwrap();
        for _ in 0..2000 {
            scope
                .send(self.sink, MessageKind::Client, SessionPolicy::None, &payload)
                .unwrap();
        }
        scope
            .send(self.sink, MessageKind::Client, SessionPolicy::None, b"report")
            .unwrap();
    }
}

#[test]
fn mailbox_overload_is_reported_once() {
    let (tx, rx) = unbounded();
    let modules = base_modules();
    modules.install("sink", {
        let tx = tx.clone();
        Arc::new(move || Box::new(Sink { tx: tx.clone() }) as Box<dyn Service>)
    });
    modules.install(
        "flooder",
        Arc::new(|| {
            Box::new(Flooder {
                sink: Handle::INVALID,
            }) as Box<dyn Service>
        }),
    );
    let logfile = std::env::temp_dir().join("warren-overload-test.log");
    let _ = std::fs::remove_file(&logfile);
    let node = start_node(
        modules,
        "flooder",
        Some(logfile.to_str().unwrap().to_string()),
    );

    let (first, second) = rx.recv_timeout(Duration::from_secs(20)).unwrap();
    assert!(first > 1024, "overload records a length past the threshold: {first}");
    assert_eq!(second, 0, "overload is read-and-cleared");
    node.join().unwrap();

    let log = std::fs::read_to_string(&logfile).unwrap();
    assert!(
        log.contains("May overload, message queue length ="),
        "overload diagnostic reaches the logger: {log}"
    );
    let _ = std::fs::remove_file(&logfile);
}

// ---------------------------------------------------------------------------
// Registry commands: REG / QUERY / NAME
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RegistryReport {
    reg1: String,
    reg2: String,
    alpha: Option<String>,
    beta: Option<String>,
    missing: Option<String>,
    rebind: Option<String>,
}

struct RegistryDriver {
    tx: Sender<RegistryReport>,
}

impl Service for RegistryDriver {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        scope.command("TIMEOUT", "0");
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, _message: Message) {
        let reg1 = scope.command("REG", "").unwrap();
        let reg2 = scope.command("REG", "").unwrap();
        scope.command("REG", ".alpha");
        let alpha = scope.command("QUERY", ".alpha");
        scope.command("NAME", &format!(".beta {}", reg1));
        let beta = scope.command("QUERY", ".beta");
        let missing = scope.command("QUERY", ".missing");
        let rebind = scope.command("NAME", &format!(".alpha {}", reg1));
        let _ = self.tx.send(RegistryReport {
            reg1,
            reg2,
            alpha,
            beta,
            missing,
            rebind,
        });
        scope.command("ABORT", "");
    }
}

#[test]
fn registry_commands_round_trip() {
    let (tx, rx) = unbounded();
    let modules = base_modules();
    modules.install("regdriver", {
        let tx = tx.clone();
        Arc::new(move || Box::new(RegistryDriver { tx: tx.clone() }) as Box<dyn Service>)
    });
    let node = start_node(modules, "regdriver", None);

    let report = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(report.reg1, report.reg2, "REG with no argument is idempotent");
    assert_eq!(report.alpha.as_deref(), Some(report.reg1.as_str()));
    assert_eq!(report.beta.as_deref(), Some(report.reg1.as_str()));
    assert_eq!(report.missing, None);
    assert_eq!(report.rebind, None, "names bind exactly once");
    node.join().unwrap();
}

// ---------------------------------------------------------------------------
// TCP echo through the reactor
// ---------------------------------------------------------------------------

struct EchoDriver {
    tx: Sender<SocketAddr>,
}

impl Service for EchoDriver {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        let (id, addr) = scope
            .socket_listen("127.0.0.1", 0, 32)
            .map_err(|e| ServiceError::new(e.to_string()))?;
        scope.socket_start(id);
        let _ = self.tx.send(addr);
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
            SocketEventKind::Close => {
                scope.command("ABORT", "");
            }
            _ => {}
        }
    }
}

#[test]
fn tcp_echo_round_trip() {
    let (tx, rx) = unbounded();
    let modules = base_modules();
    modules.install("echodriver", {
        let tx = tx.clone();
        Arc::new(move || Box::new(EchoDriver { tx: tx.clone() }) as Box<dyn Service>)
    });
    let node = start_node(modules, "echodriver", None);

    let addr = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"HELLO").unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut back = [0u8; 5];
    stream.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"HELLO");

    drop(stream);
    node.join().unwrap();
}

// ---------------------------------------------------------------------------
// UDP round trip with encoded peer address
// ---------------------------------------------------------------------------

struct UdpDriver {
    tx: Sender<SocketAddr>,
    id: i32,
}

impl Service for UdpDriver {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        let (id, bound) = scope
            .socket_udp(Some("127.0.0.1"), 0)
            .map_err(|e| ServiceError::new(e.to_string()))?;
        self.id = id;
        let _ = self.tx.send(bound.expect("bound udp socket"));
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        if message.kind == MessageKind::Response {
            scope.command("ABORT", "");
            return;
        }
        let Payload::Socket(event) = message.payload else {
            return;
        };
        if event.kind != SocketEventKind::Udp {
            return;
        }
        let Some(bytes) = event.data.as_bytes() else {
            return;
        };
        let len = event.ud as usize;
        if &bytes[..len] != b"PING" {
            return;
        }
        if let Some(peer) = UdpAddress::decode(&bytes[len..]) {
            let _ = scope.socket_udp_send(self.id, &peer, b"PONG".to_vec());
        }
        // Give the datagram a beat to flush, then wind down.
        scope.command("TIMEOUT", "20");
    }
}

#[test]
fn udp_round_trip() {
    let (tx, rx) = unbounded();
    let modules = base_modules();
    modules.install("udpdriver", {
        let tx = tx.clone();
        Arc::new(move || Box::new(UdpDriver { tx: tx.clone(), id: 0 }) as Box<dyn Service>)
    });
    let node = start_node(modules, "udpdriver", None);

    let addr = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"PING", addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut buf = [0u8; 16];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"PONG");
    assert_eq!(from, addr);
    node.join().unwrap();
}

// ---------------------------------------------------------------------------
// Retired destination answers pending senders with error messages
// ---------------------------------------------------------------------------

struct Blackhole;

impl Service for Blackhole {
    fn init(&mut self, _scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    fn dispatch(&mut self, _scope: &ServiceScope<'_>, message: Message) {
        if text_of(&message) == "block" {
            thread::sleep(Duration::from_millis(300));
        }
    }
}

struct Requester {
    tx: Sender<(Handle, i32)>,
    target: Handle,
    session: i32,
}

impl Service for Requester {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        let addr = scope
            .command("LAUNCH", "blackhole")
            .ok_or_else(|| ServiceError::new("can't launch blackhole"))?;
        self.target = parse_handle(&addr);
        scope
            .send(self.target, MessageKind::Client, SessionPolicy::None, b"block")
            .unwrap();
        self.session = scope
            .send(self.target, MessageKind::Client, SessionPolicy::Alloc, b"pending")
            .unwrap();
        scope.command("TIMEOUT", "0");
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        match message.kind {
            MessageKind::Response => {
                scope.command("KILL", &format!(":{:x}", self.target.raw()));
            }
            MessageKind::Error if message.session == self.session => {
                let _ = self.tx.send((message.source, message.session));
                scope.command("ABORT", "");
            }
            _ => {}
        }
    }
}

#[test]
fn retired_service_drains_with_error_replies() {
    let (tx, rx) = unbounded();
    let modules = base_modules();
    modules.install("blackhole", Arc::new(|| Box::new(Blackhole) as Box<dyn Service>));
    modules.install("requester", {
        let tx = tx.clone();
        Arc::new(move || {
            Box::new(Requester {
                tx: tx.clone(),
                target: Handle::INVALID,
                session: 0,
            }) as Box<dyn Service>
        })
    });
    let node = start_node(modules, "requester", None);

    let (source, session) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(session > 0, "error reply echoes the pending session");
    assert!(source.is_valid(), "error reply names the dead destination");
    // Graceful shutdown: every runtime thread returns.
    node.join().unwrap();
}

// ---------------------------------------------------------------------------
// FIFO ordering between one sender and one receiver
// ---------------------------------------------------------------------------

struct OrderSink {
    tx: Sender<Vec<u32>>,
    seen: Vec<u32>,
}

impl Service for OrderSink {
    fn init(&mut self, _scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        if let Some(bytes) = message.payload.as_bytes() {
            if bytes.len() == 4 {
                let value = u32::from_le_bytes(bytes.try_into().unwrap());
                self.seen.push(value);
                if self.seen.len() == 200 {
                    let _ = self.tx.send(std::mem::take(&mut self.seen));
                    scope.command("ABORT", "");
                }
            }
        }
    }
}

struct OrderDriver {
    sink: Handle,
}

impl Service for OrderDriver {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        let addr = scope
            .command("LAUNCH", "ordersink")
            .ok_or_else(|| ServiceError::new("can't launch ordersink"))?;
        self.sink = parse_handle(&addr);
        scope.command("TIMEOUT", "0");
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        if message.kind != MessageKind::Response {
            return;
        }
        for value in 0u32..200 {
            scope
                .send(
                    self.sink,
                    MessageKind::Client,
                    SessionPolicy::None,
                    &value.to_le_bytes(),
                )
                .unwrap();
        }
    }
}

#[test]
fn sends_from_one_service_arrive_in_order() {
    let (tx, rx) = unbounded();
    let modules = base_modules();
    modules.install("ordersink", {
        let tx = tx.clone();
        Arc::new(move || {
            Box::new(OrderSink {
                tx: tx.clone(),
                seen: Vec::new(),
            }) as Box<dyn Service>
        })
    });
    modules.install(
        "orderdriver",
        Arc::new(|| {
            Box::new(OrderDriver {
                sink: Handle::INVALID,
            }) as Box<dyn Service>
        }),
    );
    let node = start_node(modules, "orderdriver", None);

    let seen = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(seen, (0u32..200).collect::<Vec<u32>>());
    node.join().unwrap();
}

// ---------------------------------------------------------------------------
// Stuck-service detection (slow: blocks a worker for 12 s)
// ---------------------------------------------------------------------------

struct Sleeper {
    tx: Sender<(String, String)>,
}

impl Service for Sleeper {
    fn init(&mut self, _scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message) {
        if text_of(&message) != "block" {
            return;
        }
        // Span at least two monitor sweeps so the endless flag lands
        // before this callback returns.
        thread::sleep(Duration::from_secs(12));
        let first = scope.command("STAT", "endless").unwrap();
        let second = scope.command("STAT", "endless").unwrap();
        let _ = self.tx.send((first, second));
        scope.command("ABORT", "");
    }
}

struct StuckDriver;

impl Service for StuckDriver {
    fn init(&mut self, scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
        let addr = scope
            .command("LAUNCH", "sleeper")
            .ok_or_else(|| ServiceError::new("can't launch sleeper"))?;
        let sleeper = parse_handle(&addr);
        scope
            .send(sleeper, MessageKind::Client, SessionPolicy::None, b"block")
            .unwrap();
        Ok(())
    }

    fn dispatch(&mut self, _scope: &ServiceScope<'_>, _message: Message) {}
}

#[test]
fn stuck_service_is_flagged_by_the_monitor() {
    let (tx, rx) = unbounded();
    let modules = base_modules();
    modules.install("sleeper", {
        let tx = tx.clone();
        Arc::new(move || Box::new(Sleeper { tx: tx.clone() }) as Box<dyn Service>)
    });
    modules.install("stuckdriver", Arc::new(|| Box::new(StuckDriver) as Box<dyn Service>));
    let logfile = std::env::temp_dir().join("warren-stuck-test.log");
    let _ = std::fs::remove_file(&logfile);
    let node = start_node(
        modules,
        "stuckdriver",
        Some(logfile.to_str().unwrap().to_string()),
    );

    let (first, second) = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(first, "1", "endless flag set while the callback ran");
    assert_eq!(second, "0", "endless flag is read-and-cleared");
    node.join().unwrap();

    let log = std::fs::read_to_string(&logfile).unwrap();
    assert!(
        log.contains("maybe in an endless loop"),
        "monitor diagnostic reaches the logger: {log}"
    );
    let _ = std::fs::remove_file(&logfile);
}
