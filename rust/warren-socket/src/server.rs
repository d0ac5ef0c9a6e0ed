//! The socket reactor proper: slot table, command processing, event loop.
//!
//! One [`SocketServer`] is owned by a dedicated reactor thread; any number
//! of [`SocketController`] clones issue requests from other threads. A
//! request is a typed record on an unbounded channel plus one wake byte on
//! the self-pipe, so the poller observes "control data readable" like any
//! other source and drains exactly one command per loop iteration. Slot
//! internals stay single-threaded except the direct-write fast path, which
//! is guarded by the per-slot holding-slot mutex.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::address::{UdpAddress, TAG_UDP_V4, TAG_UDP_V6};
use crate::buffer::{raise_uncomplete, WriteBuffer, WriteList};
use crate::poll::{PollEvent, Poller, MAX_EVENT};
use crate::sys;

/// Size of the socket slot table.
pub const MAX_SOCKET: usize = 1 << 16;

/// Initial (and minimum) adaptive TCP read size.
const MIN_READ_BUFFER: usize = 64;

/// First write-buffer warning threshold; doubles each time it is crossed.
const WARNING_SIZE: i64 = 1024 * 1024;

/// Largest UDP datagram the reactor will receive.
const MAX_UDP_PACKAGE: usize = 65535;

/// Poller key of the control pipe.
const CTRL_KEY: u64 = u64::MAX;

/// Poller key marking an event cancelled by `clear_closed_event`.
const SKIP_KEY: u64 = u64::MAX - 1;

fn hash_id(id: i32) -> usize {
    id as u32 as usize % MAX_SOCKET
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported synchronously on the request side.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket id is closed or invalid")]
    Closed,
    #[error("socket slot table is full")]
    LimitReached,
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Slot state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Invalid = 0,
    /// Id allocated, no fd yet.
    Reserve = 1,
    /// Listen fd handed over, not yet watched.
    PListen = 2,
    /// Listen fd watched for accept.
    Listen = 3,
    /// Non-blocking connect in flight, watched for writability.
    Connecting = 4,
    /// Normal traffic.
    Connected = 5,
    /// No more writes accepted; closes once the write buffer drains.
    HalfClose = 6,
    /// Accepted fd not yet watched.
    PAccept = 7,
    /// Externally provided fd, watched.
    Bind = 8,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            1 => State::Reserve,
            2 => State::PListen,
            3 => State::Listen,
            4 => State::Connecting,
            5 => State::Connected,
            6 => State::HalfClose,
            7 => State::PAccept,
            8 => State::Bind,
            _ => State::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Protocol {
    Tcp = 0,
    Udp = 1,
    Udp6 = 2,
}

impl Protocol {
    fn from_u8(v: u8) -> Protocol {
        match v {
            1 => Protocol::Udp,
            2 => Protocol::Udp6,
            _ => Protocol::Tcp,
        }
    }

    fn matches_tag(self, tag: u8) -> bool {
        matches!(
            (self, tag),
            (Protocol::Udp, TAG_UDP_V4) | (Protocol::Udp6, TAG_UDP_V6)
        )
    }
}

/// A direct write that could not complete; the reactor drains it ahead of
/// the high-priority queue.
#[derive(Debug)]
struct DirectWrite {
    data: Vec<u8>,
    pos: usize,
}

/// Per-slot state shared between the reactor and request threads.
///
/// Request threads read the atomics to decide whether a direct write is
/// allowed; everything heavier stays reactor-private in [`SlotIo`]. The
/// `dw` mutex is the only lock: it guards the holding slot, and
/// `force_close` closes the fd while holding it, which keeps the raw-fd
/// write on the sender side race-free.
struct SlotShared {
    id: AtomicI32,
    state: AtomicU8,
    fd: AtomicI32,
    protocol: AtomicU8,
    udp_connecting: AtomicU16,
    /// Sum of bytes in both priority queues (the holding slot not included).
    wb_size: AtomicI64,
    /// Both priority queues empty; maintained by the reactor.
    queues_empty: AtomicBool,
    dw: Mutex<Option<DirectWrite>>,
    /// Peer associated by the `C` command; used when a send names no address.
    udp_peer: Mutex<Option<UdpAddress>>,
}

impl SlotShared {
    fn new() -> Self {
        SlotShared {
            id: AtomicI32::new(0),
            state: AtomicU8::new(State::Invalid as u8),
            fd: AtomicI32::new(-1),
            protocol: AtomicU8::new(Protocol::Tcp as u8),
            udp_connecting: AtomicU16::new(0),
            wb_size: AtomicI64::new(0),
            queues_empty: AtomicBool::new(true),
            dw: Mutex::new(None),
            udp_peer: Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn id(&self) -> i32 {
        self.id.load(Ordering::Acquire)
    }

    fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol.load(Ordering::Acquire))
    }

    /// The direct-write precondition: right id, connected, no queued
    /// bytes, and no UDP peer association in flight.
    fn can_direct_write(&self, id: i32) -> bool {
        self.id() == id
            && self.state() == State::Connected
            && self.queues_empty.load(Ordering::Acquire)
            && self.udp_connecting.load(Ordering::Acquire) == 0
    }
}

// ---------------------------------------------------------------------------
// Requests (the control-pipe command set)
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Request {
    /// `S`: attach a prepared socket to the poller.
    Start { id: i32, opaque: u64 },
    /// `B`: adopt an externally created fd.
    Bind { id: i32, fd: RawFd, opaque: u64 },
    /// `L`: adopt a bound+listening fd (not yet watched).
    Listen { id: i32, fd: RawFd, opaque: u64 },
    /// `K`: close, draining queued writes unless `shutdown`.
    Close { id: i32, shutdown: bool, opaque: u64 },
    /// `O`: initiate a TCP connect.
    Open { id: i32, opaque: u64, host: String, port: u16 },
    /// `X`: exit the reactor.
    Exit,
    /// `D`: send with high priority.
    Send { id: i32, data: Vec<u8> },
    /// `P`: send with low priority.
    SendLow { id: i32, data: Vec<u8> },
    /// `A`: send a UDP datagram.
    SendUdp { id: i32, data: Vec<u8>, address: UdpAddress },
    /// `T`: set a TCP-level socket option.
    SetOpt { id: i32, what: i32, value: i32 },
    /// `U`: adopt a UDP fd.
    Udp { id: i32, fd: RawFd, family: i32, opaque: u64 },
    /// `C`: associate a UDP peer address.
    SetUdpAddress { id: i32, address: UdpAddress },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Reactor event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventType {
    /// TCP data; `data` holds the bytes, `ud` the count.
    Data,
    /// Connect finished, bind adopted, or start applied; `data` holds
    /// short peer/status text.
    Open,
    /// Socket closed.
    Close,
    /// New connection accepted; `ud` is the new slot id, `data` the peer
    /// `ip:port`.
    Accept,
    /// Fatal socket error; `data` holds the reason.
    Error,
    /// UDP datagram; `data` holds the bytes with the encoded peer address
    /// appended, `ud` the datagram length.
    Udp,
    /// Write buffer crossed a warning threshold; `ud` is the size in KiB.
    Warning,
}

/// Event payload.
#[derive(Debug, PartialEq, Eq)]
pub enum EventData {
    None,
    Bytes(Vec<u8>),
    Text(String),
}

/// One reactor event, tagged with the opaque owner token given at
/// registration time.
#[derive(Debug)]
pub struct SocketEvent {
    pub kind: SocketEventType,
    pub opaque: u64,
    pub id: i32,
    pub ud: i32,
    pub data: EventData,
}

/// Outcome of one [`SocketServer::poll`] call.
#[derive(Debug)]
pub enum Polled {
    /// The exit command was processed; the reactor should shut down.
    Exit,
    /// One event. `waited` is true when this call blocked in the poller,
    /// i.e. the event starts a fresh batch.
    Event { event: SocketEvent, waited: bool },
}

/// Internal step result, mirroring the command/event handlers.
enum Step {
    Continue,
    Exit,
    Emit(SocketEvent),
}

enum ReadOut {
    Ignore,
    Emit(SocketEvent),
}

enum SendList {
    Done,
    Close(SocketEvent),
}

// ---------------------------------------------------------------------------
// Shared request-side state
// ---------------------------------------------------------------------------

struct Shared {
    slots: Vec<SlotShared>,
    alloc_id: AtomicI32,
    poller: Poller,
    tx: Sender<Request>,
    wake_fd: RawFd,
}

impl Shared {
    fn slot(&self, id: i32) -> &SlotShared {
        &self.slots[hash_id(id)]
    }

    /// Allocate a free slot id: monotonic counter modulo the table size,
    /// skipping in-use slots. Returns -1 when the table is full.
    fn reserve_id(&self) -> i32 {
        for _ in 0..MAX_SOCKET {
            let mut id = self.alloc_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id < 0 {
                id = self.alloc_id.fetch_and(0x7fff_ffff, Ordering::Relaxed) & 0x7fff_ffff;
            }
            let slot = &self.slots[hash_id(id)];
            if slot.state() == State::Invalid
                && slot
                    .state
                    .compare_exchange(
                        State::Invalid as u8,
                        State::Reserve as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                slot.id.store(id, Ordering::Release);
                slot.udp_connecting.store(0, Ordering::Release);
                slot.fd.store(-1, Ordering::Release);
                return id;
            }
        }
        -1
    }

    fn send_request(&self, req: Request) {
        if self.tx.send(req).is_err() {
            return;
        }
        loop {
            let n = unsafe { libc::write(self.wake_fd, b"w".as_ptr().cast(), 1) };
            if n >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("socket-server: send ctrl command error {err}");
                return;
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        sys::close(self.wake_fd);
    }
}

// ---------------------------------------------------------------------------
// SocketController (request side)
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle for issuing reactor requests from any thread.
#[derive(Clone)]
pub struct SocketController {
    shared: Arc<Shared>,
}

impl SocketController {
    /// Bind and listen on `host:port`, hand the fd to the reactor in the
    /// not-yet-watched state, and return the slot id with the bound
    /// address (useful with port 0). Traffic starts after [`start`].
    ///
    /// [`start`]: SocketController::start
    pub fn listen(
        &self,
        opaque: u64,
        host: &str,
        port: u16,
        backlog: i32,
    ) -> Result<(i32, SocketAddr), SocketError> {
        let (fd, _family) = do_bind(host, port, libc::SOCK_STREAM)?;
        let rc = unsafe { libc::listen(fd, backlog) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys::close(fd);
            return Err(err.into());
        }
        let addr = sys_local_addr(fd)?;
        let id = self.shared.reserve_id();
        if id < 0 {
            sys::close(fd);
            return Err(SocketError::LimitReached);
        }
        self.shared.send_request(Request::Listen { id, fd, opaque });
        Ok((id, addr))
    }

    /// Initiate a non-blocking TCP connect; the `Open` event reports the
    /// outcome. Name resolution happens on the reactor thread.
    pub fn connect(&self, opaque: u64, host: &str, port: u16) -> Result<i32, SocketError> {
        let id = self.shared.reserve_id();
        if id < 0 {
            return Err(SocketError::LimitReached);
        }
        self.shared.send_request(Request::Open {
            id,
            opaque,
            host: host.to_string(),
            port,
        });
        Ok(id)
    }

    /// Adopt an externally created fd (watched for readability).
    pub fn bind(&self, opaque: u64, fd: RawFd) -> Result<i32, SocketError> {
        let id = self.shared.reserve_id();
        if id < 0 {
            return Err(SocketError::LimitReached);
        }
        self.shared.send_request(Request::Bind { id, fd, opaque });
        Ok(id)
    }

    /// Begin delivering events for a prepared socket (accepted or
    /// listening), or transfer ownership of a connected one.
    pub fn start(&self, opaque: u64, id: i32) {
        self.shared.send_request(Request::Start { id, opaque });
    }

    /// Close after draining queued writes.
    pub fn close(&self, opaque: u64, id: i32) {
        self.shared.send_request(Request::Close {
            id,
            shutdown: false,
            opaque,
        });
    }

    /// Close immediately, discarding queued writes.
    pub fn shutdown(&self, opaque: u64, id: i32) {
        self.shared.send_request(Request::Close {
            id,
            shutdown: true,
            opaque,
        });
    }

    /// Ask the reactor thread to exit its loop.
    pub fn exit(&self) {
        self.shared.send_request(Request::Exit);
    }

    /// Set `TCP_NODELAY` on the socket.
    pub fn nodelay(&self, id: i32) {
        self.shared.send_request(Request::SetOpt {
            id,
            what: libc::TCP_NODELAY,
            value: 1,
        });
    }

    /// Send with high priority. If both queues are empty and the socket
    /// is connected, the bytes are written directly from this thread; a
    /// partial write parks the remainder in the holding slot and arms
    /// write-readiness.
    pub fn send(&self, id: i32, data: Vec<u8>) -> Result<(), SocketError> {
        let sh = self.shared.slot(id);
        if sh.id() != id || sh.state() == State::Invalid {
            return Err(SocketError::Closed);
        }
        if sh.can_direct_write(id) {
            if let Ok(mut dw) = sh.dw.try_lock() {
                if dw.is_none() && sh.can_direct_write(id) {
                    let fd = sh.fd();
                    let n = match sh.protocol() {
                        Protocol::Tcp => {
                            let n = unsafe {
                                libc::write(fd, data.as_ptr().cast(), data.len())
                            };
                            // On error let the reactor retry from offset 0.
                            if n < 0 {
                                0
                            } else {
                                n as usize
                            }
                        }
                        Protocol::Udp | Protocol::Udp6 => {
                            let peer = *sh.udp_peer.lock().expect("udp peer lock");
                            match peer {
                                Some(addr) => {
                                    let n = sendto_addr(fd, &data, &addr);
                                    if n == data.len() as isize {
                                        return Ok(());
                                    }
                                    // Queue through the reactor instead.
                                    drop(dw);
                                    self.shared.send_request(Request::Send { id, data });
                                    return Ok(());
                                }
                                None => {
                                    drop(dw);
                                    self.shared.send_request(Request::Send { id, data });
                                    return Ok(());
                                }
                            }
                        }
                    };
                    if n == data.len() {
                        return Ok(());
                    }
                    *dw = Some(DirectWrite { data, pos: n });
                    self.shared
                        .poller
                        .set_write(fd, hash_id(id) as u64, true);
                    return Ok(());
                }
            }
        }
        self.shared.send_request(Request::Send { id, data });
        Ok(())
    }

    /// Send with low priority; always queued through the reactor.
    pub fn send_lowpriority(&self, id: i32, data: Vec<u8>) -> Result<(), SocketError> {
        let sh = self.shared.slot(id);
        if sh.id() != id || sh.state() == State::Invalid {
            return Err(SocketError::Closed);
        }
        self.shared.send_request(Request::SendLow { id, data });
        Ok(())
    }

    /// Create a UDP socket. With an address (or nonzero port) the socket
    /// is bound and the bound address returned; otherwise it is an
    /// unbound v4 socket.
    pub fn udp(
        &self,
        opaque: u64,
        addr: Option<&str>,
        port: u16,
    ) -> Result<(i32, Option<SocketAddr>), SocketError> {
        let (fd, family, bound) = if addr.is_some() || port != 0 {
            let (fd, family) = do_bind(addr.unwrap_or(""), port, libc::SOCK_DGRAM)?;
            let local = sys_local_addr(fd)?;
            (fd, family, Some(local))
        } else {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            (fd, libc::AF_INET, None)
        };
        sys::set_nonblocking(fd);
        let id = self.shared.reserve_id();
        if id < 0 {
            sys::close(fd);
            return Err(SocketError::LimitReached);
        }
        self.shared.send_request(Request::Udp {
            id,
            fd,
            family,
            opaque,
        });
        Ok((id, bound))
    }

    /// Associate a default peer address with a UDP socket, so plain
    /// [`send`](SocketController::send) works on it.
    pub fn udp_connect(&self, id: i32, host: &str, port: u16) -> Result<(), SocketError> {
        let sh = self.shared.slot(id);
        if sh.id() != id || sh.state() == State::Invalid {
            return Err(SocketError::Closed);
        }
        let target = resolve_one(host, port)?;
        {
            // Block direct writes while the association is in flight.
            let _dw = sh.dw.lock().expect("dw lock");
            if sh.id() != id || sh.state() == State::Invalid {
                return Err(SocketError::Closed);
            }
            sh.udp_connecting.fetch_add(1, Ordering::AcqRel);
        }
        self.shared.send_request(Request::SetUdpAddress {
            id,
            address: UdpAddress::encode(target),
        });
        Ok(())
    }

    /// Send one datagram to an explicit peer.
    pub fn udp_send(
        &self,
        id: i32,
        address: &UdpAddress,
        data: Vec<u8>,
    ) -> Result<(), SocketError> {
        let sh = self.shared.slot(id);
        if sh.id() != id || sh.state() == State::Invalid {
            return Err(SocketError::Closed);
        }
        if !sh.protocol().matches_tag(address.tag()) {
            return Err(SocketError::InvalidAddress(format!(
                "{:?}",
                address.to_socket_addr()
            )));
        }
        if sh.can_direct_write(id) {
            if let Ok(dw) = sh.dw.try_lock() {
                if dw.is_none() && sh.can_direct_write(id) {
                    let n = sendto_addr(sh.fd(), &data, address);
                    if n >= 0 {
                        return Ok(());
                    }
                    // Let the reactor retry; datagram order is not promised.
                }
            }
        }
        self.shared.send_request(Request::SendUdp {
            id,
            data,
            address: *address,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request-side socket helpers
// ---------------------------------------------------------------------------

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    (host, port)
        .to_socket_addrs()
        .map_err(|_| SocketError::InvalidAddress(format!("{host}:{port}")))?
        .next()
        .ok_or_else(|| SocketError::InvalidAddress(format!("{host}:{port}")))
}

/// Create, configure and bind a socket; returns `(fd, address family)`.
fn do_bind(host: &str, port: u16, socktype: libc::c_int) -> Result<(RawFd, libc::c_int), SocketError> {
    let addr = resolve_one(host, port)?;
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, socktype, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if let Err(e) = sys::set_reuseaddr(fd) {
        sys::close(fd);
        return Err(e.into());
    }
    let (storage, len) = sys::to_storage(&addr);
    let rc = unsafe { libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        sys::close(fd);
        return Err(err.into());
    }
    Ok((fd, family))
}

fn sys_local_addr(fd: RawFd) -> Result<SocketAddr, SocketError> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    sys::from_storage(&storage, len)
        .ok_or_else(|| SocketError::InvalidAddress("unsupported family".to_string()))
}

fn sendto_addr(fd: RawFd, data: &[u8], address: &UdpAddress) -> isize {
    let (storage, len) = sys::to_storage(&address.to_socket_addr());
    unsafe {
        libc::sendto(
            fd,
            data.as_ptr().cast(),
            data.len(),
            0,
            (&storage as *const libc::sockaddr_storage).cast(),
            len,
        )
    }
}

// ---------------------------------------------------------------------------
// SlotIo (reactor-private per-slot state)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SlotIo {
    opaque: u64,
    high: WriteList,
    low: WriteList,
    read_size: usize,
    warn_size: i64,
}

// ---------------------------------------------------------------------------
// SocketServer (reactor side)
// ---------------------------------------------------------------------------

/// The reactor. Owned and driven by a single thread via [`poll`].
///
/// [`poll`]: SocketServer::poll
pub struct SocketServer {
    shared: Arc<Shared>,
    rx: Receiver<Request>,
    recv_fd: RawFd,
    io: Vec<SlotIo>,
    events: [PollEvent; MAX_EVENT],
    event_n: usize,
    event_index: usize,
    check_ctrl: bool,
    waited: bool,
    udp_scratch: Vec<u8>,
}

impl SocketServer {
    /// Create the reactor and its request handle.
    pub fn pair() -> io::Result<(SocketServer, SocketController)> {
        let poller = Poller::new()?;
        let (recv_fd, wake_fd) = sys::pipe()?;
        sys::set_nonblocking(recv_fd);
        if let Err(e) = poller.add(recv_fd, CTRL_KEY) {
            sys::close(recv_fd);
            sys::close(wake_fd);
            return Err(e);
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            slots: (0..MAX_SOCKET).map(|_| SlotShared::new()).collect(),
            alloc_id: AtomicI32::new(0),
            poller,
            tx,
            wake_fd,
        });
        let server = SocketServer {
            shared: Arc::clone(&shared),
            rx,
            recv_fd,
            io: (0..MAX_SOCKET).map(|_| SlotIo::default()).collect(),
            events: [PollEvent::default(); MAX_EVENT],
            event_n: 0,
            event_index: 0,
            check_ctrl: true,
            waited: false,
            udp_scratch: vec![0; MAX_UDP_PACKAGE],
        };
        Ok((server, SocketController { shared }))
    }

    /// Drive the reactor until it produces one event or the exit command.
    pub fn poll(&mut self) -> Polled {
        self.waited = false;
        loop {
            if self.check_ctrl {
                match self.rx.try_recv() {
                    Ok(req) => {
                        self.drain_wake_byte();
                        match self.process_request(req) {
                            Step::Continue => continue,
                            Step::Exit => return Polled::Exit,
                            Step::Emit(event) => {
                                self.clear_closed_event(&event);
                                return Polled::Event {
                                    event,
                                    waited: self.waited,
                                };
                            }
                        }
                    }
                    Err(_) => self.check_ctrl = false,
                }
            }
            if self.event_index == self.event_n {
                match self.shared.poller.wait(&mut self.events) {
                    Ok(n) => {
                        self.event_n = n;
                        self.event_index = 0;
                        self.check_ctrl = true;
                        self.waited = true;
                    }
                    Err(e) => {
                        if e.kind() != io::ErrorKind::Interrupted {
                            error!("socket-server: poll wait error {e}");
                        }
                        continue;
                    }
                }
                continue;
            }
            let e = self.events[self.event_index];
            self.event_index += 1;
            if e.key == CTRL_KEY || e.key == SKIP_KEY {
                // Control-pipe readability; commands are picked up at the
                // top of the loop once check_ctrl is set again.
                continue;
            }
            let idx = e.key as usize;
            let state = self.shared.slots[idx].state();
            match state {
                State::Connecting => {
                    let event = self.report_connect(idx);
                    return Polled::Event {
                        event,
                        waited: self.waited,
                    };
                }
                State::Listen => {
                    if let Some(event) = self.report_accept(idx) {
                        return Polled::Event {
                            event,
                            waited: self.waited,
                        };
                    }
                    continue;
                }
                State::Invalid => {
                    warn!("socket-server: event on invalid socket slot {idx}");
                    continue;
                }
                _ => {
                    if e.read {
                        let proto = self.shared.slots[idx].protocol();
                        let out = if proto == Protocol::Tcp {
                            self.tcp_read(idx)
                        } else {
                            self.udp_read(idx)
                        };
                        match out {
                            ReadOut::Emit(event) if event.kind == SocketEventType::Udp => {
                                // Re-examine the same event: more datagrams
                                // may be pending.
                                self.event_index -= 1;
                                return Polled::Event {
                                    event,
                                    waited: self.waited,
                                };
                            }
                            ReadOut::Emit(event) => {
                                let closeish = matches!(
                                    event.kind,
                                    SocketEventType::Close | SocketEventType::Error
                                );
                                if e.write && !closeish {
                                    // Handle the pending write on the next
                                    // visit of this event.
                                    self.events[self.event_index - 1].read = false;
                                    self.event_index -= 1;
                                }
                                return Polled::Event {
                                    event,
                                    waited: self.waited,
                                };
                            }
                            ReadOut::Ignore => {
                                if e.write {
                                    self.events[self.event_index - 1].read = false;
                                    self.event_index -= 1;
                                }
                                continue;
                            }
                        }
                    }
                    if e.write {
                        match self.send_buffer(idx) {
                            Some(event) => {
                                return Polled::Event {
                                    event,
                                    waited: self.waited,
                                }
                            }
                            None => continue,
                        }
                    }
                    if e.error {
                        let err = sys::socket_error(self.shared.slots[idx].fd());
                        let mut event = self.force_close(idx);
                        event.kind = SocketEventType::Error;
                        event.data = EventData::Text(err.to_string());
                        return Polled::Event {
                            event,
                            waited: self.waited,
                        };
                    }
                }
            }
        }
    }

    fn drain_wake_byte(&mut self) {
        let mut b = [0u8; 1];
        unsafe { libc::read(self.recv_fd, b.as_mut_ptr().cast(), 1) };
    }

    /// After a command closed a socket, cancel its still-pending events
    /// so a reused slot does not see stale readiness.
    fn clear_closed_event(&mut self, event: &SocketEvent) {
        if !matches!(event.kind, SocketEventType::Close | SocketEventType::Error) {
            return;
        }
        for i in self.event_index..self.event_n {
            let key = self.events[i].key;
            if key == CTRL_KEY || key == SKIP_KEY {
                continue;
            }
            let sh = &self.shared.slots[key as usize];
            if sh.state() == State::Invalid && sh.id() == event.id {
                self.events[i].key = SKIP_KEY;
                break;
            }
        }
    }

    // -- command processing -------------------------------------------------

    fn process_request(&mut self, req: Request) -> Step {
        match req {
            Request::Start { id, opaque } => self.start_socket(id, opaque),
            Request::Bind { id, fd, opaque } => self.bind_socket(id, fd, opaque),
            Request::Listen { id, fd, opaque } => self.listen_socket(id, fd, opaque),
            Request::Close {
                id,
                shutdown,
                opaque,
            } => self.close_socket(id, shutdown, opaque),
            Request::Open {
                id,
                opaque,
                host,
                port,
            } => self.open_socket(id, opaque, &host, port),
            Request::Exit => Step::Exit,
            Request::Send { id, data } => self.send_socket(id, data, Priority::High, None),
            Request::SendLow { id, data } => self.send_socket(id, data, Priority::Low, None),
            Request::SendUdp { id, data, address } => {
                self.send_socket(id, data, Priority::High, Some(address))
            }
            Request::SetOpt { id, what, value } => {
                self.setopt_socket(id, what, value);
                Step::Continue
            }
            Request::Udp {
                id,
                fd,
                family,
                opaque,
            } => {
                self.add_udp_socket(id, fd, family, opaque);
                Step::Continue
            }
            Request::SetUdpAddress { id, address } => self.set_udp_address(id, address),
        }
    }

    /// Install a freshly adopted fd in its reserved slot; `add` also
    /// registers it with the poller.
    fn new_fd(&mut self, id: i32, fd: RawFd, protocol: Protocol, opaque: u64, add: bool) -> bool {
        let idx = hash_id(id);
        let sh = &self.shared.slots[idx];
        debug_assert_eq!(sh.state(), State::Reserve);
        if add && self.shared.poller.add(fd, idx as u64).is_err() {
            sh.set_state(State::Invalid);
            return false;
        }
        let io = &mut self.io[idx];
        io.opaque = opaque;
        io.read_size = MIN_READ_BUFFER;
        io.warn_size = 0;
        io.high.clear();
        io.low.clear();
        sh.fd.store(fd, Ordering::Release);
        sh.protocol.store(protocol as u8, Ordering::Release);
        sh.wb_size.store(0, Ordering::Release);
        sh.queues_empty.store(true, Ordering::Release);
        *sh.dw.lock().expect("dw lock") = None;
        *sh.udp_peer.lock().expect("udp peer lock") = None;
        true
    }

    /// Close regardless of pending writes and recycle the slot. Returns
    /// the `Close` event shell (callers may rewrite kind/data).
    fn force_close(&mut self, idx: usize) -> SocketEvent {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let event = SocketEvent {
            kind: SocketEventType::Close,
            opaque: self.io[idx].opaque,
            id: sh.id(),
            ud: 0,
            data: EventData::None,
        };
        let state = sh.state();
        if state == State::Invalid {
            return event;
        }
        debug_assert_ne!(state, State::Reserve);
        self.io[idx].high.clear();
        self.io[idx].low.clear();
        sh.wb_size.store(0, Ordering::Release);
        sh.queues_empty.store(true, Ordering::Release);
        let fd = sh.fd();
        if state != State::PAccept && state != State::PListen {
            self.shared.poller.del(fd);
        }
        {
            let mut dw = sh.dw.lock().expect("dw lock");
            if state != State::Bind {
                sys::close(fd);
            }
            sh.fd.store(-1, Ordering::Release);
            sh.set_state(State::Invalid);
            *dw = None;
        }
        event
    }

    fn start_socket(&mut self, id: i32, opaque: u64) -> Step {
        let idx = hash_id(id);
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        if sh.state() == State::Invalid || sh.id() != id {
            return Step::Emit(SocketEvent {
                kind: SocketEventType::Error,
                opaque,
                id,
                ud: 0,
                data: EventData::Text("invalid socket".to_string()),
            });
        }
        match sh.state() {
            State::PAccept | State::PListen => {
                let was_listen = sh.state() == State::PListen;
                if let Err(e) = self.shared.poller.add(sh.fd(), idx as u64) {
                    let mut event = self.force_close(idx);
                    event.kind = SocketEventType::Error;
                    event.data = EventData::Text(e.to_string());
                    event.opaque = opaque;
                    return Step::Emit(event);
                }
                sh.set_state(if was_listen {
                    State::Listen
                } else {
                    State::Connected
                });
                self.io[idx].opaque = opaque;
                Step::Emit(SocketEvent {
                    kind: SocketEventType::Open,
                    opaque,
                    id,
                    ud: 0,
                    data: EventData::Text("start".to_string()),
                })
            }
            State::Connected => {
                // Transfer ownership to the requesting opaque.
                self.io[idx].opaque = opaque;
                Step::Emit(SocketEvent {
                    kind: SocketEventType::Open,
                    opaque,
                    id,
                    ud: 0,
                    data: EventData::Text("transfer".to_string()),
                })
            }
            // HalfClose: the close event is already on its way.
            _ => Step::Continue,
        }
    }

    fn bind_socket(&mut self, id: i32, fd: RawFd, opaque: u64) -> Step {
        if !self.new_fd(id, fd, Protocol::Tcp, opaque, true) {
            return Step::Emit(SocketEvent {
                kind: SocketEventType::Error,
                opaque,
                id,
                ud: 0,
                data: EventData::Text("reach socket number limit".to_string()),
            });
        }
        sys::set_nonblocking(fd);
        self.shared.slots[hash_id(id)].set_state(State::Bind);
        Step::Emit(SocketEvent {
            kind: SocketEventType::Open,
            opaque,
            id,
            ud: 0,
            data: EventData::Text("binding".to_string()),
        })
    }

    fn listen_socket(&mut self, id: i32, fd: RawFd, opaque: u64) -> Step {
        if !self.new_fd(id, fd, Protocol::Tcp, opaque, false) {
            sys::close(fd);
            return Step::Emit(SocketEvent {
                kind: SocketEventType::Error,
                opaque,
                id,
                ud: 0,
                data: EventData::Text("reach socket number limit".to_string()),
            });
        }
        // Not watched until the start command arrives.
        self.shared.slots[hash_id(id)].set_state(State::PListen);
        Step::Continue
    }

    fn open_socket(&mut self, id: i32, opaque: u64, host: &str, port: u16) -> Step {
        let idx = hash_id(id);
        let fail = |this: &mut Self, reason: String| {
            this.shared.slots[idx].set_state(State::Invalid);
            Step::Emit(SocketEvent {
                kind: SocketEventType::Error,
                opaque,
                id,
                ud: 0,
                data: EventData::Text(reason),
            })
        };
        let targets = match (host, port).to_socket_addrs() {
            Ok(t) => t,
            Err(e) => return fail(self, e.to_string()),
        };
        let mut sock = -1;
        let mut in_progress = false;
        let mut peer = None;
        for addr in targets {
            let family = match addr {
                SocketAddr::V4(_) => libc::AF_INET,
                SocketAddr::V6(_) => libc::AF_INET6,
            };
            let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                continue;
            }
            sys::set_keepalive(fd);
            sys::set_nonblocking(fd);
            let (storage, len) = sys::to_storage(&addr);
            let rc = unsafe {
                libc::connect(fd, (&storage as *const libc::sockaddr_storage).cast(), len)
            };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINPROGRESS) {
                    sys::close(fd);
                    continue;
                }
                in_progress = true;
            }
            sock = fd;
            peer = Some(addr);
            break;
        }
        if sock < 0 {
            return fail(self, io::Error::last_os_error().to_string());
        }
        if !self.new_fd(id, sock, Protocol::Tcp, opaque, true) {
            sys::close(sock);
            return fail(self, "reach socket number limit".to_string());
        }
        let sh = &self.shared.slots[idx];
        if in_progress {
            sh.set_state(State::Connecting);
            self.shared.poller.set_write(sock, idx as u64, true);
            Step::Continue
        } else {
            sh.set_state(State::Connected);
            let info = peer.map(|a| a.ip().to_string()).unwrap_or_default();
            Step::Emit(SocketEvent {
                kind: SocketEventType::Open,
                opaque,
                id,
                ud: 0,
                data: EventData::Text(info),
            })
        }
    }

    fn close_socket(&mut self, id: i32, shutdown: bool, opaque: u64) -> Step {
        let idx = hash_id(id);
        let sh = &self.shared.slots[idx];
        if sh.state() == State::Invalid || sh.id() != id {
            // Already gone.
            return Step::Emit(SocketEvent {
                kind: SocketEventType::Close,
                opaque,
                id,
                ud: 0,
                data: EventData::None,
            });
        }
        if !self.nomore_send_data(idx) {
            if let Some(event) = self.send_buffer(idx) {
                if event.kind != SocketEventType::Warning {
                    return Step::Emit(event);
                }
            }
        }
        if shutdown || self.nomore_send_data(idx) {
            let mut event = self.force_close(idx);
            event.id = id;
            event.opaque = opaque;
            return Step::Emit(event);
        }
        // Drain remaining writes first, then close.
        self.shared.slots[idx].set_state(State::HalfClose);
        Step::Continue
    }

    fn setopt_socket(&self, id: i32, what: i32, value: i32) {
        let sh = self.shared.slot(id);
        if sh.state() == State::Invalid || sh.id() != id {
            return;
        }
        let v: libc::c_int = value;
        unsafe {
            libc::setsockopt(
                sh.fd(),
                libc::IPPROTO_TCP,
                what,
                (&v as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    fn add_udp_socket(&mut self, id: i32, fd: RawFd, family: i32, opaque: u64) {
        let protocol = if family == libc::AF_INET6 {
            Protocol::Udp6
        } else {
            Protocol::Udp
        };
        if !self.new_fd(id, fd, protocol, opaque, true) {
            sys::close(fd);
            return;
        }
        self.shared.slots[hash_id(id)].set_state(State::Connected);
    }

    fn set_udp_address(&mut self, id: i32, address: UdpAddress) -> Step {
        let idx = hash_id(id);
        let sh = &self.shared.slots[idx];
        if sh.state() == State::Invalid || sh.id() != id {
            return Step::Continue;
        }
        if !sh.protocol().matches_tag(address.tag()) {
            return Step::Emit(SocketEvent {
                kind: SocketEventType::Error,
                opaque: self.io[idx].opaque,
                id,
                ud: 0,
                data: EventData::Text("protocol mismatch".to_string()),
            });
        }
        *sh.udp_peer.lock().expect("udp peer lock") = Some(address);
        sh.udp_connecting.fetch_sub(1, Ordering::AcqRel);
        Step::Continue
    }

    // -- sending ------------------------------------------------------------

    fn nomore_send_data(&self, idx: usize) -> bool {
        let sh = &self.shared.slots[idx];
        self.io[idx].high.is_empty()
            && self.io[idx].low.is_empty()
            && sh.dw.lock().expect("dw lock").is_none()
    }

    /// Queue (or directly deliver, for UDP) one outbound buffer.
    fn send_socket(
        &mut self,
        id: i32,
        data: Vec<u8>,
        priority: Priority,
        udp_address: Option<UdpAddress>,
    ) -> Step {
        let idx = hash_id(id);
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let state = sh.state();
        if state == State::Invalid
            || sh.id() != id
            || state == State::HalfClose
            || state == State::PAccept
        {
            return Step::Continue;
        }
        if state == State::PListen || state == State::Listen {
            error!("socket-server: write to listen socket {id}");
            return Step::Continue;
        }
        let fd = sh.fd();
        let queues_were_empty = self.io[idx].high.is_empty() && self.io[idx].low.is_empty();
        if queues_were_empty && state == State::Connected {
            if sh.protocol() == Protocol::Tcp {
                self.append(idx, WriteBuffer::new(data), Priority::High);
            } else {
                let address = udp_address.or(*sh.udp_peer.lock().expect("udp peer lock"));
                let Some(address) = address else {
                    debug!("socket-server: udp send on {id} with no peer address");
                    return Step::Continue;
                };
                let n = sendto_addr(fd, &data, &address);
                if n == data.len() as isize {
                    return Step::Continue;
                }
                self.append(idx, WriteBuffer::udp(data, address), priority);
            }
            self.shared.poller.set_write(fd, idx as u64, true);
        } else if sh.protocol() == Protocol::Tcp {
            self.append(idx, WriteBuffer::new(data), priority);
        } else {
            let address = udp_address.or(*sh.udp_peer.lock().expect("udp peer lock"));
            let Some(address) = address else {
                debug!("socket-server: udp send on {id} with no peer address");
                return Step::Continue;
            };
            self.append(idx, WriteBuffer::udp(data, address), priority);
        }
        let wb = sh.wb_size.load(Ordering::Acquire);
        if wb >= WARNING_SIZE && wb >= self.io[idx].warn_size {
            self.io[idx].warn_size = if self.io[idx].warn_size == 0 {
                WARNING_SIZE * 2
            } else {
                self.io[idx].warn_size * 2
            };
            return Step::Emit(SocketEvent {
                kind: SocketEventType::Warning,
                opaque: self.io[idx].opaque,
                id,
                ud: ((wb + 1023) / 1024) as i32,
                data: EventData::None,
            });
        }
        Step::Continue
    }

    fn append(&mut self, idx: usize, buffer: WriteBuffer, priority: Priority) {
        let sh = &self.shared.slots[idx];
        sh.wb_size
            .fetch_add(buffer.remaining_len() as i64, Ordering::AcqRel);
        sh.queues_empty.store(false, Ordering::Release);
        match priority {
            Priority::High => self.io[idx].high.push_back(buffer),
            Priority::Low => self.io[idx].low.push_back(buffer),
        }
    }

    /// Write-readiness handler: ingest the holding slot, flush high before
    /// low, promote a partial low head, close on drained half-close,
    /// signal the cleared warning threshold.
    fn send_buffer(&mut self, idx: usize) -> Option<SocketEvent> {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        // A sender thread in the direct-write path owns the lock right
        // now; it will arm write-readiness again if needed.
        let mut dw_guard = match sh.dw.try_lock() {
            Ok(g) => g,
            Err(_) => return None,
        };
        if let Some(dw) = dw_guard.take() {
            let remaining = dw.data.len() - dw.pos;
            sh.wb_size.fetch_add(remaining as i64, Ordering::AcqRel);
            sh.queues_empty.store(false, Ordering::Release);
            self.io[idx].high.push_front(WriteBuffer::resumed(dw.data, dw.pos));
        }
        drop(dw_guard);

        if let SendList::Close(event) = self.send_list(idx, Priority::High) {
            return Some(event);
        }
        if self.io[idx].high.is_empty() {
            if !self.io[idx].low.is_empty() {
                if let SendList::Close(event) = self.send_list(idx, Priority::Low) {
                    return Some(event);
                }
                if self.io[idx].low.front().is_some_and(|wb| wb.is_partial()) {
                    let io = &mut self.io[idx];
                    raise_uncomplete(&mut io.high, &mut io.low);
                    return None;
                }
                if !self.io[idx].low.is_empty() {
                    return None;
                }
            }
            // Both queues drained.
            debug_assert_eq!(sh.wb_size.load(Ordering::Acquire), 0);
            sh.queues_empty.store(true, Ordering::Release);
            self.shared.poller.set_write(sh.fd(), idx as u64, false);
            if sh.state() == State::HalfClose {
                return Some(self.force_close(idx));
            }
            if self.io[idx].warn_size > 0 {
                self.io[idx].warn_size = 0;
                return Some(SocketEvent {
                    kind: SocketEventType::Warning,
                    opaque: self.io[idx].opaque,
                    id: sh.id(),
                    ud: 0,
                    data: EventData::None,
                });
            }
        }
        None
    }

    fn send_list(&mut self, idx: usize, priority: Priority) -> SendList {
        if self.shared.slots[idx].protocol() == Protocol::Tcp {
            self.send_list_tcp(idx, priority)
        } else {
            self.send_list_udp(idx, priority)
        }
    }

    fn send_list_tcp(&mut self, idx: usize, priority: Priority) -> SendList {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let fd = sh.fd();
        loop {
            let list = match priority {
                Priority::High => &mut self.io[idx].high,
                Priority::Low => &mut self.io[idx].low,
            };
            let Some(head) = list.front_mut() else {
                return SendList::Done;
            };
            let chunk = head.remaining();
            let n = unsafe { libc::write(fd, chunk.as_ptr().cast(), chunk.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => {
                        return SendList::Done
                    }
                    _ => {
                        let mut event = self.force_close(idx);
                        event.kind = SocketEventType::Close;
                        return SendList::Close(event);
                    }
                }
            }
            sh.wb_size.fetch_sub(n as i64, Ordering::AcqRel);
            if (n as usize) < chunk.len() {
                head.advance(n as usize);
                return SendList::Done;
            }
            list.pop_front();
        }
    }

    fn send_list_udp(&mut self, idx: usize, priority: Priority) -> SendList {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let fd = sh.fd();
        loop {
            let list = match priority {
                Priority::High => &mut self.io[idx].high,
                Priority::Low => &mut self.io[idx].low,
            };
            let Some(head) = list.front() else {
                return SendList::Done;
            };
            let len = head.remaining_len();
            let Some(address) = head.udp_address else {
                // A TCP-shaped buffer on a UDP socket cannot be delivered.
                warn!("socket-server: dropping udp buffer with no address on {}", sh.id());
                sh.wb_size.fetch_sub(len as i64, Ordering::AcqRel);
                list.pop_front();
                continue;
            };
            let n = sendto_addr(fd, head.remaining(), &address);
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(e) if e == libc::EINTR || e == libc::EAGAIN || e == libc::EWOULDBLOCK => {
                        return SendList::Done
                    }
                    _ => {
                        warn!("socket-server: udp ({}) sendto error {err}", sh.id());
                        sh.wb_size.fetch_sub(len as i64, Ordering::AcqRel);
                        list.pop_front();
                        continue;
                    }
                }
            }
            sh.wb_size.fetch_sub(len as i64, Ordering::AcqRel);
            list.pop_front();
        }
    }

    // -- reading ------------------------------------------------------------

    fn tcp_read(&mut self, idx: usize) -> ReadOut {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let fd = sh.fd();
        let size = self.io[idx].read_size;
        let mut buf = vec![0u8; size];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), size) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => ReadOut::Ignore,
                Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => {
                    debug!("socket-server: EAGAIN capture");
                    ReadOut::Ignore
                }
                _ => {
                    let mut event = self.force_close(idx);
                    event.kind = SocketEventType::Error;
                    event.data = EventData::Text(err.to_string());
                    ReadOut::Emit(event)
                }
            };
        }
        if n == 0 {
            return ReadOut::Emit(self.force_close(idx));
        }
        if sh.state() == State::HalfClose {
            // Discard anything received while draining towards close.
            return ReadOut::Ignore;
        }
        let n = n as usize;
        if n == size {
            self.io[idx].read_size *= 2;
        } else if size > MIN_READ_BUFFER && n * 2 < size {
            self.io[idx].read_size /= 2;
        }
        buf.truncate(n);
        ReadOut::Emit(SocketEvent {
            kind: SocketEventType::Data,
            opaque: self.io[idx].opaque,
            id: sh.id(),
            ud: n as i32,
            data: EventData::Bytes(buf),
        })
    }

    fn udp_read(&mut self, idx: usize) -> ReadOut {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let fd = sh.fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut slen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                self.udp_scratch.as_mut_ptr().cast(),
                MAX_UDP_PACKAGE,
                0,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut slen,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(e) if e == libc::EINTR || e == libc::EAGAIN || e == libc::EWOULDBLOCK => {
                    ReadOut::Ignore
                }
                _ => {
                    let mut event = self.force_close(idx);
                    event.kind = SocketEventType::Error;
                    event.data = EventData::Text(err.to_string());
                    ReadOut::Emit(event)
                }
            };
        }
        let Some(peer) = sys::from_storage(&storage, slen) else {
            return ReadOut::Ignore;
        };
        let encoded = UdpAddress::encode(peer);
        if !sh.protocol().matches_tag(encoded.tag()) {
            return ReadOut::Ignore;
        }
        let n = n as usize;
        let mut data = Vec::with_capacity(n + encoded.as_bytes().len());
        data.extend_from_slice(&self.udp_scratch[..n]);
        data.extend_from_slice(encoded.as_bytes());
        ReadOut::Emit(SocketEvent {
            kind: SocketEventType::Udp,
            opaque: self.io[idx].opaque,
            id: sh.id(),
            ud: n as i32,
            data: EventData::Bytes(data),
        })
    }

    // -- connection progress ------------------------------------------------

    /// Writability on a connecting socket: the connect finished, one way
    /// or the other.
    fn report_connect(&mut self, idx: usize) -> SocketEvent {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let fd = sh.fd();
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let code = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut err as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if code < 0 || err != 0 {
            let reason = if code < 0 {
                io::Error::last_os_error().to_string()
            } else {
                io::Error::from_raw_os_error(err).to_string()
            };
            let mut event = self.force_close(idx);
            event.kind = SocketEventType::Error;
            event.data = EventData::Text(reason);
            return event;
        }
        sh.set_state(State::Connected);
        if self.nomore_send_data(idx) {
            self.shared.poller.set_write(fd, idx as u64, false);
        }
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut slen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let info = if unsafe {
            libc::getpeername(
                fd,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut slen,
            )
        } == 0
        {
            sys::from_storage(&storage, slen)
                .map(|a| a.ip().to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };
        SocketEvent {
            kind: SocketEventType::Open,
            opaque: self.io[idx].opaque,
            id: sh.id(),
            ud: 0,
            data: EventData::Text(info),
        }
    }

    /// Readability on a listening socket: accept one connection into a
    /// fresh slot (not yet watched). `None` means retry or transient
    /// failure; the listen socket survives EMFILE/ENFILE.
    fn report_accept(&mut self, idx: usize) -> Option<SocketEvent> {
        let shared = Arc::clone(&self.shared);
        let sh = &shared.slots[idx];
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut slen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client = unsafe {
            libc::accept(
                sh.fd(),
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut slen,
            )
        };
        if client < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(e) if e == libc::EMFILE || e == libc::ENFILE => Some(SocketEvent {
                    kind: SocketEventType::Error,
                    opaque: self.io[idx].opaque,
                    id: sh.id(),
                    ud: 0,
                    data: EventData::Text(err.to_string()),
                }),
                _ => None,
            };
        }
        let id = self.shared.reserve_id();
        if id < 0 {
            sys::close(client);
            return None;
        }
        sys::set_keepalive(client);
        sys::set_nonblocking(client);
        let listen_opaque = self.io[idx].opaque;
        if !self.new_fd(id, client, Protocol::Tcp, listen_opaque, false) {
            sys::close(client);
            return None;
        }
        self.shared.slots[hash_id(id)].set_state(State::PAccept);
        let info = sys::from_storage(&storage, slen)
            .map(|a| a.to_string())
            .unwrap_or_default();
        Some(SocketEvent {
            kind: SocketEventType::Accept,
            opaque: listen_opaque,
            id: sh.id(),
            ud: id,
            data: EventData::Text(info),
        })
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        for idx in 0..MAX_SOCKET {
            let state = self.shared.slots[idx].state();
            if state != State::Invalid && state != State::Reserve {
                self.force_close(idx);
            }
        }
        sys::close(self.recv_fd);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Priority {
    High,
    Low,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn expect_event(server: &mut SocketServer) -> SocketEvent {
        match server.poll() {
            Polled::Event { event, .. } => event,
            Polled::Exit => panic!("unexpected reactor exit"),
        }
    }

    #[test]
    fn reserve_id_skips_in_use_slots() {
        let (_server, controller) = SocketServer::pair().unwrap();
        let a = controller.shared.reserve_id();
        let b = controller.shared.reserve_id();
        assert!(a > 0 && b > 0);
        assert_ne!(a, b);
        assert_eq!(controller.shared.slot(a).state(), State::Reserve);
    }

    #[test]
    fn exit_command_stops_poll() {
        let (mut server, controller) = SocketServer::pair().unwrap();
        controller.exit();
        assert!(matches!(server.poll(), Polled::Exit));
    }

    #[test]
    fn listen_accept_data_echo() {
        let (mut server, controller) = SocketServer::pair().unwrap();
        let (listen_id, addr) = controller.listen(7, "127.0.0.1", 0, 32).unwrap();
        controller.start(7, listen_id);

        let event = expect_event(&mut server);
        assert_eq!(event.kind, SocketEventType::Open);
        assert_eq!(event.id, listen_id);

        let mut client = TcpStream::connect(addr).unwrap();
        let event = expect_event(&mut server);
        assert_eq!(event.kind, SocketEventType::Accept);
        assert_eq!(event.id, listen_id);
        let conn_id = event.ud;
        assert!(conn_id > 0);

        controller.start(7, conn_id);
        let event = expect_event(&mut server);
        assert_eq!(event.kind, SocketEventType::Open);

        client.write_all(b"HELLO").unwrap();
        let event = expect_event(&mut server);
        assert_eq!(event.kind, SocketEventType::Data);
        assert_eq!(event.id, conn_id);
        assert_eq!(event.data, EventData::Bytes(b"HELLO".to_vec()));

        controller.send(conn_id, b"HELLO".to_vec()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut back = [0u8; 5];
        client.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"HELLO");

        // Peer close surfaces as a close event.
        drop(client);
        let event = expect_event(&mut server);
        assert_eq!(event.kind, SocketEventType::Close);
        assert_eq!(event.id, conn_id);
    }

    #[test]
    fn udp_round_trip_appends_peer_address() {
        let (mut server, controller) = SocketServer::pair().unwrap();
        let (id, bound) = controller.udp(9, Some("127.0.0.1"), 0).unwrap();
        let local = bound.unwrap();

        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"PING", local).unwrap();

        let event = expect_event(&mut server);
        assert_eq!(event.kind, SocketEventType::Udp);
        assert_eq!(event.id, id);
        assert_eq!(event.ud, 4);
        let EventData::Bytes(data) = event.data else {
            panic!("udp event carries bytes");
        };
        assert_eq!(&data[..4], b"PING");
        let from = UdpAddress::decode(&data[4..]).unwrap();
        assert_eq!(from.to_socket_addr(), peer.local_addr().unwrap());

        controller.udp_send(id, &from, b"PONG".to_vec()).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PONG");
    }

    #[test]
    fn send_to_unknown_id_fails_synchronously() {
        let (_server, controller) = SocketServer::pair().unwrap();
        assert!(matches!(
            controller.send(12345, b"x".to_vec()),
            Err(SocketError::Closed)
        ));
    }
}
