//! Node assembly: shared state, service launch, sends, and the thread
//! topology (N workers + timer + monitor + reactor).
//!
//! The node owns every process-wide structure (registry, ready queue,
//! timer, module table, environment map, socket controller) and is
//! shared as an `Arc` by all threads. Shutdown is driven by the live
//! service count: when it reaches zero the timer thread tells the
//! reactor to exit and broadcasts the quit flag to the workers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use warren_core::{Config, Env, Handle, Message, MessageKind, Payload, MAX_PAYLOAD};
use warren_socket::{SocketController, SocketServer};

use crate::context::{NodeStats, ServiceContext};
use crate::dispatch;
use crate::harbor::Harbor;
use crate::module::{ModuleRegistry, ServiceError};
use crate::monitor::{WorkerMonitor, MONITOR_INTERVAL_SECS};
use crate::queue::{GlobalQueue, MessageQueue};
use crate::registry::HandleStore;
use crate::scope::ServiceScope;
use crate::socket;
use crate::timer::Timer;

/// Per-worker batch weights: the first four workers dispatch one message
/// per mailbox visit, the next four drain whole mailboxes, later groups
/// take 1/2, 1/4 and 1/8 of the queue length.
const WEIGHT: [i32; 32] = [
    -1, -1, -1, -1, 0, 0, 0, 0, //
    1, 1, 1, 1, 1, 1, 1, 1, //
    2, 2, 2, 2, 2, 2, 2, 2, //
    3, 3, 3, 3, 3, 3, 3, 3,
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Synchronous submission failures.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("payload exceeds the 16 MiB limit")]
    Oversize,
    #[error("destination {0} is not a live service")]
    InvalidDestination(Handle),
    #[error("unknown service name {0:?}")]
    UnknownName(String),
}

/// Failures launching a service.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unknown module {0:?}")]
    UnknownModule(String),
    #[error("service registry is full")]
    RegistryFull,
    #[error("init failed: {0}")]
    Init(#[from] ServiceError),
}

/// Fatal node startup failures.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("reactor startup failed: {0}")]
    Reactor(#[from] std::io::Error),
    #[error("can't launch {service:?} service: {source}")]
    Logger {
        service: String,
        #[source]
        source: LaunchError,
    },
    #[error("bootstrap error: {command:?}: {source}")]
    Bootstrap {
        command: String,
        #[source]
        source: LaunchError,
    },
}

/// How a send allocates its session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// No reply expected (session 0).
    None,
    /// The runtime allocates a fresh session from the sender.
    Alloc,
    /// The caller supplies the session (responses echo the request's).
    Assigned(i32),
}

// ---------------------------------------------------------------------------
// WorkerGate (wake-up discipline)
// ---------------------------------------------------------------------------

struct GateState {
    sleeping: usize,
    quit: bool,
}

/// The ready-queue condition variable and sleep accounting.
pub(crate) struct WorkerGate {
    count: usize,
    state: Mutex<GateState>,
    cond: Condvar,
}

impl WorkerGate {
    fn new(count: usize) -> WorkerGate {
        WorkerGate {
            count,
            state: Mutex::new(GateState {
                sleeping: 0,
                quit: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.count
    }

    /// Signal one sleeping worker iff at least `count - busy` are asleep.
    /// Spurious wakeups are harmless.
    pub(crate) fn wakeup(&self, busy: usize) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sleeping >= self.count - busy {
            self.cond.notify_one();
        }
    }

    /// Block until signalled (or until shutdown begins).
    pub(crate) fn sleep(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.quit {
            return;
        }
        state.sleeping += 1;
        state = self
            .cond
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
        state.sleeping -= 1;
    }

    pub(crate) fn quit_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.quit = true;
        self.cond.notify_all();
    }

    pub(crate) fn quitting(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .quit
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The runtime instance shared by every thread.
pub struct Node {
    config: Config,
    stats: Arc<NodeStats>,
    registry: HandleStore,
    global_queue: Arc<GlobalQueue>,
    modules: ModuleRegistry,
    env: Env,
    timer: Timer,
    harbor: Harbor,
    controller: SocketController,
    reactor: Mutex<Option<SocketServer>>,
    gate: WorkerGate,
    monitor_exit: AtomicU32,
    logger_cache: AtomicU32,
}

impl Node {
    /// Build a node. Failure to allocate the poller or control pipe is
    /// fatal.
    pub fn new(config: Config, modules: ModuleRegistry) -> Result<Arc<Node>, StartError> {
        let env = Env::new();
        config.seed_env(&env);
        let thread_count = if config.thread == 0 {
            num_cpus::get().max(1)
        } else {
            config.thread
        };
        let (server, controller) = SocketServer::pair()?;
        Ok(Arc::new(Node {
            stats: Arc::new(NodeStats::default()),
            registry: HandleStore::new(config.harbor),
            global_queue: GlobalQueue::new(),
            modules,
            env,
            timer: Timer::new(),
            harbor: Harbor::new(config.harbor),
            controller,
            reactor: Mutex::new(Some(server)),
            gate: WorkerGate::new(thread_count),
            monitor_exit: AtomicU32::new(0),
            logger_cache: AtomicU32::new(0),
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn harbor(&self) -> &Harbor {
        &self.harbor
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub(crate) fn registry(&self) -> &HandleStore {
        &self.registry
    }

    pub(crate) fn global_queue(&self) -> &Arc<GlobalQueue> {
        &self.global_queue
    }

    pub(crate) fn gate(&self) -> &WorkerGate {
        &self.gate
    }

    pub(crate) fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn socket_controller(&self) -> &SocketController {
        &self.controller
    }

    /// Live service count.
    pub fn total_services(&self) -> i32 {
        self.stats.total()
    }

    /// Wall-clock seconds at node startup.
    pub fn starttime(&self) -> u32 {
        self.timer.starttime()
    }

    /// 10 ms ticks since node startup.
    pub fn now(&self) -> u64 {
        self.timer.now()
    }

    pub fn find_name(&self, name: &str) -> Option<Handle> {
        self.registry.find_name(name)
    }

    /// Resolve a handle into a pinned context.
    pub fn lookup(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        self.registry.lookup(handle)
    }

    pub(crate) fn monitor_exit(&self) -> Handle {
        Handle::from_raw(self.monitor_exit.load(Ordering::Relaxed))
    }

    pub(crate) fn set_monitor_exit(&self, handle: Handle) {
        self.monitor_exit.store(handle.raw(), Ordering::Relaxed);
    }

    // -- service lifecycle --------------------------------------------------

    /// Create, register and initialize a service from a named module.
    pub fn launch(self: &Arc<Node>, module: &str, args: &str) -> Result<Handle, LaunchError> {
        let factory = self
            .modules
            .query(module)
            .ok_or_else(|| LaunchError::UnknownModule(module.to_string()))?;
        let instance = factory.create();
        let handle = self.registry.reserve().ok_or(LaunchError::RegistryFull)?;
        let queue = MessageQueue::new(handle, Arc::clone(&self.global_queue));
        let ctx = Arc::new(ServiceContext::new(
            handle,
            Arc::clone(&queue),
            instance,
            self.config.profile,
            Arc::clone(&self.stats),
        ));
        self.registry.commit(handle, Arc::clone(&ctx));
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let result = {
            let scope = ServiceScope::new(self, &ctx);
            ctx.with_instance(|svc| svc.init(&scope, args))
        };
        match result {
            Ok(()) => {
                ctx.set_initialized();
                ctx.capture_signal_hook();
                // First actual enqueue; the mailbox's in_global flag was
                // pre-set at creation.
                self.global_queue.push(queue);
                self.report(handle, format!("LAUNCH {} {}", module, args));
                Ok(handle)
            }
            Err(err) => {
                self.report(handle, format!("FAILED launch {}", module));
                self.registry.retire(handle);
                drop(ctx);
                // Answer anything that reached the mailbox during init.
                dispatch::release_queue(self, &queue);
                Err(LaunchError::Init(err))
            }
        }
    }

    /// Retire a handle: unregister and drop the registry's pin. The
    /// final drain happens when the last transient pin drops.
    pub fn retire(&self, handle: Handle) {
        drop(self.registry.retire(handle));
    }

    /// Retire every service (the ABORT command).
    pub fn retire_all(&self) {
        drop(self.registry.retire_all());
    }

    pub(crate) fn mark_endless(&self, handle: Handle) {
        if let Some(ctx) = self.registry.lookup(handle) {
            ctx.set_endless();
        }
    }

    // -- messaging ----------------------------------------------------------

    /// Append a message to `destination`'s mailbox. The message comes
    /// back on failure so the caller can decide how to surface it.
    pub fn push_message(&self, destination: Handle, message: Message) -> Result<(), Message> {
        match self.registry.lookup(destination) {
            Some(ctx) => {
                ctx.queue().push(message);
                Ok(())
            }
            None => Err(message),
        }
    }

    /// The central send: validates size, routes remote destinations to
    /// the harbor hook, enqueues local ones. Returns the session.
    pub fn send_message(
        &self,
        source: Handle,
        destination: Handle,
        kind: MessageKind,
        session: i32,
        payload: Payload,
    ) -> Result<i32, SendError> {
        if payload.len() > MAX_PAYLOAD {
            self.report(source, format!("The message to {} is too large", destination));
            return Err(SendError::Oversize);
        }
        if !destination.is_valid() {
            // Session allocation without delivery (used by request
            // bookkeeping); not an error.
            return Ok(session);
        }
        if self.harbor.is_remote(destination) {
            if !self
                .harbor
                .send(destination, source, kind, session, payload)
            {
                self.report(
                    source,
                    format!("Drop message to {} : no harbor transport", destination),
                );
            }
            return Ok(session);
        }
        let message = Message {
            source,
            session,
            kind,
            payload,
        };
        self.push_message(destination, message)
            .map(|_| session)
            .map_err(|_| SendError::InvalidDestination(destination))
    }

    /// Schedule a timer response: non-positive delays deliver
    /// immediately, others go through the wheel. Returns the session.
    pub fn timeout(&self, handle: Handle, ticks: i32, session: i32) -> i32 {
        if ticks <= 0 {
            if self
                .push_message(handle, Message::timer_response(session))
                .is_err()
            {
                return -1;
            }
        } else {
            self.timer.schedule(handle, session, ticks);
        }
        session
    }

    /// Route a runtime diagnostic line to the logger service (falling
    /// back to `tracing` before the logger is up).
    pub fn report(&self, source: Handle, text: impl Into<String>) {
        let text = text.into();
        let mut logger = Handle::from_raw(self.logger_cache.load(Ordering::Relaxed));
        if !logger.is_valid() {
            match self.registry.find_name("logger") {
                Some(h) => {
                    self.logger_cache.store(h.raw(), Ordering::Relaxed);
                    logger = h;
                }
                None => {
                    info!(target: "warren", "{text}");
                    return;
                }
            }
        }
        let message = Message {
            source,
            session: 0,
            kind: MessageKind::Text,
            payload: Payload::from(text),
        };
        if self.push_message(logger, message).is_err() {
            self.logger_cache.store(0, Ordering::Relaxed);
        }
    }

    // -- thread topology ----------------------------------------------------

    /// Spawn the monitor, timer, reactor and worker threads, then block
    /// until they all return (live service count reaching zero).
    pub fn start_threads(self: &Arc<Node>) {
        let count = self.gate.count;
        let monitors: Vec<Arc<WorkerMonitor>> =
            (0..count).map(|_| Arc::new(WorkerMonitor::new())).collect();
        let mut handles = Vec::with_capacity(count + 3);

        {
            let node = Arc::clone(self);
            let monitors = monitors.clone();
            handles.push(
                thread::Builder::new()
                    .name("warren-monitor".to_string())
                    .spawn(move || monitor_loop(node, monitors))
                    .expect("spawn monitor thread"),
            );
        }
        {
            let node = Arc::clone(self);
            handles.push(
                thread::Builder::new()
                    .name("warren-timer".to_string())
                    .spawn(move || timer_loop(node))
                    .expect("spawn timer thread"),
            );
        }
        {
            let node = Arc::clone(self);
            let server = self
                .reactor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .expect("reactor thread already started");
            handles.push(
                thread::Builder::new()
                    .name("warren-socket".to_string())
                    .spawn(move || socket::socket_thread(node, server))
                    .expect("spawn socket thread"),
            );
        }
        for (i, monitor) in monitors.into_iter().enumerate() {
            let node = Arc::clone(self);
            let weight = WEIGHT.get(i).copied().unwrap_or(0);
            handles.push(
                thread::Builder::new()
                    .name(format!("warren-worker-{i}"))
                    .spawn(move || worker_loop(node, monitor, weight))
                    .expect("spawn worker thread"),
            );
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Thread bodies
// ---------------------------------------------------------------------------

fn monitor_loop(node: Arc<Node>, monitors: Vec<Arc<WorkerMonitor>>) {
    loop {
        if node.total_services() == 0 {
            return;
        }
        for monitor in &monitors {
            if let Some(stuck) = monitor.check() {
                node.mark_endless(stuck.destination);
                node.report(
                    Handle::INVALID,
                    format!(
                        "A message from [ {} ] to [ {} ] maybe in an endless loop (version = {})",
                        stuck.source, stuck.destination, stuck.version
                    ),
                );
            }
        }
        for _ in 0..MONITOR_INTERVAL_SECS {
            if node.total_services() == 0 {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn timer_loop(node: Arc<Node>) {
    let deliver_node = Arc::clone(&node);
    let mut deliver = move |handle: Handle, session: i32| {
        let _ = deliver_node.push_message(handle, Message::timer_response(session));
    };
    loop {
        node.timer().advance(&mut deliver);
        if node.total_services() == 0 {
            break;
        }
        node.gate().wakeup(node.gate().count - 1);
        thread::sleep(Duration::from_micros(2500));
        if take_hup() {
            // SIGHUP asks the logger to reopen its file.
            if let Some(logger) = node.find_name("logger") {
                let _ = node.push_message(logger, Message::system(MessageKind::System, 0));
            }
        }
    }
    // Wake the reactor, then every worker, so all threads observe
    // shutdown and return.
    node.socket_controller().exit();
    node.gate().quit_all();
}

fn worker_loop(node: Arc<Node>, monitor: Arc<WorkerMonitor>, weight: i32) {
    let mut queue = None;
    while !node.gate().quitting() {
        queue = dispatch::message_dispatch(&node, &monitor, queue.take(), weight);
        if queue.is_none() {
            node.gate().sleep();
        }
    }
}

// ---------------------------------------------------------------------------
// SIGHUP handling (log reopen)
// ---------------------------------------------------------------------------

static SIG_HUP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_hup(signal: libc::c_int) {
    if signal == libc::SIGHUP {
        SIG_HUP.store(true, Ordering::Relaxed);
    }
}

fn install_hup() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_hup as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGHUP, &sa, std::ptr::null_mut());
    }
}

fn take_hup() -> bool {
    SIG_HUP.swap(false, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Node entry point
// ---------------------------------------------------------------------------

/// Build a node from `config`, launch the logger and bootstrap services,
/// and run it to completion.
pub fn run(config: Config, modules: ModuleRegistry) -> Result<(), StartError> {
    install_hup();
    let logservice = config.logservice.clone();
    let logger_arg = config.logger.clone().unwrap_or_default();
    let bootstrap = config.bootstrap.clone();

    let node = Node::new(config, modules)?;

    let logger = node
        .launch(&logservice, &logger_arg)
        .map_err(|source| StartError::Logger {
            service: logservice.clone(),
            source,
        })?;

    if let Some(command) = bootstrap {
        let (module, args) = split_command(&command);
        if let Err(source) = node.launch(module, args) {
            node.report(Handle::INVALID, format!("Bootstrap error : {}", command));
            // Flush whatever the logger already queued before failing.
            if let Some(ctx) = node.lookup(logger) {
                dispatch::dispatch_all(&node, &ctx);
            }
            return Err(StartError::Bootstrap { command, source });
        }
    }

    node.start_threads();
    Ok(())
}

/// Split a bootstrap/launch command line into `(module, args)`.
pub(crate) fn split_command(command: &str) -> (&str, &str) {
    let command = command.trim();
    match command.split_once(char::is_whitespace) {
        Some((module, args)) => (module, args.trim()),
        None => (command, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_handles_args() {
        assert_eq!(split_command("logger"), ("logger", ""));
        assert_eq!(split_command("gate 127.0.0.1 8888"), ("gate", "127.0.0.1 8888"));
        assert_eq!(split_command("  echo   hi  "), ("echo", "hi"));
    }

    #[test]
    fn weight_table_matches_dispatch_policy() {
        assert_eq!(&WEIGHT[..4], &[-1, -1, -1, -1]);
        assert_eq!(&WEIGHT[4..8], &[0, 0, 0, 0]);
        assert!(WEIGHT[8..16].iter().all(|w| *w == 1));
        assert!(WEIGHT[16..24].iter().all(|w| *w == 2));
        assert!(WEIGHT[24..32].iter().all(|w| *w == 3));
    }
}
