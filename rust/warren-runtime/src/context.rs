//! Per-service context: identity, mailbox, instance, stats.
//!
//! A [`ServiceContext`] is owned by the registry and pinned transiently
//! (via `Arc` clones) by workers, the timer and the reactor glue while
//! they touch the service. Destruction runs when the last pin drops: it
//! closes the trace log, releases the module instance, and marks the
//! mailbox release-pending so a worker performs the final drain.

use std::cell::Cell;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use warren_core::Handle;

use crate::module::{Service, SignalHook};
use crate::queue::MessageQueue;

/// Node-wide counters shared with every context.
#[derive(Debug, Default)]
pub struct NodeStats {
    /// Live service count; the node winds down when it reaches zero.
    pub(crate) total: AtomicI32,
}

impl NodeStats {
    pub fn total(&self) -> i32 {
        self.total.load(Ordering::Relaxed)
    }
}

thread_local! {
    static CURRENT_HANDLE: Cell<u32> = const { Cell::new(0) };
}

/// The handle of the service currently dispatching on this thread, or
/// [`Handle::INVALID`] outside dispatch. Written only by the dispatch
/// prologue.
pub fn current_handle() -> Handle {
    Handle::from_raw(CURRENT_HANDLE.with(|c| c.get()))
}

pub(crate) fn set_current_handle(handle: Handle) {
    CURRENT_HANDLE.with(|c| c.set(handle.raw()));
}

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Everything the runtime keeps per service.
pub struct ServiceContext {
    handle: Handle,
    queue: Arc<MessageQueue>,
    instance: Mutex<Box<dyn Service>>,
    signal: Mutex<Option<SignalHook>>,
    logfile: Mutex<Option<File>>,
    session_id: AtomicI32,
    /// Accumulated callback CPU time in microseconds (profiling only).
    cpu_cost: AtomicU64,
    /// Thread CPU clock at the start of the current dispatch.
    cpu_start: AtomicU64,
    message_count: AtomicU64,
    /// Last mailbox overload value surfaced by the dispatcher.
    overload: AtomicUsize,
    endless: AtomicBool,
    initialized: AtomicBool,
    profile: AtomicBool,
    stats: Arc<NodeStats>,
}

impl ServiceContext {
    pub fn new(
        handle: Handle,
        queue: Arc<MessageQueue>,
        instance: Box<dyn Service>,
        profile: bool,
        stats: Arc<NodeStats>,
    ) -> ServiceContext {
        ServiceContext {
            handle,
            queue,
            instance: Mutex::new(instance),
            signal: Mutex::new(None),
            logfile: Mutex::new(None),
            session_id: AtomicI32::new(0),
            cpu_cost: AtomicU64::new(0),
            cpu_start: AtomicU64::new(0),
            message_count: AtomicU64::new(0),
            overload: AtomicUsize::new(0),
            endless: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            profile: AtomicBool::new(profile),
            stats,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Allocate the next request session: strictly positive, wrapping
    /// past `i32::MAX` back to 1.
    pub fn new_session(&self) -> i32 {
        let session = self.session_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if session <= 0 {
            self.session_id.store(1, Ordering::Relaxed);
            1
        } else {
            session
        }
    }

    /// Run `f` with exclusive access to the module instance.
    pub(crate) fn with_instance<R>(&self, f: impl FnOnce(&mut Box<dyn Service>) -> R) -> R {
        let mut guard = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Capture the instance's signal hook; called once after init so
    /// signals never contend with a running dispatch.
    pub(crate) fn capture_signal_hook(&self) {
        let hook = self.with_instance(|svc| svc.signal_hook());
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Deliver a module-defined signal. Services without a hook ignore it.
    pub fn signal(&self, sig: i32) {
        let hook = self
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(sig);
        }
    }

    pub(crate) fn logfile(&self) -> &Mutex<Option<File>> {
        &self.logfile
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_message_count(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cpu_cost_micros(&self) -> u64 {
        self.cpu_cost.load(Ordering::Relaxed)
    }

    pub(crate) fn add_cpu_cost(&self, micros: u64) {
        self.cpu_cost.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn set_cpu_start(&self, micros: u64) {
        self.cpu_start.store(micros, Ordering::Relaxed);
    }

    pub(crate) fn cpu_start(&self) -> u64 {
        self.cpu_start.load(Ordering::Relaxed)
    }

    pub fn profiling(&self) -> bool {
        self.profile.load(Ordering::Relaxed)
    }

    /// Record an overload length so `STAT overload` can report it.
    pub(crate) fn record_overload(&self, length: usize) {
        self.overload.store(length, Ordering::Relaxed);
    }

    pub fn take_overload(&self) -> usize {
        self.overload.swap(0, Ordering::Relaxed)
    }

    pub fn set_endless(&self) {
        self.endless.store(true, Ordering::Relaxed);
    }

    /// Read and clear the endless-loop marker.
    pub fn take_endless(&self) -> bool {
        self.endless.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl Drop for ServiceContext {
    fn drop(&mut self) {
        // The mailbox outlives the context: the next worker to pop it
        // performs the final drain, answering pending senders with error
        // messages.
        self.queue.mark_release();
        self.stats.total.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("handle", &self.handle)
            .field("mqlen", &self.queue.len())
            .field("initialized", &self.initialized())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::module::ServiceError;
    use crate::queue::GlobalQueue;
    use crate::scope::ServiceScope;
    use warren_core::Message;

    struct NullService;

    impl Service for NullService {
        fn init(&mut self, _scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        fn dispatch(&mut self, _scope: &ServiceScope<'_>, _message: Message) {}
    }

    /// Build a bare context (plus the global queue keeping its mailbox
    /// alive) for registry and dispatch tests.
    pub(crate) fn test_context(handle: Handle) -> (Arc<ServiceContext>, Arc<GlobalQueue>) {
        let global = GlobalQueue::new();
        let queue = MessageQueue::new(handle, Arc::clone(&global));
        let stats = Arc::new(NodeStats::default());
        stats.total.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(ServiceContext::new(
            handle,
            queue,
            Box::new(NullService),
            false,
            stats,
        ));
        (ctx, global)
    }

    #[test]
    fn sessions_are_positive_and_increasing() {
        let (ctx, _g) = test_context(Handle::from_raw(0x0100_0001));
        assert_eq!(ctx.new_session(), 1);
        assert_eq!(ctx.new_session(), 2);
        assert_eq!(ctx.new_session(), 3);
    }

    #[test]
    fn session_wrap_skips_zero() {
        let (ctx, _g) = test_context(Handle::from_raw(0x0100_0001));
        ctx.session_id.store(i32::MAX - 1, Ordering::Relaxed);
        assert_eq!(ctx.new_session(), i32::MAX);
        let wrapped = ctx.new_session();
        assert_eq!(wrapped, 1);
        assert!(ctx.new_session() > 0);
    }

    #[test]
    fn endless_flag_is_read_and_cleared() {
        let (ctx, _g) = test_context(Handle::from_raw(0x0100_0001));
        assert!(!ctx.take_endless());
        ctx.set_endless();
        assert!(ctx.take_endless());
        assert!(!ctx.take_endless());
    }

    #[test]
    fn drop_marks_mailbox_release_pending() {
        let (ctx, global) = test_context(Handle::from_raw(0x0100_0001));
        let queue = Arc::clone(ctx.queue());
        // Simulate the mailbox being off the ready queue.
        assert!(queue.pop().is_none());
        drop(ctx);
        assert!(queue.release_pending());
        assert!(global.pop().is_some());
    }

    #[test]
    fn current_handle_defaults_to_invalid() {
        assert_eq!(current_handle(), Handle::INVALID);
        set_current_handle(Handle::from_raw(7));
        assert_eq!(current_handle().raw(), 7);
        set_current_handle(Handle::INVALID);
    }
}
