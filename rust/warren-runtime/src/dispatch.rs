//! The worker dispatch step.
//!
//! Each worker repeatedly calls [`message_dispatch`] with its current
//! mailbox (or none). The function pops up to a weight-determined batch
//! of messages, invokes the service callback for each behind a panic
//! boundary, and decides which mailbox the worker should hold next,
//! re-enqueueing the current one only when other work is waiting.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use warren_core::{Handle, Message, MessageKind};

use crate::context::{set_current_handle, ServiceContext};
use crate::monitor::WorkerMonitor;
use crate::node::Node;
use crate::queue::MessageQueue;
use crate::scope::ServiceScope;
use crate::service_log;
use crate::timer::thread_time_micros;

/// Dispatch a batch from `queue` (or the next ready mailbox) and return
/// the mailbox this worker should process next, if any.
pub(crate) fn message_dispatch(
    node: &Arc<Node>,
    monitor: &WorkerMonitor,
    queue: Option<Arc<MessageQueue>>,
    weight: i32,
) -> Option<Arc<MessageQueue>> {
    let queue = match queue {
        Some(q) => q,
        None => node.global_queue().pop()?,
    };
    let handle = queue.handle();

    let Some(ctx) = node.lookup(handle) else {
        // Service gone: either perform the final drain or hand the
        // mailbox back until the release mark lands.
        release_queue(node, &queue);
        return node.global_queue().pop();
    };

    let mut batch = 1usize;
    let mut i = 0usize;
    while i < batch {
        let Some(message) = queue.pop() else {
            return node.global_queue().pop();
        };
        if i == 0 && weight >= 0 {
            batch = queue.len() >> weight;
        }
        let overload = queue.take_overload();
        if overload > 0 {
            ctx.record_overload(overload);
            node.report(
                handle,
                format!("May overload, message queue length = {}", overload),
            );
        }

        monitor.trigger(message.source, handle);
        dispatch_message(node, &ctx, message);
        monitor.trigger(Handle::INVALID, Handle::INVALID);
        i += 1;
    }

    // If other mailboxes are waiting, requeue this one behind them;
    // otherwise keep it and skip a pointless round-trip.
    match node.global_queue().pop() {
        Some(next) => {
            node.global_queue().push(queue);
            Some(next)
        }
        None => Some(queue),
    }
}

/// Invoke the service callback for one message, with logging, stats and
/// the panic boundary around user code.
pub(crate) fn dispatch_message(node: &Arc<Node>, ctx: &Arc<ServiceContext>, message: Message) {
    set_current_handle(ctx.handle());
    {
        let mut logfile = ctx
            .logfile()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(file) = logfile.as_mut() {
            service_log::output(file, &message, node.now());
        }
    }
    ctx.bump_message_count();

    let source = message.source;
    let session = message.session;
    let scope = ServiceScope::new(node, ctx);
    let profiled = ctx.profiling();
    if profiled {
        ctx.set_cpu_start(thread_time_micros());
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.with_instance(|svc| svc.dispatch(&scope, message));
    }));
    if profiled {
        ctx.add_cpu_cost(thread_time_micros().saturating_sub(ctx.cpu_start()));
    }
    if outcome.is_err() {
        node.report(
            ctx.handle(),
            format!(
                "dispatch error: source = {} to = {} session = {}",
                source,
                ctx.handle(),
                session
            ),
        );
    }
}

/// Drain every message of a retired service's mailbox (answering each
/// sender with an error), or push the mailbox back if the release mark
/// has not landed yet.
pub(crate) fn release_queue(node: &Arc<Node>, queue: &Arc<MessageQueue>) {
    if queue.release_pending() {
        let dead = queue.handle();
        while let Some(message) = queue.pop() {
            drop_message(node, dead, message);
        }
    } else {
        node.global_queue().push(Arc::clone(queue));
    }
}

/// Report a delivery failure back to the original sender: an `Error`
/// message whose source is the dead destination, echoing the session.
fn drop_message(node: &Arc<Node>, dead: Handle, message: Message) {
    if !message.source.is_valid() {
        return;
    }
    let reply = Message {
        source: dead,
        session: message.session,
        kind: MessageKind::Error,
        payload: warren_core::Payload::Empty,
    };
    let _ = node.push_message(message.source, reply);
}

/// Drain and dispatch everything in a service's mailbox on the calling
/// thread (startup error paths, before workers exist).
pub(crate) fn dispatch_all(node: &Arc<Node>, ctx: &Arc<ServiceContext>) {
    while let Some(message) = ctx.queue().pop() {
        dispatch_message(node, ctx, message);
    }
}
