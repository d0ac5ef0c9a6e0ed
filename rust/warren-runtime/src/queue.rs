//! Per-service mailboxes and the process-wide ready queue.
//!
//! A [`MessageQueue`] is a growable ring of messages guarded by one lock.
//! The `in_global` flag ties the two structures together: a mailbox is on
//! the [`GlobalQueue`] (or being dispatched) exactly when the flag is
//! set, which is what guarantees that no two workers ever dispatch the
//! same service concurrently.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use warren_core::{Handle, Message};

/// Initial ring capacity of a fresh mailbox.
const DEFAULT_QUEUE_CAP: usize = 64;

/// Initial overload threshold; doubles every time it is crossed.
const MQ_OVERLOAD: usize = 1024;

// ---------------------------------------------------------------------------
// MessageQueue
// ---------------------------------------------------------------------------

struct QueueInner {
    ring: VecDeque<Message>,
    in_global: bool,
    release: bool,
    overload: usize,
    overload_threshold: usize,
}

/// One service's private FIFO mailbox.
pub struct MessageQueue {
    handle: Handle,
    global: Arc<GlobalQueue>,
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    /// Create a mailbox for `handle`. The `in_global` flag starts set so
    /// the mailbox is not enqueued between service creation and init;
    /// successful init pushes it explicitly.
    pub fn new(handle: Handle, global: Arc<GlobalQueue>) -> Arc<MessageQueue> {
        Arc::new(MessageQueue {
            handle,
            global,
            inner: Mutex::new(QueueInner {
                ring: VecDeque::with_capacity(DEFAULT_QUEUE_CAP),
                in_global: true,
                release: false,
                overload: 0,
                overload_threshold: MQ_OVERLOAD,
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message; enqueues the mailbox on the ready queue iff it
    /// was idle.
    pub fn push(self: &Arc<Self>, message: Message) {
        let mut inner = self.lock();
        inner.ring.push_back(message);
        if !inner.in_global {
            inner.in_global = true;
            self.global.push(Arc::clone(self));
        }
    }

    /// Pop the next message. On empty, clears `in_global` (the caller is
    /// about to drop the mailbox from dispatch) and resets the overload
    /// threshold.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.lock();
        match inner.ring.pop_front() {
            Some(message) => {
                let len = inner.ring.len();
                while len > inner.overload_threshold {
                    inner.overload = len;
                    inner.overload_threshold *= 2;
                }
                Some(message)
            }
            None => {
                inner.overload_threshold = MQ_OVERLOAD;
                inner.in_global = false;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read and clear the recorded overload length.
    pub fn take_overload(&self) -> usize {
        let mut inner = self.lock();
        std::mem::take(&mut inner.overload)
    }

    /// Mark the mailbox for its final drain and make sure a worker will
    /// see it.
    pub fn mark_release(self: &Arc<Self>) {
        let mut inner = self.lock();
        debug_assert!(!inner.release);
        inner.release = true;
        if !inner.in_global {
            inner.in_global = true;
            self.global.push(Arc::clone(self));
        }
    }

    /// True once the owning service retired and the next worker to pop
    /// this mailbox should drain it.
    pub fn release_pending(&self) -> bool {
        self.lock().release
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MessageQueue")
            .field("handle", &self.handle)
            .field("len", &inner.ring.len())
            .field("in_global", &inner.in_global)
            .field("release", &inner.release)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// GlobalQueue
// ---------------------------------------------------------------------------

/// The process-wide FIFO of mailboxes with pending work.
#[derive(Default)]
pub struct GlobalQueue {
    inner: Mutex<VecDeque<Arc<MessageQueue>>>,
}

impl GlobalQueue {
    pub fn new() -> Arc<GlobalQueue> {
        Arc::new(GlobalQueue::default())
    }

    pub fn push(&self, queue: Arc<MessageQueue>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(queue);
    }

    pub fn pop(&self) -> Option<Arc<MessageQueue>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use warren_core::MessageKind;

    fn msg(session: i32) -> Message {
        Message::system(MessageKind::Text, session)
    }

    fn mailbox() -> (Arc<GlobalQueue>, Arc<MessageQueue>) {
        let global = GlobalQueue::new();
        let q = MessageQueue::new(Handle::from_raw(0x0100_0001), Arc::clone(&global));
        (global, q)
    }

    #[test]
    fn fifo_order() {
        let (_g, q) = mailbox();
        q.push(msg(1));
        q.push(msg(2));
        q.push(msg(3));
        assert_eq!(q.pop().unwrap().session, 1);
        assert_eq!(q.pop().unwrap().session, 2);
        assert_eq!(q.pop().unwrap().session, 3);
        assert!(q.pop().is_none());
    }

    #[test]
    fn fresh_mailbox_is_not_enqueued_until_popped_empty() {
        let (global, q) = mailbox();
        // in_global starts set, so pushes do not enqueue.
        q.push(msg(1));
        assert!(global.pop().is_none());
        // Draining clears the flag; the next push enqueues.
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
        q.push(msg(2));
        let popped = global.pop().expect("mailbox enqueued");
        assert!(Arc::ptr_eq(&popped, &q));
        // At most once: a second push while flagged must not enqueue again.
        q.push(msg(3));
        assert!(global.pop().is_none());
    }

    #[test]
    fn overload_records_doubling_thresholds() {
        let (_g, q) = mailbox();
        for i in 0..1026 {
            q.push(msg(i));
        }
        // Crossing 1024 is observed at pop time.
        q.pop();
        assert_eq!(q.take_overload(), 1025);
        assert_eq!(q.take_overload(), 0);
        // Threshold doubled to 2048; nothing new recorded yet.
        q.pop();
        assert_eq!(q.take_overload(), 0);
    }

    #[test]
    fn overload_threshold_resets_on_empty() {
        let (_g, q) = mailbox();
        for i in 0..1025 {
            q.push(msg(i));
        }
        q.pop();
        assert_eq!(q.take_overload(), 1024);
        while q.pop().is_some() {}
        for i in 0..1025 {
            q.push(msg(i));
        }
        q.pop();
        // Same threshold crossed again after the reset.
        assert_eq!(q.take_overload(), 1024);
    }

    #[test]
    fn mark_release_enqueues_idle_mailbox() {
        let (global, q) = mailbox();
        // Drain to clear in_global.
        assert!(q.pop().is_none());
        q.mark_release();
        assert!(q.release_pending());
        let popped = global.pop().expect("release-pending mailbox enqueued");
        assert!(Arc::ptr_eq(&popped, &q));
    }
}
