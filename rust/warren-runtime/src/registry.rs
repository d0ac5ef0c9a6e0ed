//! The service registry: handle allocation, lookup, naming, retirement.
//!
//! The handle space is a closed hash over a power-of-two slot vector,
//! keyed by a monotonically advancing 24-bit counter that wraps past zero
//! to 1. Registration probes forward from the counter and doubles the
//! table on exhaustion, up to the 24-bit limit. Global names live in an
//! ordered map under the same read/write lock.
//!
//! The ref-count contract of the specification maps onto `Arc`: `lookup`
//! hands out a clone (the transient pin), `retire` removes the registry's
//! own clone, and destruction runs when the last pin drops.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use warren_core::handle::{Handle, HANDLE_MASK};

use crate::context::ServiceContext;

/// Initial slot vector size.
const DEFAULT_SLOT_SIZE: usize = 4;

enum Slot {
    Empty,
    /// Handle allocated, context not yet committed.
    Reserved(Handle),
    Live(Arc<ServiceContext>),
}

impl Slot {
    fn handle(&self) -> Option<Handle> {
        match self {
            Slot::Empty => None,
            Slot::Reserved(h) => Some(*h),
            Slot::Live(ctx) => Some(ctx.handle()),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

struct StoreInner {
    /// Next candidate 24-bit index; 0 is skipped.
    index: u32,
    slots: Vec<Slot>,
    names: BTreeMap<String, Handle>,
}

/// The process-wide handle↔service table.
pub struct HandleStore {
    node: u8,
    inner: RwLock<StoreInner>,
}

impl HandleStore {
    pub fn new(node: u8) -> HandleStore {
        HandleStore {
            node,
            inner: RwLock::new(StoreInner {
                index: 1,
                slots: (0..DEFAULT_SLOT_SIZE).map(|_| Slot::Empty).collect(),
                names: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a handle, holding its slot until [`commit`] or
    /// [`retire`]. Returns `None` when the 24-bit space is exhausted.
    ///
    /// [`commit`]: HandleStore::commit
    /// [`retire`]: HandleStore::retire
    pub fn reserve(&self) -> Option<Handle> {
        let mut inner = self.write();
        loop {
            let size = inner.slots.len();
            let mask = size as u32 - 1;
            let mut candidate = inner.index;
            for _ in 0..size {
                if candidate > HANDLE_MASK || candidate == 0 {
                    candidate = 1;
                }
                let hash = (candidate & mask) as usize;
                if inner.slots[hash].is_empty() {
                    let handle = Handle::assemble(self.node, candidate);
                    inner.slots[hash] = Slot::Reserved(handle);
                    inner.index = candidate + 1;
                    return Some(handle);
                }
                candidate += 1;
            }
            // Table full: double and rehash, respecting the 24-bit limit.
            if (size * 2 - 1) as u32 > HANDLE_MASK {
                return None;
            }
            let mut grown: Vec<Slot> = (0..size * 2).map(|_| Slot::Empty).collect();
            let new_mask = (size * 2 - 1) as u32;
            for slot in inner.slots.drain(..) {
                if let Some(h) = slot.handle() {
                    grown[(h.index() & new_mask) as usize] = slot;
                }
            }
            inner.slots = grown;
        }
    }

    /// Fill a reserved slot with its context.
    pub fn commit(&self, handle: Handle, ctx: Arc<ServiceContext>) {
        let mut inner = self.write();
        let mask = inner.slots.len() as u32 - 1;
        let hash = (handle.index() & mask) as usize;
        debug_assert!(matches!(inner.slots[hash], Slot::Reserved(h) if h == handle));
        inner.slots[hash] = Slot::Live(ctx);
    }

    /// Resolve a handle into a pinned context reference.
    pub fn lookup(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        let inner = self.read();
        let mask = inner.slots.len() as u32 - 1;
        match &inner.slots[(handle.index() & mask) as usize] {
            Slot::Live(ctx) if ctx.handle() == handle => Some(Arc::clone(ctx)),
            _ => None,
        }
    }

    /// Remove a handle and any names bound to it. Unknown handles are a
    /// no-op. The returned context (if any) is the registry's own pin;
    /// dropping it may run destruction.
    pub fn retire(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        let mut inner = self.write();
        let mask = inner.slots.len() as u32 - 1;
        let hash = (handle.index() & mask) as usize;
        if inner.slots[hash].handle() != Some(handle) {
            return None;
        }
        let slot = std::mem::replace(&mut inner.slots[hash], Slot::Empty);
        inner.names.retain(|_, h| *h != handle);
        match slot {
            Slot::Live(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Retire every live handle. Services retired this way may launch
    /// replacements concurrently, so keep sweeping until a pass finds
    /// nothing.
    pub fn retire_all(&self) -> Vec<Arc<ServiceContext>> {
        let mut retired = Vec::new();
        loop {
            let live: Vec<Handle> = {
                let inner = self.read();
                inner
                    .slots
                    .iter()
                    .filter_map(|s| match s {
                        Slot::Live(ctx) => Some(ctx.handle()),
                        _ => None,
                    })
                    .collect()
            };
            if live.is_empty() {
                return retired;
            }
            for handle in live {
                retired.extend(self.retire(handle));
            }
        }
    }

    /// Bind a global name exactly once; `false` if already bound.
    pub fn bind_name(&self, name: &str, handle: Handle) -> bool {
        let mut inner = self.write();
        if inner.names.contains_key(name) {
            return false;
        }
        inner.names.insert(name.to_string(), handle);
        true
    }

    pub fn find_name(&self, name: &str) -> Option<Handle> {
        self.read().names.get(name).copied()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;

    #[test]
    fn reserve_assigns_node_bits() {
        let store = HandleStore::new(3);
        let h = store.reserve().unwrap();
        assert_eq!(h.node(), 3);
        assert_eq!(h.index(), 1);
        assert_eq!(store.reserve().unwrap().index(), 2);
    }

    #[test]
    fn lookup_only_after_commit() {
        let store = HandleStore::new(1);
        let h = store.reserve().unwrap();
        assert!(store.lookup(h).is_none());
        let (ctx, _global) = test_context(h);
        store.commit(h, ctx);
        assert!(store.lookup(h).is_some());
    }

    #[test]
    fn table_doubles_past_initial_capacity() {
        let store = HandleStore::new(1);
        let handles: Vec<Handle> = (0..64).map(|_| store.reserve().unwrap()).collect();
        let mut contexts = Vec::new();
        for h in &handles {
            let (ctx, global) = test_context(*h);
            store.commit(*h, Arc::clone(&ctx));
            contexts.push((ctx, global));
        }
        for h in &handles {
            assert_eq!(store.lookup(*h).unwrap().handle(), *h);
        }
    }

    #[test]
    fn retire_unbinds_names_and_is_idempotent() {
        let store = HandleStore::new(1);
        let h = store.reserve().unwrap();
        let (ctx, _global) = test_context(h);
        store.commit(h, ctx);
        assert!(store.bind_name("gate", h));
        assert_eq!(store.find_name("gate"), Some(h));

        assert!(store.retire(h).is_some());
        assert!(store.lookup(h).is_none());
        assert_eq!(store.find_name("gate"), None);
        // Unknown/already retired handle is a no-op.
        assert!(store.retire(h).is_none());
    }

    #[test]
    fn names_bind_exactly_once() {
        let store = HandleStore::new(1);
        let a = store.reserve().unwrap();
        let b = store.reserve().unwrap();
        assert!(store.bind_name("launcher", a));
        assert!(!store.bind_name("launcher", b));
        assert_eq!(store.find_name("launcher"), Some(a));
    }

    #[test]
    fn retired_slot_is_reused_by_new_handle_value() {
        let store = HandleStore::new(1);
        let a = store.reserve().unwrap();
        let (ctx, _g) = test_context(a);
        store.commit(a, ctx);
        store.retire(a);
        let b = store.reserve().unwrap();
        assert_ne!(a, b);
        assert!(store.lookup(a).is_none());
    }
}
