use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    fatal_check,
    persistent::{
        CrossThreadPersistentBase, PersistentBase,
        node::{NodeRef, NodeSlots, TraceRootCallback},
    },
    threading::{OsThreadIdentity, ThreadIdentity, ThreadToken},
    visitor::RootVisitor,
};

/// Root registry bound to the thread that created it.
///
/// The region may be moved but every use must happen on the creation
/// thread. Trace callbacks must not call back into the region.
pub struct PersistentRegion {
    slots: UnsafeCell<NodeSlots>,
    creation_thread: ThreadToken,
    identity: Arc<dyn ThreadIdentity>,
}

// SAFETY: the region owns its node blocks; use is confined to the creation
// thread by the identity checks below
unsafe impl Send for PersistentRegion {}

impl PersistentRegion {
    pub fn new(identity: Arc<dyn ThreadIdentity>) -> Self {
        let creation_thread = identity.current();
        Self {
            slots: UnsafeCell::new(NodeSlots::new()),
            creation_thread,
            identity,
        }
    }

    #[inline(always)]
    pub fn creation_thread(&self) -> ThreadToken {
        self.creation_thread
    }

    #[inline(always)]
    fn debug_check_thread(&self) {
        debug_assert!(
            self.identity.is_current(self.creation_thread),
            "persistent region used off its creation thread"
        );
    }

    /// # Safety
    /// Callers must not hold another reference obtained from this function.
    /// The type is `!Sync` and callbacks never re-enter, so each public
    /// method holds the only one.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    unsafe fn slots(&self) -> &mut NodeSlots {
        // SAFETY: see above
        unsafe { &mut *self.slots.get() }
    }

    /// Registers `owner` as a root holder.
    ///
    /// # Safety
    /// `owner` must stay valid, and be accepted by `trace`, until the node is
    /// freed or the region clears it.
    pub unsafe fn allocate_node(&self, owner: NonNull<()>, trace: TraceRootCallback) -> NodeRef {
        self.debug_check_thread();
        // SAFETY: not re-entered
        let slots = unsafe { self.slots() };
        if !slots.has_free_node() {
            fatal_check!(
                self.identity.is_current(self.creation_thread),
                "persistent region grown off its creation thread"
            );
            slots.refill_free_list();
        }
        slots.allocate_node(owner, trace)
    }

    pub fn free_node(&self, node: NodeRef) {
        self.debug_check_thread();
        // SAFETY: not re-entered
        unsafe { self.slots() }.free_node(node);
    }

    pub fn trace(&self, visitor: &mut dyn RootVisitor) {
        self.debug_check_thread();
        // SAFETY: callbacks do not re-enter
        unsafe { self.slots() }.trace(visitor);
    }

    pub fn nodes_in_use(&self) -> usize {
        self.debug_check_thread();
        // SAFETY: not re-entered
        let slots = unsafe { self.slots() };
        debug_assert_eq!(slots.nodes_in_use(), slots.count_used_nodes());
        slots.nodes_in_use()
    }

    pub fn block_count(&self) -> usize {
        // SAFETY: not re-entered
        unsafe { self.slots() }.block_count()
    }

    /// Clears every live [`Persistent`](crate::Persistent) of this region.
    pub fn clear_all_used_nodes(&self) {
        self.debug_check_thread();
        // SAFETY: owner callbacks only touch their own handle
        unsafe { self.slots() }.clear_all_used_nodes::<PersistentBase>();
    }
}

impl Drop for PersistentRegion {
    fn drop(&mut self) {
        self.slots.get_mut().clear_all_used_nodes::<PersistentBase>();
    }
}

/// Lock guarding every cross-thread root region that shares it.
#[derive(Debug, Default)]
pub struct PersistentRegionLock {
    mutex: Mutex<()>,
    /// Raw token of the holding thread, 0 when free. Debug builds only.
    owner: AtomicU64,
}

static PROCESS_LOCK: OnceLock<Arc<PersistentRegionLock>> = OnceLock::new();

/// Held [`PersistentRegionLock`]. Unlocks on drop.
pub struct PersistentRegionGuard<'l> {
    lock: &'l PersistentRegionLock,
    _guard: MutexGuard<'l, ()>,
}

impl Drop for PersistentRegionGuard<'_> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            self.lock.owner.store(0, Ordering::Release);
        }
    }
}

impl PersistentRegionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock shared by every region in the process that does not bring
    /// its own.
    pub fn process_wide() -> Arc<Self> {
        PROCESS_LOCK.get_or_init(|| Arc::new(Self::new())).clone()
    }

    #[inline]
    pub fn lock(&self) -> PersistentRegionGuard<'_> {
        let guard = self.mutex.lock();
        if cfg!(debug_assertions) {
            self.owner
                .store(OsThreadIdentity.current().raw(), Ordering::Release);
        }
        PersistentRegionGuard {
            lock: self,
            _guard: guard,
        }
    }

    /// Debug check that the calling thread holds the lock.
    #[inline(always)]
    pub fn assert_locked(&self) {
        if cfg!(debug_assertions) {
            assert!(self.mutex.is_locked(), "persistent region lock not held");
            assert_eq!(
                self.owner.load(Ordering::Acquire),
                OsThreadIdentity.current().raw(),
                "persistent region lock held by another thread"
            );
        }
    }
}

/// Root registry shared between threads. Every mutation and every trace
/// must happen with [`PersistentRegionLock`] held.
pub struct CrossThreadPersistentRegion {
    slots: UnsafeCell<NodeSlots>,
    lock: Arc<PersistentRegionLock>,
}

// SAFETY: all access to the slots is serialized by `lock`
unsafe impl Send for CrossThreadPersistentRegion {}
// SAFETY: all access to the slots is serialized by `lock`
unsafe impl Sync for CrossThreadPersistentRegion {}

impl CrossThreadPersistentRegion {
    pub fn new(lock: Arc<PersistentRegionLock>) -> Self {
        Self {
            slots: UnsafeCell::new(NodeSlots::new()),
            lock,
        }
    }

    #[inline(always)]
    pub fn lock(&self) -> &Arc<PersistentRegionLock> {
        &self.lock
    }

    /// # Safety
    /// The region lock must be held and no other reference from this
    /// function may be alive.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    unsafe fn slots(&self) -> &mut NodeSlots {
        self.lock.assert_locked();
        // SAFETY: see above
        unsafe { &mut *self.slots.get() }
    }

    /// # Safety
    /// The region lock must be held. `owner` must stay valid until the node
    /// is freed or the region clears it.
    pub unsafe fn allocate_node(&self, owner: NonNull<()>, trace: TraceRootCallback) -> NodeRef {
        // SAFETY: lock held by contract
        unsafe { self.slots() }.allocate_node(owner, trace)
    }

    /// # Safety
    /// The region lock must be held.
    pub unsafe fn free_node(&self, node: NodeRef) {
        // SAFETY: lock held by contract
        unsafe { self.slots() }.free_node(node);
    }

    /// # Safety
    /// The region lock must be held.
    pub unsafe fn trace(&self, visitor: &mut dyn RootVisitor) {
        // SAFETY: lock held by contract
        unsafe { self.slots() }.trace(visitor);
    }

    /// # Safety
    /// The region lock must be held.
    pub unsafe fn nodes_in_use(&self) -> usize {
        // SAFETY: lock held by contract
        let slots = unsafe { self.slots() };
        debug_assert_eq!(slots.nodes_in_use(), slots.count_used_nodes());
        slots.nodes_in_use()
    }

    /// Clears every live [`CrossThreadPersistent`](crate::CrossThreadPersistent)
    /// of this region, as done on heap teardown.
    ///
    /// # Safety
    /// The region lock must be held.
    pub unsafe fn clear_all_used_nodes(&self) {
        // SAFETY: lock held by contract
        unsafe { self.slots() }.clear_all_used_nodes::<CrossThreadPersistentBase>();
    }

    /// Locks, traces, unlocks.
    pub fn trace_locked(&self, visitor: &mut dyn RootVisitor) {
        let _guard = self.lock.lock();
        // SAFETY: lock held
        unsafe { self.trace(visitor) }
    }

    pub fn nodes_in_use_locked(&self) -> usize {
        let _guard = self.lock.lock();
        // SAFETY: lock held
        unsafe { self.nodes_in_use() }
    }

    pub fn clear_all_used_nodes_locked(&self) {
        let _guard = self.lock.lock();
        // SAFETY: lock held
        unsafe { self.clear_all_used_nodes() }
    }
}

impl Drop for CrossThreadPersistentRegion {
    fn drop(&mut self) {
        let _guard = self.lock.lock();
        self.slots
            .get_mut()
            .clear_all_used_nodes::<CrossThreadPersistentBase>();
    }
}
