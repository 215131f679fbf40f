use std::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicPtr, Ordering},
    },
};

use crate::{
    persistent::{
        CrossThreadPersistentRegion, PersistentRegion,
        node::{NodeRef, PersistentOwner},
    },
    visitor::RootVisitor,
};

/// Node owner behind a [`Persistent`]. Boxed so its address is stable.
pub struct PersistentBase {
    raw: Cell<*mut u8>,
    node: Cell<Option<NodeRef>>,
}

impl PersistentBase {
    const fn empty() -> Self {
        Self {
            raw: Cell::new(ptr::null_mut()),
            node: Cell::new(None),
        }
    }
}

impl PersistentOwner for PersistentBase {
    unsafe fn clear_from_gc(owner: NonNull<()>) {
        // SAFETY: registered owners are live PersistentBase boxes
        let base = unsafe { owner.cast::<Self>().as_ref() };
        base.raw.set(ptr::null_mut());
        base.node.set(None);
    }
}

unsafe fn trace_persistent(owner: NonNull<()>, visitor: &mut dyn RootVisitor) {
    // SAFETY: registered owners are live PersistentBase boxes
    let base = unsafe { owner.cast::<PersistentBase>().as_ref() };
    visitor.visit_optional_root(NonNull::new(base.raw.get()));
}

/// Strong root from the region's own thread into the managed heap.
pub struct Persistent<'r, T> {
    base: Box<PersistentBase>,
    region: &'r PersistentRegion,
    _type: PhantomData<*const T>,
}

impl<'r, T> Persistent<'r, T> {
    pub fn new(region: &'r PersistentRegion, value: Option<NonNull<T>>) -> Self {
        let mut persistent = Self {
            base: Box::new(PersistentBase::empty()),
            region,
            _type: PhantomData,
        };
        persistent.set(value);
        persistent
    }

    #[inline]
    pub fn get(&self) -> Option<NonNull<T>> {
        NonNull::new(self.base.raw.get().cast())
    }

    pub fn set(&mut self, value: Option<NonNull<T>>) {
        let Some(value) = value else {
            self.clear();
            return;
        };
        self.base.raw.set(value.as_ptr().cast());
        if self.base.node.get().is_none() {
            let owner = NonNull::from(&*self.base).cast();
            // SAFETY: the box outlives the node; drop frees the node first
            let node = unsafe { self.region.allocate_node(owner, trace_persistent) };
            self.base.node.set(Some(node));
        }
    }

    pub fn clear(&mut self) {
        self.base.raw.set(ptr::null_mut());
        if let Some(node) = self.base.node.take() {
            self.region.free_node(node);
        }
    }

    /// True when empty, either by the owner's hand or by teardown.
    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.base.raw.get().is_null()
    }
}

impl<T> Drop for Persistent<'_, T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Node owner behind a [`CrossThreadPersistent`]. `node` is only touched
/// with the region lock held.
pub struct CrossThreadPersistentBase {
    raw: AtomicPtr<u8>,
    node: UnsafeCell<Option<NodeRef>>,
}

// SAFETY: raw is atomic, node is guarded by the region lock
unsafe impl Send for CrossThreadPersistentBase {}
// SAFETY: raw is atomic, node is guarded by the region lock
unsafe impl Sync for CrossThreadPersistentBase {}

impl CrossThreadPersistentBase {
    const fn empty() -> Self {
        Self {
            raw: AtomicPtr::new(ptr::null_mut()),
            node: UnsafeCell::new(None),
        }
    }
}

impl PersistentOwner for CrossThreadPersistentBase {
    unsafe fn clear_from_gc(owner: NonNull<()>) {
        // SAFETY: registered owners are live boxes; the region lock is held
        let base = unsafe { owner.cast::<Self>().as_ref() };
        base.raw.store(ptr::null_mut(), Ordering::Release);
        // SAFETY: region lock held by the clearing region
        unsafe { *base.node.get() = None };
    }
}

unsafe fn trace_cross_thread(owner: NonNull<()>, visitor: &mut dyn RootVisitor) {
    // SAFETY: registered owners are live CrossThreadPersistentBase boxes
    let base = unsafe { owner.cast::<CrossThreadPersistentBase>().as_ref() };
    visitor.visit_optional_root(NonNull::new(base.raw.load(Ordering::Acquire)));
}

/// Strong root usable, and droppable, from any thread.
pub struct CrossThreadPersistent<T> {
    base: Box<CrossThreadPersistentBase>,
    region: Arc<CrossThreadPersistentRegion>,
    _type: PhantomData<*const T>,
}

// SAFETY: every mutation goes through the region lock
unsafe impl<T> Send for CrossThreadPersistent<T> {}
// SAFETY: every mutation goes through the region lock
unsafe impl<T> Sync for CrossThreadPersistent<T> {}

impl<T> CrossThreadPersistent<T> {
    pub fn new(region: Arc<CrossThreadPersistentRegion>, value: Option<NonNull<T>>) -> Self {
        let persistent = Self {
            base: Box::new(CrossThreadPersistentBase::empty()),
            region,
            _type: PhantomData,
        };
        persistent.set(value);
        persistent
    }

    #[inline]
    pub fn get(&self) -> Option<NonNull<T>> {
        NonNull::new(self.base.raw.load(Ordering::Acquire).cast())
    }

    pub fn set(&self, value: Option<NonNull<T>>) {
        let _guard = self.region.lock().lock();
        // SAFETY: region lock held
        unsafe { self.set_locked(value) };
    }

    pub fn clear(&self) {
        self.set(None);
    }

    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.base.raw.load(Ordering::Acquire).is_null()
    }

    /// # Safety
    /// The region lock must be held.
    unsafe fn set_locked(&self, value: Option<NonNull<T>>) {
        // SAFETY: region lock held by contract
        let node = unsafe { &mut *self.base.node.get() };
        match value {
            Some(value) => {
                self.base.raw.store(value.as_ptr().cast(), Ordering::Release);
                if node.is_none() {
                    let owner = NonNull::from(&*self.base).cast();
                    // SAFETY: lock held; the box outlives the node
                    *node = Some(unsafe {
                        self.region.allocate_node(owner, trace_cross_thread)
                    });
                }
            }
            None => {
                self.base.raw.store(ptr::null_mut(), Ordering::Release);
                if let Some(old) = node.take() {
                    // SAFETY: lock held
                    unsafe { self.region.free_node(old) };
                }
            }
        }
    }
}

impl<T> Drop for CrossThreadPersistent<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
