//! Heap-side owner of the reference substrate.
//!
//! A [`Heap`] ties one cage, one collection barrier, an external and a
//! trusted pointer table and one cross-thread root region together and
//! drives a stop-the-world collection cycle over them.
//!
//! Consumers provide a [`TraceFn`] that reports the handle slots of each
//! rooted object.

use std::{
    ptr::NonNull,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    CollectionBarrier, CollectionHost, ForegroundTaskQueue, OsVirtualAddressSpace,
    VirtualAddressSpace,
    persistent::{CrossThreadPersistentRegion, PersistentRegionLock},
    pointer_table::{ExternalPointerTable, HandleSlot, SweepStats, TrustedPointerTable},
    sandbox::{Cage, SandboxAddressSpace},
    settings::{HeapCreateInfo, HeapSettings},
};

// ── Public API types ──────────────────────────────────────────────────

/// Reports the table handles held by a rooted object.
///
/// # Safety
///
/// `object` must point to a live object registered as a root. Every slot
/// passed to the marker must stay in place until the collection finishes.
pub type TraceFn = unsafe fn(object: NonNull<u8>, marker: &HeapMarker<'_>);

/// Marking access handed to [`TraceFn`].
pub struct HeapMarker<'h> {
    heap: &'h Heap,
}

impl HeapMarker<'_> {
    pub fn mark_external(&self, slot: &HandleSlot) {
        // SAFETY: TraceFn's contract keeps the slot in place until the sweep
        unsafe { self.heap.external_table.mark(slot) };
    }

    pub fn mark_trusted(&self, slot: &HandleSlot) {
        // SAFETY: TraceFn's contract keeps the slot in place until the sweep
        unsafe { self.heap.trusted_table.mark(slot) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub roots: usize,
    pub external: SweepStats,
    pub trusted: SweepStats,
}

pub struct Heap {
    settings: HeapSettings,
    trace_fn: TraceFn,
    barrier: CollectionBarrier,
    external_table: ExternalPointerTable,
    trusted_table: TrustedPointerTable,
    roots: Arc<CrossThreadPersistentRegion>,
    tasks: Arc<ForegroundTaskQueue>,
    interrupts: AtomicUsize,
    collections: AtomicUsize,
    // dropped last, the tables validate against its layout
    cage: Cage,
}

impl Heap {
    pub fn new(info: HeapCreateInfo, trace_fn: TraceFn) -> Result<Arc<Self>, &'static str> {
        Self::with_address_space(info, trace_fn, Arc::new(OsVirtualAddressSpace))
    }

    pub fn with_address_space(
        info: HeapCreateInfo,
        trace_fn: TraceFn,
        vas: Arc<dyn VirtualAddressSpace>,
    ) -> Result<Arc<Self>, &'static str> {
        let settings = info.into_settings()?;
        let cage = SandboxAddressSpace::reserve(vas.clone(), settings.cage_size_log2)?;
        let external_table = ExternalPointerTable::new(
            cage.space(),
            vas.clone(),
            settings.external_table.clone(),
        )?;
        let trusted_table =
            TrustedPointerTable::new(cage.space(), vas, settings.trusted_table.clone())?;
        let roots = Arc::new(CrossThreadPersistentRegion::new(
            PersistentRegionLock::process_wide(),
        ));
        let tasks = Arc::new(ForegroundTaskQueue::new());

        log::info!(
            "heap created: cage {:#x} (2^{} bytes)",
            cage.space().base(),
            settings.cage_size_log2
        );

        Ok(Arc::new_cyclic(|weak: &Weak<Heap>| {
            let host: Weak<dyn CollectionHost> = weak.clone();
            Self {
                barrier: CollectionBarrier::new(tasks.clone(), host),
                settings,
                trace_fn,
                external_table,
                trusted_table,
                roots,
                tasks,
                interrupts: AtomicUsize::new(0),
                collections: AtomicUsize::new(0),
                cage,
            }
        }))
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn cage(&self) -> SandboxAddressSpace {
        self.cage.space()
    }

    #[inline]
    pub fn barrier(&self) -> &CollectionBarrier {
        &self.barrier
    }

    #[inline]
    pub fn external_table(&self) -> &ExternalPointerTable {
        &self.external_table
    }

    #[inline]
    pub fn trusted_table(&self) -> &TrustedPointerTable {
        &self.trusted_table
    }

    /// Region for roots created from any thread.
    #[inline]
    pub fn roots(&self) -> &Arc<CrossThreadPersistentRegion> {
        &self.roots
    }

    /// Main-thread task queue the barrier posts interrupts to.
    #[inline]
    pub fn tasks(&self) -> &Arc<ForegroundTaskQueue> {
        &self.tasks
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::Relaxed)
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Main-thread safe point. Runs posted tasks if a background thread
    /// asked for a collection. Returns whether any task ran.
    pub fn safepoint(&self) -> bool {
        if !self.barrier.take_interrupt() {
            return false;
        }
        self.tasks.run_pending() > 0
    }

    /// Runs one full collection on the calling (main) thread and releases
    /// every background thread waiting for it.
    pub fn collect_garbage(&self) -> GcStats {
        self.barrier.stop_time_to_collection_timer();

        self.external_table.start_marking();
        self.trusted_table.start_marking();

        let marker = HeapMarker { heap: self };
        let mut roots = 0usize;
        let mut visit = |object: NonNull<u8>| {
            roots += 1;
            // SAFETY: the region only reports live rooted objects
            unsafe { (self.trace_fn)(object, &marker) };
        };
        self.roots.trace_locked(&mut visit);

        let stats = GcStats {
            roots,
            external: self.external_table.sweep_and_compact(),
            trusted: self.trusted_table.sweep_and_compact(),
        };
        let cycle = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!(
            "gc #{cycle}: {} roots, {} external / {} trusted entries live",
            stats.roots,
            stats.external.live_entries,
            stats.trusted.live_entries
        );

        self.barrier.resume_threads_awaiting_collection();
        stats
    }
}

impl CollectionHost for Heap {
    fn check_collection_requested(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
        if self.barrier.was_collection_requested() {
            log::debug!("collecting on behalf of background threads");
            self.collect_garbage();
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.barrier.shutdown_requested();
        self.roots.clear_all_used_nodes_locked();
        log::debug!(
            "heap torn down after {} collections",
            self.collections()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BarrierState, CrossThreadPersistent,
        pointer_table::{PointerHandle, PointerTag},
    };
    use std::thread;

    const EXTERNAL_TAG: PointerTag = PointerTag::new(0x31);
    const TRUSTED_TAG: PointerTag = PointerTag::new(0x32);

    /// Stand-in for an object living in the cage.
    struct Object {
        external: HandleSlot,
        trusted: HandleSlot,
    }

    unsafe fn trace_object(object: NonNull<u8>, marker: &HeapMarker<'_>) {
        // SAFETY: tests only root Object values
        let object = unsafe { object.cast::<Object>().as_ref() };
        marker.mark_external(&object.external);
        marker.mark_trusted(&object.trusted);
    }

    fn heap() -> Arc<Heap> {
        Heap::new(
            HeapCreateInfo {
                cage_size_log2: Some(24),
                table_block_size: Some(4096),
                table_reservation_entries: Some(1 << 16),
                ..Default::default()
            },
            trace_object,
        )
        .expect("heap")
    }

    fn object(heap: &Heap, i: usize) -> Box<Object> {
        let external = heap
            .external_table()
            .allocate_and_initialize_entry(0x2000_0000 + i * 8, EXTERNAL_TAG);
        let trusted = heap
            .trusted_table()
            .allocate_and_initialize_entry(0x3000_0000 + i * 8, TRUSTED_TAG);
        Box::new(Object {
            external: HandleSlot::new(external),
            trusted: HandleSlot::new(trusted),
        })
    }

    #[test]
    fn collection_keeps_rooted_entries_only() {
        let heap = heap();
        let objects: Vec<_> = (0..200).map(|i| object(&heap, i)).collect();
        let roots: Vec<_> = objects
            .iter()
            .step_by(4)
            .map(|o| CrossThreadPersistent::new(heap.roots().clone(), Some(NonNull::from(&**o))))
            .collect();

        let stats = heap.collect_garbage();
        assert_eq!(stats.roots, 50);
        assert_eq!(stats.external.live_entries, 50);
        assert_eq!(stats.trusted.live_entries, 50);
        assert_eq!(heap.collections(), 1);

        for (i, o) in objects.iter().enumerate().step_by(4) {
            assert_eq!(
                heap.external_table().get(o.external.load(), EXTERNAL_TAG),
                0x2000_0000 + i * 8
            );
            assert_eq!(
                heap.trusted_table().get(o.trusted.load(), TRUSTED_TAG),
                0x3000_0000 + i * 8
            );
        }
        drop(roots);
        assert_eq!(heap.roots().nodes_in_use_locked(), 0);
        assert_eq!(heap.collect_garbage().external.live_entries, 0);
    }

    #[test]
    fn background_request_is_served_at_the_next_safepoint() {
        let heap = heap();
        let waiter = {
            let heap = heap.clone();
            thread::spawn(move || heap.barrier().await_collection_background())
        };

        while !heap.barrier().is_interrupt_requested() {
            thread::yield_now();
        }
        assert!(heap.safepoint());
        assert!(waiter.join().expect("join waiter"));
        assert_eq!(heap.collections(), 1);
        assert_eq!(heap.interrupts(), 1);
        assert_eq!(heap.barrier().state(), BarrierState::Default);
        assert!(!heap.safepoint());
    }

    #[test]
    fn teardown_clears_roots_and_releases_waiters() {
        let heap = heap();
        let o = object(&heap, 0);
        let root = CrossThreadPersistent::new(heap.roots().clone(), Some(NonNull::from(&*o)));
        let region = heap.roots().clone();
        drop(heap);

        assert!(root.is_cleared());
        assert_eq!(region.nodes_in_use_locked(), 0);
        assert_eq!(root.get(), None);
        drop(root);
        assert_eq!(o.external.load(), PointerHandle::from_index(1));
    }
}
