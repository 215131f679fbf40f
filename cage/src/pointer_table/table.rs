use std::{
    marker::PhantomData,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    PagePermissions, VirtualAddressSpace,
    fatal::{fatal, fatal_oom},
    fatal_check,
    pointer_table::{
        Entry, External, HandleSlot, PointerHandle, PointerTag, SweepStats, TableKind, Trusted,
        entry::{MARK_BIT, MAX_ENTRY_ADDRESS},
    },
    sandbox::{Address, SandboxAddressSpace},
    settings::TableSettings,
};

/// Freelist head while a sweep is running. Allocating against it is fatal.
pub(crate) const SWEEPING_MARKER: u32 = u32::MAX;
/// Set in the evacuation area start once compaction was given up.
pub(crate) const COMPACTION_ABORTED_BIT: u32 = 1 << 31;

pub(crate) const ENTRY_SIZE: usize = size_of::<u64>();

/// Compacting indirection table of tag-checked entries.
///
/// Content lives outside the cage; sandboxed memory only ever holds a
/// [`PointerHandle`]. Reads are a single atomic load. Allocation, stores
/// and growth are serialized by the table mutex. Sweeping requires that no
/// mutator touches the table.
pub struct PointerTable<K: TableKind> {
    pub(super) base: NonNull<AtomicU64>,
    pub(super) capacity: AtomicU32,
    pub(super) freelist_head: AtomicU32,
    /// 0 when not compacting. Block aligned otherwise, with
    /// [`COMPACTION_ABORTED_BIT`] set once compaction was aborted.
    pub(super) start_of_evacuation_area: AtomicU32,
    pub(super) marking: AtomicBool,
    pub(super) mutex: Mutex<()>,
    pub(super) last_sweep: Mutex<Option<SweepStats>>,
    pub(super) entries_per_block: u32,
    pub(super) settings: TableSettings,
    pub(super) vas: Arc<dyn VirtualAddressSpace>,
    cage: SandboxAddressSpace,
    _kind: PhantomData<K>,
}

pub type ExternalPointerTable = PointerTable<External>;
pub type TrustedPointerTable = PointerTable<Trusted>;

// SAFETY: the entry array is only accessed atomically; structural changes
// happen under the mutex or with the mutator stopped
unsafe impl<K: TableKind> Send for PointerTable<K> {}
// SAFETY: see above
unsafe impl<K: TableKind> Sync for PointerTable<K> {}

impl<K: TableKind> PointerTable<K> {
    pub fn new(
        cage: SandboxAddressSpace,
        vas: Arc<dyn VirtualAddressSpace>,
        settings: TableSettings,
    ) -> Result<Self, &'static str> {
        settings.validate()?;
        if !settings.block_size.is_multiple_of(vas.page_size()) {
            return Err("block_size must match the address space's page size");
        }
        let Some(base) = vas.reserve(settings.reservation_bytes(), vas.page_size()) else {
            fatal_oom("pointer table reservation");
        };
        log::debug!(
            "{} table reserved {} entries at {:p}",
            K::NAME,
            settings.reservation_entries,
            base
        );
        Ok(Self {
            base: base.cast(),
            capacity: AtomicU32::new(0),
            freelist_head: AtomicU32::new(0),
            start_of_evacuation_area: AtomicU32::new(0),
            marking: AtomicBool::new(false),
            mutex: Mutex::new(()),
            last_sweep: Mutex::new(None),
            entries_per_block: settings.entries_per_block(),
            settings,
            vas,
            cage,
            _kind: PhantomData,
        })
    }

    #[inline(always)]
    pub(super) fn entry(&self, index: u32) -> &AtomicU64 {
        debug_assert!(index < self.settings.reservation_entries);
        // SAFETY: index is inside the reservation; callers only reach
        // committed entries
        unsafe { &*self.base.as_ptr().add(index as usize) }
    }

    #[inline(always)]
    pub(super) fn decode(&self, index: u32, word: u64) -> Entry {
        match Entry::decode(word) {
            Some(entry) => entry,
            None => fatal(format_args!("{} table entry {index} is corrupt", K::NAME)),
        }
    }

    #[inline(always)]
    pub(super) fn handle_to_index(&self, handle: PointerHandle) -> u32 {
        let index = handle.index();
        debug_assert_eq!(
            PointerHandle::from_index(index),
            handle,
            "malformed handle {:#x}",
            handle.raw()
        );
        fatal_check!(
            index < self.settings.reservation_entries,
            "{} handle {:#x} lies outside the table",
            K::NAME,
            handle.raw()
        );
        debug_assert!(index < self.capacity(), "handle beyond capacity");
        index
    }

    fn validate_content(&self, value: Address, tag: PointerTag) {
        if value == 0 {
            fatal_check!(K::ALLOWS_NULL, "{} table does not accept null content", K::NAME);
            return;
        }
        fatal_check!(
            value <= MAX_ENTRY_ADDRESS,
            "{} table content {value:#x} exceeds the entry payload",
            K::NAME
        );
        if self.cage.is_within_cage(value) {
            fatal_check!(
                self.settings.migration_allow_list.contains(&tag),
                "{} table content {value:#x} (tag {}) points into the cage",
                K::NAME,
                tag.raw()
            );
        }
    }

    pub fn allocate_and_initialize_entry(&self, value: Address, tag: PointerTag) -> PointerHandle {
        self.validate_content(value, tag);
        let _guard = self.mutex.lock();
        let index = self.allocate_locked();
        let entry = Entry::Live {
            address: value,
            tag,
            marked: self.is_marking(),
        };
        self.entry(index).store(entry.encode(), Ordering::Release);
        PointerHandle::from_index(index)
    }

    /// Pops the freelist, growing first when it is empty. Mutex held.
    fn allocate_locked(&self) -> u32 {
        let mut head = self.freelist_head.load(Ordering::Acquire);
        fatal_check!(
            head != SWEEPING_MARKER,
            "{} table allocation while sweeping",
            K::NAME
        );
        if head == 0 {
            head = self.grow();
        }
        self.pop_locked(head)
    }

    fn pop_locked(&self, head: u32) -> u32 {
        let Entry::Free { next, .. } = self.decode(head, self.entry(head).load(Ordering::Acquire))
        else {
            fatal(format_args!("{} freelist links a used entry {head}", K::NAME));
        };
        self.freelist_head.store(next, Ordering::Release);
        head
    }

    /// Commits one more block and threads it onto the (empty) freelist.
    /// Mutex held. Returns the new head.
    fn grow(&self) -> u32 {
        debug_assert!(self.mutex.is_locked());
        let old_capacity = self.capacity();
        let new_capacity = old_capacity + self.entries_per_block;
        fatal_check!(
            new_capacity <= self.settings.reservation_entries,
            "{} table exhausted its {} entry reservation",
            K::NAME,
            self.settings.reservation_entries
        );

        // SAFETY: within the reservation
        let block = unsafe { self.base.add(old_capacity as usize) };
        if !self
            .vas
            .set_permissions(block.cast(), self.settings.block_size, PagePermissions::ReadWrite)
        {
            fatal_oom("pointer table growth");
        }
        self.capacity.store(new_capacity, Ordering::Relaxed);

        let first = if old_capacity == 0 {
            self.entry(0).store(Entry::NULL.encode(), Ordering::Relaxed);
            1
        } else {
            old_capacity
        };
        for index in first..new_capacity {
            let next = if index + 1 < new_capacity { index + 1 } else { 0 };
            let entry = Entry::Free {
                next,
                freelist_len: new_capacity - index,
            };
            self.entry(index).store(entry.encode(), Ordering::Relaxed);
        }
        self.freelist_head.store(first, Ordering::Release);
        log::debug!("{} table grew to {new_capacity} entries", K::NAME);
        first
    }

    /// Lock-free read. The null handle reads as 0.
    #[inline]
    pub fn get(&self, handle: PointerHandle, tag: PointerTag) -> Address {
        if handle.is_null() {
            return 0;
        }
        let index = self.handle_to_index(handle);
        let word = self.entry(index).load(Ordering::Acquire);
        match self.decode(index, word) {
            Entry::Live {
                address,
                tag: actual,
                ..
            } if actual == tag => address,
            Entry::Live { tag: actual, .. } => fatal(format_args!(
                "{} handle {:#x}: expected tag {}, found {}",
                K::NAME,
                handle.raw(),
                tag.raw(),
                actual.raw()
            )),
            _ => fatal(format_args!(
                "{} handle {:#x} is dangling",
                K::NAME,
                handle.raw()
            )),
        }
    }

    /// Replaces the content and tag of a live entry.
    pub fn set(&self, handle: PointerHandle, value: Address, tag: PointerTag) {
        self.validate_content(value, tag);
        let index = self.live_index(handle);
        let _guard = self.mutex.lock();
        self.replace(index, value, tag, None);
    }

    /// Like [`set`](Self::set) but requires the old tag to match and returns
    /// the old content.
    pub fn exchange(&self, handle: PointerHandle, value: Address, tag: PointerTag) -> Address {
        self.validate_content(value, tag);
        let index = self.live_index(handle);
        let _guard = self.mutex.lock();
        self.replace(index, value, tag, Some(tag))
    }

    fn live_index(&self, handle: PointerHandle) -> u32 {
        fatal_check!(
            !handle.is_null(),
            "{} table store through the null handle",
            K::NAME
        );
        self.handle_to_index(handle)
    }

    /// Stores new content keeping the mark bit, racing only with markers.
    fn replace(
        &self,
        index: u32,
        value: Address,
        tag: PointerTag,
        expected: Option<PointerTag>,
    ) -> Address {
        let entry = self.entry(index);
        let mut current = entry.load(Ordering::Acquire);
        loop {
            let old = match self.decode(index, current) {
                Entry::Live {
                    address,
                    tag: actual,
                    ..
                } if expected.is_none_or(|t| t == actual) => address,
                _ => fatal(format_args!(
                    "{} store to entry {index} with a stale or mistagged handle",
                    K::NAME
                )),
            };
            let new = Entry::Live {
                address: value,
                tag,
                marked: Entry::is_marked(current),
            }
            .encode();
            match entry.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return old,
                Err(observed) => current = observed,
            }
        }
    }

    /// Marks the entry referenced from `slot` as live. Inside the evacuation
    /// area the first marker also reserves an evacuation entry below it.
    ///
    /// # Safety
    /// `slot` must stay at its address, and only hold handles of this table,
    /// until the next [`sweep_and_compact`](Self::sweep_and_compact).
    pub unsafe fn mark(&self, slot: &HandleSlot) {
        let handle = slot.load();
        if handle.is_null() {
            return;
        }
        let index = self.handle_to_index(handle);
        let old = self.entry(index).fetch_or(MARK_BIT, Ordering::AcqRel);
        fatal_check!(
            matches!(Entry::decode(old), Some(Entry::Live { .. })),
            "{} handle {:#x} marked but not live",
            K::NAME,
            handle.raw()
        );
        if Entry::is_marked(old) {
            return;
        }
        let start = self.start_of_evacuation_area.load(Ordering::Acquire);
        // an aborted start is above every index
        if start != 0 && index >= start {
            self.evacuate(slot, start);
        }
    }

    fn evacuate(&self, slot: &HandleSlot, start: u32) {
        let slot_address = slot as *const HandleSlot as Address;
        fatal_check!(
            slot_address <= MAX_ENTRY_ADDRESS,
            "handle slot {slot_address:#x} exceeds the entry payload"
        );
        match self.allocate_evacuation_entry(start) {
            Some(index) => {
                let entry = Entry::Evacuation {
                    handle_slot: slot_address,
                };
                self.entry(index).store(entry.encode(), Ordering::Release);
            }
            None => self.abort_compacting(start),
        }
    }

    /// Evacuation entries must land below the area and never grow the table.
    fn allocate_evacuation_entry(&self, start: u32) -> Option<u32> {
        let _guard = self.mutex.lock();
        let head = self.freelist_head.load(Ordering::Acquire);
        fatal_check!(
            head != SWEEPING_MARKER,
            "{} table marking while sweeping",
            K::NAME
        );
        if head == 0 || head >= start {
            return None;
        }
        Some(self.pop_locked(head))
    }

    fn abort_compacting(&self, start: u32) {
        if self
            .start_of_evacuation_area
            .compare_exchange(
                start,
                start | COMPACTION_ABORTED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            log::debug!(
                "{} table compaction aborted: freelist too short during marking",
                K::NAME
            );
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_compacting(&self) -> bool {
        self.start_of_evacuation_area.load(Ordering::Acquire) != 0
    }

    /// Number of entries on the freelist.
    pub fn freelist_len(&self) -> u32 {
        let _guard = self.mutex.lock();
        self.freelist_len_locked()
    }

    pub(super) fn freelist_len_locked(&self) -> u32 {
        let head = self.freelist_head.load(Ordering::Acquire);
        if head == 0 || head == SWEEPING_MARKER {
            return 0;
        }
        match self.decode(head, self.entry(head).load(Ordering::Acquire)) {
            Entry::Free { freelist_len, .. } => freelist_len,
            _ => 0,
        }
    }

    pub fn last_sweep(&self) -> Option<SweepStats> {
        *self.last_sweep.lock()
    }

    pub fn settings(&self) -> &TableSettings {
        &self.settings
    }

    pub fn cage(&self) -> SandboxAddressSpace {
        self.cage
    }

    /// Freelist indices in list order.
    #[cfg(test)]
    pub(crate) fn freelist_indices(&self) -> Vec<u32> {
        let _guard = self.mutex.lock();
        let mut out = Vec::new();
        let mut index = self.freelist_head.load(Ordering::Acquire);
        while index != 0 {
            out.push(index);
            match self.decode(index, self.entry(index).load(Ordering::Acquire)) {
                Entry::Free { next, .. } => index = next,
                other => panic!("freelist reaches {other:?} at {index}"),
            }
        }
        out
    }
}

impl<K: TableKind> Drop for PointerTable<K> {
    fn drop(&mut self) {
        self.vas
            .release(self.base.cast(), self.settings.reservation_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer_table::test_support::{TAG, OTHER_TAG, content, small_settings, table};
    use std::thread;

    #[test]
    fn first_handle_is_index_one() {
        let table = table::<External>(small_settings());
        assert_eq!(table.capacity(), 0);
        let handle = table.allocate_and_initialize_entry(content(0), TAG);
        assert_eq!(handle.index(), 1);
        assert_eq!(table.capacity(), table.entries_per_block);
        assert_eq!(table.freelist_len(), table.entries_per_block - 2);
    }

    #[test]
    fn allocate_get_set_round_trip() {
        let table = table::<External>(small_settings());
        let handles: Vec<_> = (0..100)
            .map(|i| table.allocate_and_initialize_entry(content(i), TAG))
            .collect();
        for (i, &h) in handles.iter().enumerate() {
            assert_eq!(table.get(h, TAG), content(i));
        }

        table.set(handles[7], content(1000), TAG);
        assert_eq!(table.get(handles[7], TAG), content(1000));
        assert_eq!(table.exchange(handles[7], content(1001), TAG), content(1000));
        assert_eq!(table.get(handles[7], TAG), content(1001));
        assert_eq!(table.get(PointerHandle::NULL, TAG), 0);
    }

    #[test]
    fn growth_spans_blocks() {
        let table = table::<External>(small_settings());
        let per_block = table.entries_per_block;
        let handles: Vec<_> = (0..per_block as usize * 2)
            .map(|i| table.allocate_and_initialize_entry(content(i), TAG))
            .collect();
        assert_eq!(table.capacity(), per_block * 3);
        assert_eq!(handles.last().map(|h| h.index()), Some(per_block * 2));
        assert_eq!(table.get(handles[per_block as usize], TAG), content(per_block as usize));
    }

    #[test]
    fn external_table_accepts_null_content() {
        let table = table::<External>(small_settings());
        let handle = table.allocate_and_initialize_entry(0, TAG);
        assert_eq!(table.get(handle, TAG), 0);
    }

    #[test]
    #[should_panic(expected = "does not accept null content")]
    fn trusted_table_rejects_null_content() {
        let table = table::<Trusted>(small_settings());
        table.allocate_and_initialize_entry(0, TAG);
    }

    #[test]
    #[should_panic(expected = "points into the cage")]
    fn in_cage_content_is_fatal() {
        let table = table::<External>(small_settings());
        let inside = table.cage().base() + 0x40;
        table.allocate_and_initialize_entry(inside, TAG);
    }

    #[test]
    #[should_panic(expected = "points into the cage")]
    fn set_revalidates_containment() {
        let table = table::<External>(small_settings());
        let handle = table.allocate_and_initialize_entry(content(1), TAG);
        table.set(handle, table.cage().base() + 0x80, TAG);
    }

    #[test]
    #[should_panic(expected = "points into the cage")]
    fn exchange_revalidates_containment() {
        let table = table::<Trusted>(small_settings());
        let handle = table.allocate_and_initialize_entry(content(1), TAG);
        table.exchange(handle, table.cage().base() + 0x80, TAG);
    }

    #[test]
    fn allow_listed_tags_may_point_into_the_cage() {
        let mut settings = small_settings();
        settings.migration_allow_list.push(OTHER_TAG);
        let table = table::<External>(settings);
        let inside = table.cage().base() + 0x40;
        let handle = table.allocate_and_initialize_entry(inside, OTHER_TAG);
        assert_eq!(table.get(handle, OTHER_TAG), inside);
    }

    #[test]
    #[should_panic(expected = "expected tag")]
    fn tag_mismatch_is_fatal() {
        let table = table::<External>(small_settings());
        let handle = table.allocate_and_initialize_entry(content(1), TAG);
        table.get(handle, OTHER_TAG);
    }

    #[test]
    #[should_panic(expected = "mistagged")]
    fn exchange_checks_the_old_tag() {
        let table = table::<External>(small_settings());
        let handle = table.allocate_and_initialize_entry(content(1), TAG);
        table.exchange(handle, content(2), OTHER_TAG);
    }

    #[test]
    #[should_panic(expected = "exceeds the entry payload")]
    fn wide_addresses_are_fatal() {
        let table = table::<External>(small_settings());
        table.allocate_and_initialize_entry(1 << 50, TAG);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn capacity_ceiling_is_fatal() {
        let mut settings = small_settings();
        settings.reservation_entries = settings.entries_per_block();
        let table = table::<External>(settings);
        for i in 0..table.entries_per_block as usize {
            table.allocate_and_initialize_entry(content(i), TAG);
        }
    }

    #[test]
    fn marking_twice_is_the_same_as_once() {
        let table = table::<External>(small_settings());
        let slot = HandleSlot::new(table.allocate_and_initialize_entry(content(3), TAG));
        unsafe { table.mark(&slot) };
        let once = table.entry(slot.load().index()).load(Ordering::Relaxed);
        unsafe { table.mark(&slot) };
        let twice = table.entry(slot.load().index()).load(Ordering::Relaxed);
        assert_eq!(once, twice);
        assert!(Entry::is_marked(twice));
    }

    #[test]
    fn entries_are_born_marked_only_while_marking() {
        let table = table::<External>(small_settings());
        let before = table.allocate_and_initialize_entry(content(1), TAG);
        table.start_marking();
        let during = table.allocate_and_initialize_entry(content(2), TAG);
        let word = |h: PointerHandle| table.entry(h.index()).load(Ordering::Relaxed);
        assert!(!Entry::is_marked(word(before)));
        assert!(Entry::is_marked(word(during)));

        // set keeps whatever the marker decided
        table.set(before, content(3), TAG);
        assert!(!Entry::is_marked(word(before)));
    }

    #[test]
    fn concurrent_allocation_and_reads() {
        let table = Arc::new(table::<External>(small_settings()));
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    let handles: Vec<_> = (0..1000)
                        .map(|i| {
                            let value = content(t * 10_000 + i);
                            (table.allocate_and_initialize_entry(value, TAG), value)
                        })
                        .collect();
                    for &(h, value) in &handles {
                        assert_eq!(table.get(h, TAG), value);
                    }
                    handles
                })
            })
            .collect();

        let mut all: Vec<_> = workers
            .into_iter()
            .flat_map(|w| w.join().expect("join worker"))
            .collect();
        assert_eq!(all.len(), 4000);
        for &(h, value) in &all {
            assert_eq!(table.get(h, TAG), value);
        }
        all.sort_by_key(|(h, _)| h.index());
        all.dedup_by_key(|(h, _)| h.index());
        assert_eq!(all.len(), 4000, "no entry handed out twice");
    }
}
