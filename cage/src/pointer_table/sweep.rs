use std::sync::atomic::Ordering;

use crate::{
    fatal_check,
    pointer_table::{
        Entry, HandleSlot, PointerHandle, PointerTable, TableKind,
        table::{COMPACTION_ABORTED_BIT, ENTRY_SIZE, SWEEPING_MARKER},
    },
    sandbox::Address,
};

/// How a compacting sweep went. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// The whole evacuation area was freed.
    Success,
    /// Marking finished, but entries allocated afterwards landed inside the
    /// evacuation area, so only the blocks above them were freed.
    PartialSuccess,
    /// The freelist ran short during marking. The table was swept in full.
    AbortedDuringMarking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Live entries, not counting the null entry.
    pub live_entries: u32,
    pub free_entries: u32,
    pub capacity: u32,
    pub decommitted_blocks: u32,
    pub compaction: Option<CompactionOutcome>,
}

impl<K: TableKind> PointerTable<K> {
    /// Begins a marking phase: new entries are born marked until the next
    /// sweep, and compaction starts if the table qualifies.
    pub fn start_marking(&self) {
        self.marking.store(true, Ordering::Release);
        self.start_compacting_if_needed();
    }

    /// Starts compacting when the table is large and sparse enough. The
    /// evacuation area is the trailing half of the freelist, rounded down
    /// to whole blocks. Returns whether the table is compacting.
    pub fn start_compacting_if_needed(&self) -> bool {
        let _guard = self.mutex.lock();
        if self.is_compacting() {
            return true;
        }
        let epb = self.entries_per_block;
        let capacity = self.capacity();
        let freelist_len = self.freelist_len_locked();

        let table_bytes = capacity as usize * ENTRY_SIZE;
        let free_ratio = f64::from(freelist_len) / f64::from(capacity.max(1));
        let blocks_to_evacuate = (freelist_len / 2) / epb;
        if table_bytes < self.settings.compaction_min_table_bytes
            || free_ratio < self.settings.compaction_min_free_ratio
            || blocks_to_evacuate == 0
        {
            return false;
        }

        let start = capacity - blocks_to_evacuate * epb;
        self.start_of_evacuation_area
            .store(start, Ordering::Release);
        log::debug!(
            "{} table compacting: evacuating {blocks_to_evacuate} blocks from entry {start}",
            K::NAME
        );
        true
    }

    /// Frees every unmarked entry, clears marks, resolves evacuations and
    /// releases trailing empty blocks.
    ///
    /// The mutator must be stopped. Allocating while this runs is fatal.
    pub fn sweep_and_compact(&self) -> SweepStats {
        let old_head = self
            .freelist_head
            .swap(SWEEPING_MARKER, Ordering::AcqRel);
        fatal_check!(
            old_head != SWEEPING_MARKER,
            "{} table swept concurrently",
            K::NAME
        );
        self.marking.store(false, Ordering::Release);
        let start = self.start_of_evacuation_area.swap(0, Ordering::AcqRel);

        let epb = self.entries_per_block;
        let old_capacity = self.capacity();
        if old_capacity == 0 {
            self.freelist_head.store(0, Ordering::Release);
            return self.record(SweepStats {
                live_entries: 0,
                free_entries: 0,
                capacity: 0,
                decommitted_blocks: 0,
                compaction: None,
            });
        }

        let evacuation_start = start & !COMPACTION_ABORTED_BIT;
        let mut last_in_use_block = old_capacity - epb;
        let compaction = (start != 0).then(|| {
            if start & COMPACTION_ABORTED_BIT != 0 {
                CompactionOutcome::AbortedDuringMarking
            } else if old_head == 0 || old_head > start {
                if old_head != 0 {
                    last_in_use_block = old_head - old_head % epb;
                }
                CompactionOutcome::PartialSuccess
            } else {
                last_in_use_block = start - epb;
                CompactionOutcome::Success
            }
        });

        // top to bottom so the rebuilt freelist comes out sorted
        let mut freelist_head = 0u32;
        let mut freelist_size = 0u32;
        for index in (1..last_in_use_block + epb).rev() {
            let word = self.entry(index).load(Ordering::Relaxed);
            let live = match self.decode(index, word) {
                Entry::Evacuation { handle_slot } => {
                    self.resolve_evacuation(index, handle_slot, evacuation_start)
                }
                Entry::Live { marked: true, .. } => {
                    self.entry(index)
                        .store(Entry::clear_mark(word), Ordering::Relaxed);
                    true
                }
                Entry::Live { .. } | Entry::Free { .. } => false,
            };
            if !live {
                freelist_size += 1;
                let entry = Entry::Free {
                    next: freelist_head,
                    freelist_len: freelist_size,
                };
                self.entry(index).store(entry.encode(), Ordering::Relaxed);
                freelist_head = index;
            }

            if index == last_in_use_block && freelist_size == epb {
                last_in_use_block -= epb;
                freelist_head = 0;
                freelist_size = 0;
            }
        }

        let new_capacity = last_in_use_block + epb;
        let decommitted_blocks = (old_capacity - new_capacity) / epb;
        if new_capacity < old_capacity {
            self.decommit_tail(new_capacity, old_capacity);
        }
        self.freelist_head.store(freelist_head, Ordering::Release);

        let stats = SweepStats {
            live_entries: new_capacity - 1 - freelist_size,
            free_entries: freelist_size,
            capacity: new_capacity,
            decommitted_blocks,
            compaction,
        };
        log::debug!(
            "{} table swept: {} live, {} free, capacity {} (-{} blocks), compaction {:?}",
            K::NAME,
            stats.live_entries,
            stats.free_entries,
            stats.capacity,
            stats.decommitted_blocks,
            stats.compaction
        );
        self.record(stats)
    }

    fn record(&self, stats: SweepStats) -> SweepStats {
        *self.last_sweep.lock() = Some(stats);
        stats
    }

    /// Moves the entry the slot refers to into `index` and repoints the slot.
    /// Returns false, leaving `index` to be freed, when the slot no longer
    /// refers into the evacuation area.
    fn resolve_evacuation(
        &self,
        index: u32,
        handle_slot: Address,
        evacuation_start: u32,
    ) -> bool {
        // SAFETY: mark keeps the slot alive and in place until the sweep
        let slot = unsafe { &*(handle_slot as *const HandleSlot) };
        let handle = slot.load();
        // rewritten after marking, the entry it was marked for is not its own
        if handle.is_null() || handle.index() < evacuation_start {
            log::trace!(
                "{} evacuation entry {index} dropped: slot now holds {:#x}",
                K::NAME,
                handle.raw()
            );
            return false;
        }
        let old_index = self.handle_to_index(handle);
        debug_assert!(old_index > index, "evacuation must move entries down");
        let old_word = self.entry(old_index).load(Ordering::Relaxed);
        fatal_check!(
            matches!(Entry::decode(old_word), Some(Entry::Live { .. })),
            "{} evacuation source {old_index} is not live",
            K::NAME
        );
        self.entry(index)
            .store(Entry::clear_mark(old_word), Ordering::Relaxed);
        slot.store(PointerHandle::from_index(index));
        if cfg!(debug_assertions) {
            // catches a second handle still referring to the old entry
            self.entry(old_index).store(0, Ordering::Relaxed);
        }
        true
    }

    fn decommit_tail(&self, new_capacity: u32, old_capacity: u32) {
        // SAFETY: both bounds lie within the committed part of the reservation
        let start = unsafe { self.base.add(new_capacity as usize) };
        let bytes = (old_capacity - new_capacity) as usize * ENTRY_SIZE;
        fatal_check!(
            self.vas.decommit(start.cast(), bytes),
            "{} table failed to decommit {bytes} bytes",
            K::NAME
        );
        self.capacity.store(new_capacity, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer_table::{
        External,
        test_support::{TAG, content, small_settings, table},
    };

    /// Allocates `n` entries and returns their slots alongside the content.
    fn populate<K: TableKind>(table: &PointerTable<K>, n: usize) -> Vec<(Box<HandleSlot>, Address)> {
        (0..n)
            .map(|i| {
                let value = content(i);
                let handle = table.allocate_and_initialize_entry(value, TAG);
                (Box::new(HandleSlot::new(handle)), value)
            })
            .collect()
    }

    fn mark_all<K: TableKind>(table: &PointerTable<K>, slots: &[&(Box<HandleSlot>, Address)]) {
        for (slot, _) in slots {
            // SAFETY: slots are boxed and outlive the sweep
            unsafe { table.mark(slot) };
        }
    }

    #[test]
    fn sweep_keeps_marked_entries() {
        let table = table::<External>(small_settings());
        let entries = populate(&table, 1000);
        let kept: Vec<_> = entries.iter().step_by(2).collect();

        table.start_marking();
        mark_all(&table, &kept);
        let stats = table.sweep_and_compact();

        assert_eq!(stats.live_entries, 500);
        for (slot, value) in &kept {
            assert_eq!(table.get(slot.load(), TAG), *value);
        }
        assert_eq!(table.last_sweep(), Some(stats));
        assert!(!table.is_marking());
    }

    #[test]
    fn freelist_is_sorted_and_counts_every_dead_entry() {
        let table = table::<External>(small_settings());
        let epb = table.entries_per_block as usize;
        let n = 1000;
        let entries = populate(&table, n);
        let kept: Vec<_> = entries.iter().take(300).collect();
        let capacity_before = table.capacity() as usize;
        assert!(capacity_before <= n.div_ceil(epb) * epb);

        table.start_marking();
        mark_all(&table, &kept);
        let stats = table.sweep_and_compact();

        let freelist = table.freelist_indices();
        assert_eq!(freelist.len() as u32, stats.free_entries);
        assert_eq!(freelist.len(), table.capacity() as usize - 1 - 300);
        assert!(freelist.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(table.freelist_len(), stats.free_entries);
        assert!(table.capacity() as usize <= capacity_before);
    }

    #[test]
    fn empty_trailing_blocks_are_decommitted_and_regrown() {
        let table = table::<External>(small_settings());
        let epb = table.entries_per_block;
        let entries = populate(&table, epb as usize * 3);
        assert_eq!(table.capacity(), epb * 4);

        let kept: Vec<_> = entries.iter().take(10).collect();
        mark_all(&table, &kept);
        let stats = table.sweep_and_compact();
        assert_eq!(stats.capacity, epb);
        assert_eq!(stats.decommitted_blocks, 3);
        assert_eq!(table.capacity(), epb);

        // regrowing recommits zeroed memory and keeps working
        let more = populate(&table, epb as usize * 2);
        for (slot, value) in more.iter().chain(kept.iter().copied()) {
            assert_eq!(table.get(slot.load(), TAG), *value);
        }
    }

    #[test]
    fn sweeping_an_empty_table_is_a_no_op() {
        let table = table::<External>(small_settings());
        let stats = table.sweep_and_compact();
        assert_eq!(stats.capacity, 0);
        let handle = table.allocate_and_initialize_entry(content(1), TAG);
        assert_eq!(handle.index(), 1);
    }

    /// Four blocks, survivors at the bottom of block 0 and in block 3.
    /// After one plain sweep the freelist is large enough to compact.
    fn fragmented_table() -> (PointerTable<External>, Vec<(Box<HandleSlot>, Address)>) {
        let table = table::<External>(small_settings());
        let epb = table.entries_per_block as usize;
        let entries = populate(&table, 4 * epb - 1);
        let survivors: Vec<_> = entries
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i < 100 || (3 * epb + 300..3 * epb + 310).contains(i))
            .map(|(_, e)| e)
            .collect();
        let refs: Vec<_> = survivors.iter().collect();
        table.start_marking();
        assert!(!table.is_compacting());
        mark_all(&table, &refs);
        let stats = table.sweep_and_compact();
        assert_eq!(stats.live_entries, 110);
        assert_eq!(stats.capacity, 4 * epb as u32);
        (table, survivors)
    }

    #[test]
    fn successful_compaction_shrinks_the_table() {
        let (table, survivors) = fragmented_table();
        let epb = table.entries_per_block;
        let before: Vec<_> = survivors.iter().map(|(s, _)| s.load().index()).collect();

        table.start_marking();
        assert!(table.is_compacting());
        let refs: Vec<_> = survivors.iter().collect();
        mark_all(&table, &refs);
        let stats = table.sweep_and_compact();

        assert_eq!(stats.compaction, Some(CompactionOutcome::Success));
        assert_eq!(stats.capacity, epb);
        assert_eq!(stats.decommitted_blocks, 3);
        assert_eq!(stats.live_entries, 110);
        assert!(!table.is_compacting());
        for ((slot, value), old) in survivors.iter().zip(before) {
            let index = slot.load().index();
            assert!(index <= old, "entry moved up from {old} to {index}");
            assert!(index < table.capacity());
            assert_eq!(table.get(slot.load(), TAG), *value);
        }
    }

    #[test]
    fn double_marking_allocates_one_evacuation_entry() {
        let (table, survivors) = fragmented_table();
        table.start_marking();
        let free_before = table.freelist_len();
        let refs: Vec<_> = survivors.iter().collect();
        mark_all(&table, &refs);
        mark_all(&table, &refs);
        assert_eq!(table.freelist_len(), free_before - 10);
        let stats = table.sweep_and_compact();
        assert_eq!(stats.compaction, Some(CompactionOutcome::Success));
        assert_eq!(stats.live_entries, 110);
    }

    #[test]
    fn allocation_into_the_evacuation_area_is_partial_success() {
        let (table, survivors) = fragmented_table();
        let epb = table.entries_per_block;
        table.start_marking();
        let refs: Vec<_> = survivors.iter().collect();
        mark_all(&table, &refs);

        // drain the freelist below the area and a little beyond
        let below = table
            .freelist_indices()
            .iter()
            .filter(|&&i| i < 3 * epb)
            .count();
        let late = populate(&table, below + 5);
        let stats = table.sweep_and_compact();

        assert_eq!(stats.compaction, Some(CompactionOutcome::PartialSuccess));
        assert_eq!(stats.capacity, 4 * epb);
        for (slot, value) in survivors.iter().chain(late.iter()) {
            assert_eq!(table.get(slot.load(), TAG), *value);
        }
    }

    #[test]
    fn short_freelist_aborts_compaction() {
        let (table, survivors) = fragmented_table();
        let epb = table.entries_per_block;
        table.start_marking();

        let below = table
            .freelist_indices()
            .iter()
            .filter(|&&i| i < 3 * epb)
            .count();
        let late = populate(&table, below);
        let refs: Vec<_> = survivors.iter().collect();
        mark_all(&table, &refs);
        assert!(table.is_compacting());
        let stats = table.sweep_and_compact();

        assert_eq!(
            stats.compaction,
            Some(CompactionOutcome::AbortedDuringMarking)
        );
        for (slot, value) in survivors.iter().chain(late.iter()) {
            assert_eq!(table.get(slot.load(), TAG), *value);
        }
        assert_eq!(stats.live_entries, 110 + below as u32);
    }

    #[test]
    fn slot_cleared_after_marking_stays_null() {
        let (table, survivors) = fragmented_table();
        let epb = table.entries_per_block;
        table.start_marking();
        assert!(table.is_compacting());
        let refs: Vec<_> = survivors.iter().collect();
        mark_all(&table, &refs);

        // the mutator drops its last-block reference before the sweep
        let (cleared, _) = &survivors[survivors.len() - 1];
        assert!(cleared.load().index() >= 3 * epb);
        cleared.store(PointerHandle::NULL);
        let stats = table.sweep_and_compact();

        assert!(cleared.load().is_null());
        assert_eq!(table.get(cleared.load(), TAG), 0);
        assert_eq!(stats.compaction, Some(CompactionOutcome::Success));
        assert_eq!(stats.live_entries, 109);
        assert_eq!(table.freelist_indices().len() as u32, stats.free_entries);
        for (slot, value) in &survivors[..survivors.len() - 1] {
            assert_eq!(table.get(slot.load(), TAG), *value);
        }
    }

    #[test]
    fn slot_repointed_below_the_area_keeps_its_entry() {
        let (table, survivors) = fragmented_table();
        table.start_marking();
        let refs: Vec<_> = survivors.iter().collect();
        mark_all(&table, &refs);

        // the last-block slot now shares the first survivor's entry
        let (first, first_value) = &survivors[0];
        let (moved, _) = &survivors[survivors.len() - 1];
        moved.store(first.load());
        let stats = table.sweep_and_compact();

        assert_eq!(moved.load(), first.load());
        assert_eq!(table.get(moved.load(), TAG), *first_value);
        assert_eq!(stats.live_entries, 109);
    }

    #[test]
    #[should_panic(expected = "allocation while sweeping")]
    fn allocating_during_a_sweep_is_fatal() {
        let table = table::<External>(small_settings());
        populate(&table, 4);
        table
            .freelist_head
            .store(SWEEPING_MARKER, Ordering::Release);
        table.allocate_and_initialize_entry(content(9), TAG);
    }
}
