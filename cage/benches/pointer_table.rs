//! Run with:
//!   cargo bench --bench pointer_table

use std::sync::Arc;

use cage::{
    ExternalPointerTable, HandleSlot, OsVirtualAddressSpace, PointerHandle, PointerTag,
    SandboxAddressSpace, TableSettings,
};
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

const TAG: PointerTag = PointerTag::new(0x51);
const ENTRIES: usize = 10_000;

fn table() -> ExternalPointerTable {
    // nothing is ever allocated at this base; the layout only fences values
    let cage = SandboxAddressSpace::new(0x7f00_0000_0000, 32).expect("cage layout");
    let settings = TableSettings {
        reservation_entries: 1 << 20,
        compaction_min_table_bytes: 0,
        ..Default::default()
    };
    ExternalPointerTable::new(cage, Arc::new(OsVirtualAddressSpace), settings).expect("table")
}

fn content(i: usize) -> usize {
    0x1000_0000 + i * 16
}

fn fill(table: &ExternalPointerTable) -> Vec<PointerHandle> {
    (0..ENTRIES)
        .map(|i| table.allocate_and_initialize_entry(content(i), TAG))
        .collect()
}

fn bench_allocate(c: &mut Criterion) {
    c.bench_function("allocate 10k entries", |b| {
        b.iter_batched(
            table,
            |table| {
                black_box(fill(&table));
                table
            },
            BatchSize::PerIteration,
        )
    });
}

fn bench_get(c: &mut Criterion) {
    let table = table();
    let handles = fill(&table);
    c.bench_function("get 10k entries", |b| {
        b.iter(|| {
            let mut sum = 0usize;
            for &handle in &handles {
                sum = sum.wrapping_add(table.get(black_box(handle), TAG));
            }
            black_box(sum)
        })
    });
}

fn bench_sweep(c: &mut Criterion) {
    c.bench_function("mark half and sweep 10k entries", |b| {
        b.iter_batched(
            || {
                let table = table();
                let slots: Vec<HandleSlot> =
                    fill(&table).into_iter().map(HandleSlot::new).collect();
                (table, slots)
            },
            |(table, slots)| {
                table.start_marking();
                for slot in slots.iter().step_by(2) {
                    // SAFETY: the slots outlive the sweep below
                    unsafe { table.mark(slot) };
                }
                black_box(table.sweep_and_compact());
                (table, slots)
            },
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(benches, bench_allocate, bench_get, bench_sweep);
criterion_main!(benches);
