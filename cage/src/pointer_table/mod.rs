//! Indirection tables for pointers that must not live in sandboxed memory.
//!
//! Objects inside the cage store a 32-bit [`PointerHandle`]; the table maps
//! it to a tagged address outside the cage. Entries are garbage collected by
//! mark and sweep, and the table compacts itself by evacuating live entries
//! out of its trailing blocks during marking.

mod entry;
mod handle;
mod kind;
mod sweep;
mod table;

pub use entry::{Entry, MAX_ENTRY_ADDRESS};
pub use handle::{HANDLE_SHIFT, HandleSlot, MAX_ENTRIES, PointerHandle, PointerTag};
pub use kind::{External, TableKind, Trusted};
pub use sweep::{CompactionOutcome, SweepStats};
pub use table::{ExternalPointerTable, PointerTable, TrustedPointerTable};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::{PointerTable, PointerTag, TableKind};
    use crate::{
        OsVirtualAddressSpace,
        sandbox::{Address, SandboxAddressSpace},
        settings::TableSettings,
    };

    pub const TAG: PointerTag = PointerTag::new(0x11);
    pub const OTHER_TAG: PointerTag = PointerTag::new(0x22);

    /// A cage layout nothing in the tests allocates in.
    pub fn cage() -> SandboxAddressSpace {
        SandboxAddressSpace::new(0x7f00_0000_0000, 32).expect("cage layout")
    }

    /// Off-cage content address.
    pub fn content(i: usize) -> Address {
        0x1000_0000 + i * 16
    }

    /// 512 entries per block; compaction only limited by the free ratio.
    pub fn small_settings() -> TableSettings {
        TableSettings {
            block_size: 4096,
            reservation_entries: 1 << 16,
            compaction_min_table_bytes: 0,
            ..Default::default()
        }
    }

    pub fn table<K: TableKind>(settings: TableSettings) -> PointerTable<K> {
        PointerTable::new(cage(), Arc::new(OsVirtualAddressSpace), settings).expect("table")
    }
}
