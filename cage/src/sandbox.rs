//! Address arithmetic over the sandbox reservation ("the cage").
//!
//! The cage is one power-of-two sized reservation whose base is aligned to
//! its own size. That alignment lets every containment question be answered
//! by masking: an address is inside iff its high bits equal the base.
//! The first half of the cage holds normal pages, the second half large
//! pages.

use std::{ptr::NonNull, sync::Arc, sync::OnceLock};

use crate::{VirtualAddressSpace, fatal_check};

pub type Address = usize;

/// Default cage size: 4 GiB.
pub const DEFAULT_CAGE_SIZE_LOG2: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxAddressSpace {
    base: Address,
    size_log2: u32,
}

/// An address known to be inside a particular cage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CageAddress {
    address: Address,
    offset_mask: Address,
}

impl SandboxAddressSpace {
    pub fn new(base: Address, size_log2: u32) -> Result<Self, &'static str> {
        if size_log2 == 0 || size_log2 > usize::BITS / 2 {
            return Err("cage size must fit within half the pointer width");
        }
        if base == 0 {
            return Err("cage base must not be null");
        }
        let size = 1usize << size_log2;
        if base & (size - 1) != 0 {
            return Err("cage base must be aligned to the cage size");
        }
        if base.checked_add(size - 1).is_none() {
            return Err("cage must not wrap the address space");
        }
        Ok(Self { base, size_log2 })
    }

    /// Reserves a real cage of `2^size_log2` bytes.
    pub fn reserve(
        vas: Arc<dyn VirtualAddressSpace>,
        size_log2: u32,
    ) -> Result<Cage, &'static str> {
        if size_log2 > usize::BITS / 2 {
            return Err("cage size must fit within half the pointer width");
        }
        let size = 1usize << size_log2;
        let Some(start) = vas.reserve(size, size) else {
            crate::fatal::fatal_oom("cage reservation");
        };
        let space = Self::new(start.as_ptr() as Address, size_log2)?;
        log::debug!(
            "reserved cage at {:#x} ({} MiB)",
            space.base,
            size >> 20
        );
        Ok(Cage { space, start, vas })
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn size_log2(&self) -> u32 {
        self.size_log2
    }

    #[inline(always)]
    pub fn reservation_size(&self) -> usize {
        1usize << self.size_log2
    }

    #[inline(always)]
    pub fn normal_page_reservation_size(&self) -> usize {
        self.reservation_size() / 2
    }

    #[inline(always)]
    pub fn offset_from_address(&self, address: Address) -> usize {
        address & (self.reservation_size() - 1)
    }

    #[inline(always)]
    pub fn is_within_cage(&self, address: Address) -> bool {
        address & !(self.reservation_size() - 1) == self.base
    }

    /// Both addresses inside the cage, decided with a single shift.
    #[inline(always)]
    pub fn are_within_cage(&self, a: Address, b: Address) -> bool {
        ((a ^ self.base) | (b ^ self.base)) >> self.size_log2 == 0
    }

    #[inline(always)]
    pub fn is_within_normal_page_reservation(&self, address: Address) -> bool {
        address.wrapping_sub(self.base) < self.normal_page_reservation_size()
    }

    #[inline(always)]
    pub fn is_within_large_page_reservation(&self, address: Address) -> bool {
        let offset = address.wrapping_sub(self.base);
        offset >= self.normal_page_reservation_size()
            && offset < self.reservation_size()
    }

    #[inline]
    pub fn address(&self, address: Address) -> Option<CageAddress> {
        self.is_within_cage(address).then(|| CageAddress {
            address,
            offset_mask: self.reservation_size() - 1,
        })
    }
}

impl CageAddress {
    #[inline(always)]
    pub fn get(self) -> Address {
        self.address
    }

    #[inline(always)]
    pub fn offset(self) -> usize {
        self.address & self.offset_mask
    }
}

/// Owner of a reserved cage; releases the reservation on drop.
pub struct Cage {
    space: SandboxAddressSpace,
    start: NonNull<u8>,
    vas: Arc<dyn VirtualAddressSpace>,
}

// SAFETY: the reservation is only released on drop
unsafe impl Send for Cage {}
// SAFETY: the reservation is only released on drop
unsafe impl Sync for Cage {}

impl Cage {
    pub fn space(&self) -> SandboxAddressSpace {
        self.space
    }
}

impl Drop for Cage {
    fn drop(&mut self) {
        self.vas.release(self.start, self.space.reservation_size());
    }
}

// ── process global ───────────────────────────────────────────────────

static GLOBAL_CAGE: OnceLock<SandboxAddressSpace> = OnceLock::new();

/// Publishes the process-wide cage. Repeating the call with the same layout
/// is harmless; a different layout is fatal.
pub fn initialize_global(space: SandboxAddressSpace) {
    let installed = *GLOBAL_CAGE.get_or_init(|| space);
    fatal_check!(
        installed == space,
        "cage already initialized at {:#x}",
        installed.base
    );
}

#[inline]
pub fn try_global() -> Option<SandboxAddressSpace> {
    GLOBAL_CAGE.get().copied()
}

#[inline]
pub fn global() -> SandboxAddressSpace {
    match GLOBAL_CAGE.get() {
        Some(space) => *space,
        None => crate::fatal::fatal(format_args!("cage used before initialization")),
    }
}
