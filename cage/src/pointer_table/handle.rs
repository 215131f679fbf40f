use std::sync::atomic::{AtomicU32, Ordering};

pub const HANDLE_SHIFT: u32 = 8;
/// Highest number of entries any table can address.
pub const MAX_ENTRIES: u32 = 1 << (u32::BITS - HANDLE_SHIFT);

/// Type tag stored with every live entry. Tag 0 belongs to the null entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointerTag(u8);

impl PointerTag {
    pub(crate) const NULL: Self = Self(0);

    pub const fn new(raw: u8) -> Self {
        assert!(raw != 0, "pointer tag 0 is reserved for the null entry");
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub(crate) const fn from_bits(raw: u8) -> Self {
        Self(raw)
    }
}

/// Opaque reference to a table entry, safe to keep in untrusted memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct PointerHandle(u32);

impl PointerHandle {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_index(index: u32) -> Self {
        Self(index << HANDLE_SHIFT)
    }

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.0 >> HANDLE_SHIFT
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Handle field inside object memory. Its address is what an evacuation
/// entry records, so the slot must not move while it is marked.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct HandleSlot(AtomicU32);

impl HandleSlot {
    pub const fn new(handle: PointerHandle) -> Self {
        Self(AtomicU32::new(handle.0))
    }

    #[inline]
    pub fn load(&self) -> PointerHandle {
        PointerHandle(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, handle: PointerHandle) {
        self.0.store(handle.0, Ordering::Release);
    }
}
