use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    pub const MADV_DONTNEED: i32 = 4;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap family
    /// # Safety
    /// see valid mmap, munmap, mprotect and madvise usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// Reserve address space without backing it.
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn reserve(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be a range obtained from `reserve`
    #[inline]
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }

    /// # Safety
    /// must be a page aligned range obtained from `reserve`
    #[inline]
    pub unsafe fn protect(ptr: *mut u8, len: usize, prot: i32) -> bool {
        // SAFETY: safe if contract holds
        unsafe { mprotect(ptr.cast(), len, prot) == 0 }
    }

    /// # Safety
    /// must be a page aligned range obtained from `reserve`
    #[inline]
    pub unsafe fn discard(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: safe if contract holds
        unsafe { madvise(ptr.cast(), len, MADV_DONTNEED) == 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePermissions {
    NoAccess,
    Read,
    ReadWrite,
}

/// Reservation and commit primitives over the platform's virtual memory.
///
/// Every range passed back in must lie inside a reservation returned by
/// [`VirtualAddressSpace::reserve`] and be page aligned.
pub trait VirtualAddressSpace: Send + Sync {
    fn page_size(&self) -> usize {
        OS_PAGE_SIZE
    }

    /// Reserves `size` bytes aligned to `alignment`, inaccessible until
    /// permissions are changed.
    fn reserve(&self, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    fn set_permissions(
        &self,
        start: NonNull<u8>,
        size: usize,
        permissions: PagePermissions,
    ) -> bool;

    /// Drops the backing pages and makes the range inaccessible. Later
    /// commits observe zeroed memory.
    fn decommit(&self, start: NonNull<u8>, size: usize) -> bool;

    fn release(&self, start: NonNull<u8>, size: usize);
}

/// [`VirtualAddressSpace`] backed by the process' own address space.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsVirtualAddressSpace;

#[cfg(unix)]
impl VirtualAddressSpace for OsVirtualAddressSpace {
    fn reserve(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        debug_assert!(size.is_multiple_of(OS_PAGE_SIZE));
        debug_assert!(alignment.is_power_of_two());

        if alignment <= OS_PAGE_SIZE {
            // SAFETY: null is checked by NonNull
            return NonNull::new(unsafe { unix::reserve(size) });
        }

        // over-reserve, then trim both ends down to an aligned window
        let padded = size.checked_add(alignment)?;
        // SAFETY: null is checked below
        let raw = unsafe { unix::reserve(padded) };
        if raw.is_null() {
            return None;
        }
        let raw_addr = raw as usize;
        let aligned = (raw_addr + alignment - 1) & !(alignment - 1);
        let head = aligned - raw_addr;
        let tail = padded - head - size;
        // SAFETY: both pieces lie inside the padded reservation
        unsafe {
            if head > 0 {
                unix::release(raw, head);
            }
            if tail > 0 {
                unix::release(raw.add(head + size), tail);
            }
        }
        NonNull::new(aligned as *mut u8)
    }

    fn set_permissions(
        &self,
        start: NonNull<u8>,
        size: usize,
        permissions: PagePermissions,
    ) -> bool {
        let prot = match permissions {
            PagePermissions::NoAccess => unix::PROT_NONE,
            PagePermissions::Read => unix::PROT_READ,
            PagePermissions::ReadWrite => unix::PROT_READ | unix::PROT_WRITE,
        };
        // SAFETY: caller passes a range from `reserve`
        unsafe { unix::protect(start.as_ptr(), size, prot) }
    }

    fn decommit(&self, start: NonNull<u8>, size: usize) -> bool {
        // SAFETY: caller passes a range from `reserve`
        unsafe {
            unix::discard(start.as_ptr(), size)
                && unix::protect(start.as_ptr(), size, unix::PROT_NONE)
        }
    }

    fn release(&self, start: NonNull<u8>, size: usize) {
        // SAFETY: caller passes a range from `reserve`
        unsafe { unix::release(start.as_ptr(), size) };
    }
}
