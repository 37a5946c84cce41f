//! Virtual memory primitives the arena is built on.
//!
//! The arena never talks to the OS directly. Instead, it receives a [`VirtualMemory`] table of
//! functions to reserve address space, commit and decommit pages inside the reservation, and
//! finally release the reservation. [`VirtualMemory::system`] provides these for Windows and Unix,
//! but callers can bring their own, e.g. to run the arena on top of a platform layer, or to
//! simulate running out of physical memory.

use core::ffi::c_void;

/// A table of virtual memory functions and the page size they operate with.
///
/// All sizes and pointers passed to the functions by the arena are multiples of `page_size`,
/// except the size passed to `reserve`, which is rounded up to the page size by the arena, and
/// may thus also be relied on to be a multiple.
#[derive(Debug, Clone, Copy)]
pub struct VirtualMemory {
    /// Reserves `size` bytes of address space without committing physical memory. Returns a
    /// page-aligned pointer to the reservation, or null on failure.
    pub reserve: fn(size: usize) -> *mut c_void,

    /// Makes the pages in `[ptr, ptr + size)` readable and writable. Pages must read as zero the
    /// first time they are accessed after being committed. Committing already committed pages
    /// must succeed and leave their contents untouched. Returns false on failure, in which case
    /// none of the pages may be considered committed.
    pub commit: unsafe fn(ptr: *mut c_void, size: usize) -> bool,

    /// Returns the physical memory backing `[ptr, ptr + size)` to the OS, while keeping the
    /// address range reserved. Returns false on failure, in which case the pages must remain
    /// committed with their contents intact.
    pub decommit: unsafe fn(ptr: *mut c_void, size: usize) -> bool,

    /// Releases the entire reservation starting at `ptr` of `size` bytes. Returns false on
    /// failure.
    pub release: unsafe fn(ptr: *mut c_void, size: usize) -> bool,

    /// The granularity of commits and decommits. Must be a power of two.
    pub page_size: usize,
}

#[cfg(any(target_family = "windows", target_family = "unix"))]
impl VirtualMemory {
    /// Virtual memory functions of the host OS.
    ///
    /// On Windows, these are `VirtualAlloc` with `MEM_RESERVE` and `MEM_COMMIT`, and `VirtualFree`
    /// with `MEM_DECOMMIT` and `MEM_RELEASE`.
    ///
    /// On Unix, the reservation is an inaccessible `mmap(2)` mapping. Committing makes pages
    /// accessible with `mprotect(2)`. On Linux, decommitting drops the pages with
    /// `madvise(MADV_DONTNEED)` and makes them inaccessible again. Other Unix systems don't promise
    /// zeroes after `MADV_DONTNEED`, so there decommitting maps fresh inaccessible pages over the
    /// range instead. If that fails, the range may have been partially unmapped.
    pub fn system() -> Self {
        Self {
            reserve: sys::reserve,
            commit: sys::commit,
            decommit: sys::decommit,
            release: sys::release,
            page_size: sys::page_size(),
        }
    }
}

#[cfg(target_family = "unix")]
mod sys {
    use core::ffi::c_void;
    use core::ptr;

    use libc::MAP_ANONYMOUS;
    use libc::MAP_FAILED;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    use libc::MAP_FIXED;
    use libc::MAP_PRIVATE;
    use libc::PROT_NONE;
    use libc::PROT_READ;
    use libc::PROT_WRITE;

    // Used only if sysconf fails, which it shouldn't for _SC_PAGESIZE.
    const FALLBACK_PAGE_SIZE: usize = 4096;

    pub fn page_size() -> usize {
        // Pages can be anything here, e.g. 4096 bytes on x64, or 16384 on Apple's M1 computers.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size < 1 || !(page_size as usize).is_power_of_two() {
            log::warn!("Unsupported page size {page_size}, assuming {FALLBACK_PAGE_SIZE}");
            return FALLBACK_PAGE_SIZE;
        }

        page_size as usize
    }

    pub fn reserve(size: usize) -> *mut c_void {
        let p = unsafe { libc::mmap(ptr::null_mut(), size, PROT_NONE, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0) };
        if p == MAP_FAILED {
            return ptr::null_mut();
        }

        p
    }

    pub unsafe fn commit(ptr: *mut c_void, size: usize) -> bool {
        unsafe { libc::mprotect(ptr, size, PROT_READ | PROT_WRITE) == 0 }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub unsafe fn decommit(ptr: *mut c_void, size: usize) -> bool {
        // On Linux, MADV_DONTNEED drops the pages of a private anonymous mapping, and they read as
        // zero once touched again. If it fails, nothing changed.
        if unsafe { libc::madvise(ptr, size, libc::MADV_DONTNEED) } != 0 {
            return false;
        }

        // The physical memory is gone at this point, so the decommit succeeded even if the pages
        // stay accessible.
        if unsafe { libc::mprotect(ptr, size, PROT_NONE) } != 0 {
            log::warn!("Failed to protect {size} decommitted bytes at {ptr:?}");
        }

        true
    }

    // NOTE(jt): Other systems don't promise zeroes after MADV_DONTNEED, so this maps fresh pages
    // over the range instead. Unlike madvise, a failed mmap may have already unmapped part of the
    // range, which we can only log.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub unsafe fn decommit(ptr: *mut c_void, size: usize) -> bool {
        let p = unsafe {
            libc::mmap(
                ptr,
                size,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
                -1,
                0,
            )
        };

        if p == MAP_FAILED {
            log::error!("Failed to remap {size} bytes at {ptr:?}, the range may be partially unmapped");
            return false;
        }

        true
    }

    pub unsafe fn release(ptr: *mut c_void, size: usize) -> bool {
        unsafe { libc::munmap(ptr, size) == 0 }
    }
}

#[cfg(target_family = "windows")]
mod sys {
    use core::ffi::c_void;
    use core::mem;
    use core::ptr;

    use windows_sys::Win32::System::Memory::MEM_COMMIT;
    use windows_sys::Win32::System::Memory::MEM_DECOMMIT;
    use windows_sys::Win32::System::Memory::MEM_RELEASE;
    use windows_sys::Win32::System::Memory::MEM_RESERVE;
    use windows_sys::Win32::System::Memory::PAGE_NOACCESS;
    use windows_sys::Win32::System::Memory::PAGE_READWRITE;
    use windows_sys::Win32::System::Memory::VirtualAlloc;
    use windows_sys::Win32::System::Memory::VirtualFree;
    use windows_sys::Win32::System::SystemInformation::GetSystemInfo;
    use windows_sys::Win32::System::SystemInformation::SYSTEM_INFO;

    pub fn page_size() -> usize {
        let mut system_info: SYSTEM_INFO = unsafe { mem::zeroed() };
        unsafe {
            GetSystemInfo(&mut system_info);
        }

        system_info.dwPageSize as usize
    }

    pub fn reserve(size: usize) -> *mut c_void {
        unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) }
    }

    pub unsafe fn commit(ptr: *mut c_void, size: usize) -> bool {
        // Note that MEM_COMMIT still isn't "MEM_ACTUALLY_REALLY_COMMIT", and there will still be a
        // page fault the first time we access each new page, after which the page will finally be
        // mapped.
        let p = unsafe { VirtualAlloc(ptr, size, MEM_COMMIT, PAGE_READWRITE) };
        !p.is_null()
    }

    pub unsafe fn decommit(ptr: *mut c_void, size: usize) -> bool {
        unsafe { VirtualFree(ptr, size, MEM_DECOMMIT) != 0 }
    }

    pub unsafe fn release(ptr: *mut c_void, _size: usize) -> bool {
        // NOTE(jt): Size must be zero when releasing on Windows, but it is used elsewhere.
        unsafe { VirtualFree(ptr, 0, MEM_RELEASE) != 0 }
    }
}
