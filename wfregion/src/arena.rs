use core::alloc::Layout;
use core::cell::Cell;
use core::ffi::c_void;
use core::mem::ManuallyDrop;
use core::ptr;
use core::ptr::NonNull;
use core::slice;
use core::str;

use allocator_api2::alloc::AllocError;
use allocator_api2::alloc::Allocator;
use bytemuck::Zeroable;

use crate::config::ArenaConfig;
use crate::config::RestorePolicy;
use crate::error::ArenaError;
use crate::scope::ArenaScope;
use crate::scope::Checkpoint;
use crate::vm::VirtualMemory;

/// Alignment used by [`Arena::alloc`] and [`Arena::alloc_zeroed`]. Enough for any scalar and the
/// common SIMD vector types.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// An arena backed by a single reservation of virtual memory.
///
/// The whole address range is reserved up front and never moves, so growing the arena is a matter
/// of committing more pages after the ones already in use. Allocations are never moved or
/// invalidated by other allocations. Memory is reclaimed in bulk, either entirely with
/// [`Arena::reset`] and [`Arena::release`], or down to a [`Checkpoint`] with [`Arena::restore`]
/// and [`Arena::scope`].
///
/// Allocating only needs a shared reference, but everything that rewinds the arena requires a
/// unique one, so references handed out by the typed allocation functions (e.g.
/// [`Arena::alloc_value`]) can't outlive the memory they point to. The raw pointers returned by
/// the untyped functions are not tracked and become dangling after rewinding past them.
///
/// Implements [`allocator_api2::alloc::Allocator`], so it can back `allocator_api2` collections.
#[derive(Debug)]
pub struct Arena {
    base: NonNull<u8>,

    // Offsets from base. Always allocated <= committed <= reserved, and dirty <= committed.
    allocated: Cell<usize>,
    committed: Cell<usize>,

    // Memory below this offset could have been written to since it was committed. Memory above is
    // still zeroed by the OS, so zeroed allocations don't have to clear it.
    dirty: Cell<usize>,

    reserved: usize,
    commit_size: usize,
    restore_policy: RestorePolicy,

    vm: VirtualMemory,
}

// SAFETY: The arena exclusively owns its reservation, so moving it to another thread is fine. It is
// not Sync, because its cursors are Cells.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates an arena that can hold up to `max_size` bytes (rounded up to the page size), using
    /// the virtual memory of the host OS.
    ///
    /// Only the address range is reserved. Physical memory is committed as the arena is used.
    #[cfg(any(target_family = "windows", target_family = "unix"))]
    pub fn new(max_size: usize) -> Result<Self, ArenaError> {
        Self::with_config(ArenaConfig::new(max_size))
    }

    /// Creates an arena configured by `config`, using the virtual memory of the host OS.
    #[cfg(any(target_family = "windows", target_family = "unix"))]
    pub fn with_config(config: ArenaConfig) -> Result<Self, ArenaError> {
        // SAFETY: The system virtual memory functions do what they say they do.
        unsafe { Self::with_virtual_memory(VirtualMemory::system(), config) }
    }

    /// Creates an arena that acquires its memory with the given virtual memory functions.
    ///
    /// `config.reserve_size` is rounded up to `vm.page_size`, and `config.commit_size` is raised
    /// to at least `vm.page_size`.
    ///
    /// Fails with [`ArenaError::CommitSize`] if `config.commit_size` is not a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `vm.page_size` is not a power of two.
    ///
    /// # Safety
    ///
    /// The functions in `vm` must do what [`VirtualMemory`] documents, in particular newly
    /// committed pages must read as zero.
    pub unsafe fn with_virtual_memory(vm: VirtualMemory, config: ArenaConfig) -> Result<Self, ArenaError> {
        assert!(vm.page_size.is_power_of_two());

        if !config.commit_size.is_power_of_two() {
            return Err(ArenaError::CommitSize {
                size: config.commit_size,
            });
        }

        // The reservation must end at or below isize::MAX, so that we can always add a Layout-sized
        // value to an offset without overflowing, and only then check whether it fits.
        let reserved = checked_align_to(config.reserve_size, vm.page_size)
            .filter(|&size| size > 0 && size <= isize::MAX as usize)
            .ok_or(ArenaError::Reserve {
                size: config.reserve_size,
            })?;

        let Some(base) = NonNull::new((vm.reserve)(reserved) as *mut u8) else {
            return Err(ArenaError::Reserve { size: reserved });
        };

        debug_assert!(addr(base) == align_to(addr(base), vm.page_size));

        log::debug!(
            "Reserved arena of {reserved} bytes at {base:?} (page size {}, commit size {})",
            vm.page_size,
            config.commit_size,
        );

        Ok(Self {
            base,

            allocated: Cell::new(0),
            committed: Cell::new(0),
            dirty: Cell::new(0),

            reserved,
            commit_size: usize::max(config.commit_size, vm.page_size),
            restore_policy: config.restore_policy,

            vm,
        })
    }

    /// Returns the start of the reserved address range. It stays the same for the lifetime of
    /// the arena.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Returns the address the next allocation would start at, if it required no alignment.
    pub fn head(&self) -> NonNull<u8> {
        // SAFETY: allocated is always within the reservation.
        unsafe { self.base.add(self.allocated.get()) }
    }

    /// Returns the number of bytes between the base and the head, including alignment padding.
    pub fn allocated_size(&self) -> usize {
        self.allocated.get()
    }

    /// Returns the number of bytes currently backed by physical memory. Always a multiple of the
    /// page size.
    pub fn committed_size(&self) -> usize {
        self.committed.get()
    }

    /// Returns the size of the reserved address range. The arena never allocates past this.
    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    /// Returns the number of bytes that can still be allocated, ignoring alignment padding.
    pub fn remaining_size(&self) -> usize {
        self.reserved - self.allocated.get()
    }

    pub fn page_size(&self) -> usize {
        self.vm.page_size
    }

    /// Allocates memory for `layout`. The contents of the memory are unspecified.
    ///
    /// Fails with [`ArenaError::Exhausted`] if the allocation doesn't fit in the reservation, and
    /// with [`ArenaError::Commit`] if the OS can't provide more physical memory. The arena is left
    /// untouched on failure.
    #[inline(always)]
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, ArenaError> {
        let ptr = self.allocate_bytes(layout.align(), layout.size(), false)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    /// Like [`Self::allocate`], but the returned memory is guaranteed to be zeroed.
    ///
    /// Memory that hasn't been handed out since it was committed is zeroed by the OS, so only the
    /// part of the allocation that reuses memory (e.g. after [`Self::reset`]) is cleared.
    #[inline(always)]
    pub fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, ArenaError> {
        let ptr = self.allocate_bytes(layout.align(), layout.size(), true)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    /// Allocates `size` bytes aligned to [`DEFAULT_ALIGNMENT`]. The memory is uninitialized.
    #[inline]
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.allocate_bytes(DEFAULT_ALIGNMENT, size, false)
    }

    /// Allocates `size` zeroed bytes aligned to [`DEFAULT_ALIGNMENT`].
    #[inline]
    pub fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.allocate_bytes(DEFAULT_ALIGNMENT, size, true)
    }

    /// Allocates `size` bytes aligned to `alignment`. The memory is uninitialized.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    #[inline]
    pub fn alloc_aligned(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.allocate_bytes(alignment, size, false)
    }

    /// Allocates `size` zeroed bytes aligned to `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    #[inline]
    pub fn alloc_aligned_zeroed(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.allocate_bytes(alignment, size, true)
    }

    /// Allocates `size` bytes directly at the head, without any alignment padding. The memory is
    /// uninitialized.
    #[inline]
    pub fn alloc_packed(&self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.allocate_bytes(1, size, false)
    }

    /// Allocates `size` zeroed bytes directly at the head, without any alignment padding.
    #[inline]
    pub fn alloc_packed_zeroed(&self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.allocate_bytes(1, size, true)
    }

    /// Moves `value` into the arena and returns a reference to it.
    ///
    /// The value's drop code never runs. Its memory is reclaimed when the arena is rewound.
    pub fn alloc_value<T>(&self, value: T) -> Result<&mut T, ArenaError> {
        let layout = Layout::new::<T>();
        let ptr: NonNull<T> = self.allocate_bytes(layout.align(), layout.size(), false)?.cast();

        // SAFETY: The memory is fresh, and properly sized and aligned for T.
        unsafe {
            ptr.write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    /// Copies `src` into the arena.
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<&mut [T], ArenaError> {
        let layout = Layout::for_value(src);
        let ptr: NonNull<T> = self.allocate_bytes(layout.align(), layout.size(), false)?.cast();

        // SAFETY: The memory is fresh, so it can't overlap src, and it is properly sized and aligned
        // for src.len() values of T.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            Ok(slice::from_raw_parts_mut(ptr.as_ptr(), src.len()))
        }
    }

    /// Allocates a slice of `len` zeroed values.
    pub fn alloc_slice_zeroed<T: Zeroable>(&self, len: usize) -> Result<&mut [T], ArenaError> {
        let layout = Layout::array::<T>(len).map_err(|_| ArenaError::Exhausted {
            requested: len.saturating_mul(size_of::<T>()),
            available: self.remaining_size(),
        })?;
        let ptr: NonNull<T> = self.allocate_bytes(layout.align(), layout.size(), true)?.cast();

        // SAFETY: All zeroes is a valid T, and the memory is zeroed, fresh, and properly sized and
        // aligned.
        unsafe { Ok(slice::from_raw_parts_mut(ptr.as_ptr(), len)) }
    }

    /// Copies `src` into the arena.
    pub fn alloc_str(&self, src: &str) -> Result<&mut str, ArenaError> {
        let bytes = self.alloc_slice_copy(src.as_bytes())?;

        // SAFETY: The bytes were copied from a str.
        unsafe { Ok(str::from_utf8_unchecked_mut(bytes)) }
    }

    /// Captures the current head, so that the arena can later be rewound to it with
    /// [`Self::restore`].
    #[inline]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.allocated.get())
    }

    /// Rewinds the head back to `checkpoint`, reclaiming everything allocated since it was captured.
    ///
    /// The reclaimed memory stays committed, unless the arena was created with
    /// [`RestorePolicy::Decommit`], in which case this also does [`Self::shrink_to_fit`]. A failure
    /// to decommit only means the memory stays committed, and is logged instead of reported.
    ///
    /// The head never moves forward, so restoring a checkpoint captured above the current head, e.g.
    /// before a [`Self::reset`], does nothing. Restoring a checkpoint taken from another arena is a
    /// logic error, and isn't detected.
    #[inline]
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        let allocated = usize::min(self.allocated.get(), checkpoint.allocated_size());
        self.allocated.set(allocated);

        if self.restore_policy == RestorePolicy::Decommit {
            if let Err(err) = self.shrink_to_fit() {
                log::warn!("Keeping memory committed after restore: {err}");
            }
        }
    }

    /// Creates a scope guard, which restores the arena to its current state once dropped.
    ///
    /// The guard dereferences to the arena, so it can be used to allocate and to create nested
    /// scopes, which must end before their parent does. The restore runs on every exit path,
    /// including early returns, `?`, and panics.
    ///
    /// ```
    /// use wfregion::Arena;
    ///
    /// fn process(arena: &mut Arena) -> Result<(), wfregion::ArenaError> {
    ///     let scope = arena.scope();
    ///     let temp = scope.alloc_slice_zeroed::<u32>(1024)?;
    ///     temp[0] = 42;
    ///
    ///     Ok(())
    /// }
    ///
    /// let mut arena = Arena::new(1 << 20).unwrap();
    /// process(&mut arena).unwrap();
    ///
    /// assert!(arena.allocated_size() == 0);
    /// ```
    pub fn scope(&mut self) -> ArenaScope<'_> {
        ArenaScope::new(self)
    }

    /// Runs `f` inside a scope (see [`Self::scope`]) and returns its result.
    pub fn with_scope<R>(&mut self, f: impl FnOnce(&mut Arena) -> R) -> R {
        let mut scope = self.scope();
        f(&mut scope)
    }

    /// Resets the head back to the base. All memory stays committed.
    ///
    /// This is very cheap, and is meant to be done often, e.g. once every frame.
    #[inline]
    pub fn reset(&mut self) {
        self.allocated.set(0);
    }

    /// Decommits all pages above the head, except the one the head points into.
    ///
    /// Shrinking an already shrunk arena does nothing. Not to be confused with
    /// [`Allocator::shrink`], which shrinks a single allocation.
    pub fn shrink_to_fit(&mut self) -> Result<(), ArenaError> {
        let committed = self.committed.get();
        let committed_post = align_to(self.allocated.get(), self.vm.page_size);
        if committed_post >= committed {
            return Ok(());
        }

        self.decommit_down_to(committed_post)?;

        log::debug!("Shrunk arena at {:?} from {committed} to {committed_post} bytes", self.base);

        Ok(())
    }

    /// Resets the arena and decommits all of its memory. The address range stays reserved.
    ///
    /// If decommitting fails, neither the head nor the committed memory change.
    pub fn release(&mut self) -> Result<(), ArenaError> {
        let committed = self.committed.get();
        if committed > 0 {
            self.decommit_down_to(0)?;
        }

        self.allocated.set(0);

        log::debug!("Released {committed} bytes of arena at {:?}", self.base);

        Ok(())
    }

    /// Destroys the arena and releases its address range back to the OS.
    ///
    /// Dropping the arena does the same, but can only log the failure.
    pub fn delete(self) -> Result<(), ArenaError> {
        let arena = ManuallyDrop::new(self);

        // SAFETY: The arena is never used again.
        unsafe { arena.release_reservation() }
    }

    #[inline(always)]
    fn allocate_bytes(&self, align: usize, size: usize, zeroed: bool) -> Result<NonNull<u8>, ArenaError> {
        assert!(align.is_power_of_two(), "Alignment must be a power of two, got {align}");

        let base = addr(self.base);
        let allocated = self.allocated.get();

        let exhausted = || ArenaError::Exhausted {
            requested: size,
            available: self.reserved - allocated,
        };

        // Align the address, not the offset, because the requested alignment can be larger than the
        // page alignment of base. Adding allocated to base can't overflow, because both the
        // reservation and allocated are bounded by isize::MAX.
        let allocated_pre = checked_align_to(base + allocated, align).ok_or_else(exhausted)? - base;
        let allocated_post = allocated_pre.checked_add(size).ok_or_else(exhausted)?;
        if allocated_post > self.reserved {
            return Err(exhausted());
        }

        if allocated_post > self.committed.get() {
            self.commit_up_to(allocated_post)?;
        }

        // SAFETY: allocated_pre is within the reservation.
        let ptr = unsafe { self.base.add(allocated_pre) };

        let dirty = self.dirty.get();
        if zeroed && allocated_pre < dirty {
            let len = usize::min(allocated_post, dirty) - allocated_pre;

            // SAFETY: The range is committed and not handed out to anyone else.
            unsafe {
                ptr.as_ptr().write_bytes(0, len);
            }
        }

        self.dirty.set(usize::max(dirty, allocated_post));
        self.allocated.set(allocated_post);

        Ok(ptr)
    }

    #[inline(never)]
    fn commit_up_to(&self, allocated_post: usize) -> Result<(), ArenaError> {
        debug_assert!(allocated_post <= self.reserved);

        let committed = self.committed.get();
        let committed_post = checked_align_to(allocated_post, self.commit_size)
            .map_or(self.reserved, |committed_post| usize::min(committed_post, self.reserved));

        debug_assert!(committed_post >= allocated_post);
        debug_assert!(committed_post > committed);

        let commit = self.vm.commit;
        let commit_size = committed_post - committed;

        // SAFETY: The range is page aligned and within the reservation.
        if unsafe { !commit(self.base.add(committed).as_ptr() as *mut c_void, commit_size) } {
            return Err(ArenaError::Commit { size: commit_size });
        }

        log::trace!(
            "Committed {commit_size} bytes of arena at {:?}, {committed_post}/{} bytes committed",
            self.base,
            self.reserved,
        );

        self.committed.set(committed_post);

        Ok(())
    }

    fn decommit_down_to(&self, committed_post: usize) -> Result<(), ArenaError> {
        let committed = self.committed.get();

        debug_assert!(committed_post < committed);
        debug_assert!(committed_post >= self.allocated.get() || committed_post == 0);
        debug_assert!(committed_post == align_to(committed_post, self.vm.page_size));

        let decommit = self.vm.decommit;
        let decommit_size = committed - committed_post;

        // SAFETY: The range is page aligned, committed and not handed out to anyone.
        if unsafe { !decommit(self.base.add(committed_post).as_ptr() as *mut c_void, decommit_size) } {
            return Err(ArenaError::Decommit { size: decommit_size });
        }

        self.committed.set(committed_post);
        self.dirty.set(usize::min(self.dirty.get(), committed_post));

        Ok(())
    }

    unsafe fn release_reservation(&self) -> Result<(), ArenaError> {
        let release = self.vm.release;
        if unsafe { !release(self.base.as_ptr() as *mut c_void, self.reserved) } {
            return Err(ArenaError::Release { size: self.reserved });
        }

        log::debug!("Released arena reservation of {} bytes at {:?}", self.reserved, self.base);

        Ok(())
    }

    fn is_last_allocation(&self, ptr: NonNull<u8>, layout: Layout) -> bool {
        // Can spuriously return false, because we can't see past the alignment padding the
        // allocation may have been given. The add can't overflow, because we'd have failed the
        // allocation in the first place.
        addr(ptr) + layout.size() == addr(self.base) + self.allocated.get()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: The arena is never used again.
        if let Err(err) = unsafe { self.release_reservation() } {
            log::error!("Leaking arena at {:?}: {err}", self.base);
        }
    }
}

unsafe impl Allocator for Arena {
    #[inline(always)]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Arena::allocate(self, layout).map_err(|_| AllocError)
    }

    #[inline(always)]
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Arena::allocate_zeroed(self, layout).map_err(|_| AllocError)
    }

    /// Deallocating always succeeds, but memory is not reclaimed. To reclaim memory, see
    /// [`Arena::reset`] and [`Arena::scope`].
    #[inline(always)]
    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {}

    /// Grows the last allocation in place. Other allocations are moved to fresh memory.
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if self.is_last_allocation(ptr, old_layout) && addr(ptr) & (new_layout.align() - 1) == 0 {
            let allocated_pre = addr(ptr) - addr(self.base);
            let allocated_post = allocated_pre + new_layout.size();
            if allocated_post > self.reserved {
                return Err(AllocError);
            }

            if allocated_post > self.committed.get() {
                self.commit_up_to(allocated_post).map_err(|_| AllocError)?;
            }

            self.dirty.set(usize::max(self.dirty.get(), allocated_post));
            self.allocated.set(allocated_post);

            return Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()));
        }

        let new_ptr = Arena::allocate(self, new_layout).map_err(|_| AllocError)?;

        // SAFETY: This is ok, because Arena::allocate always gives fresh memory, so the regions
        // won't overlap.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.cast::<u8>().as_ptr(), old_layout.size());
        }

        Ok(new_ptr)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        unsafe {
            let mut result = Allocator::grow(self, ptr, old_layout, new_layout)?;
            result.as_mut()[old_layout.size()..].fill(0);

            Ok(result)
        }
    }

    /// Shrinks the allocation. If it is the last one, the freed tail is reclaimed.
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if addr(ptr) & (new_layout.align() - 1) != 0 {
            let new_ptr = Arena::allocate(self, new_layout).map_err(|_| AllocError)?;

            // SAFETY: Fresh memory, the regions won't overlap.
            unsafe {
                ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.cast::<u8>().as_ptr(), new_layout.size());
            }

            return Ok(new_ptr);
        }

        if self.is_last_allocation(ptr, old_layout) {
            self.allocated.set(addr(ptr) - addr(self.base) + new_layout.size());
        }

        Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()))
    }
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.addr().get()
}

fn align_to(addr: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    debug_assert!(align.is_power_of_two());

    let mask = align - 1;
    (addr + mask) & !mask
}

fn checked_align_to(addr: usize, align: usize) -> Option<usize> {
    debug_assert!(align > 0);
    debug_assert!(align.is_power_of_two());

    let mask = align - 1;
    Some(addr.checked_add(mask)? & !mask)
}
