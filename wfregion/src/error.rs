//! Arena errors.

/// Errors reported by [`crate::Arena`] operations.
///
/// Failed operations never leave the arena half-updated: the allocation cursor and the committed
/// size are the same as they were before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// The virtual address range could not be reserved, either because the OS refused, or
    /// because the requested size was zero or too large to round up to whole pages.
    #[error("failed to reserve {size} bytes of virtual memory")]
    Reserve { size: usize },

    /// The configured commit size is not a power of two.
    #[error("commit size {size} is not a power of two")]
    CommitSize { size: usize },

    /// The OS could not back the reservation with more physical memory.
    #[error("failed to commit {size} bytes of physical memory")]
    Commit { size: usize },

    /// The allocation does not fit into the reservation. Arenas never grow their reservation, so
    /// the only remedy is to reserve more up front.
    #[error("arena exhausted: requested {requested} bytes, {available} bytes available")]
    Exhausted { requested: usize, available: usize },

    /// The OS refused to take physical memory back. The pages are still committed.
    #[error("failed to decommit {size} bytes of physical memory")]
    Decommit { size: usize },

    /// The OS refused to release the reservation.
    #[error("failed to release {size} bytes of virtual memory")]
    Release { size: usize },
}
