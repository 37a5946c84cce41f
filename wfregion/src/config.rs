//! Arena configuration.

/// What happens to committed pages above the cursor when a checkpoint is restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestorePolicy {
    /// Keep the pages committed, so that they are warm for reuse. Restoring is just a store.
    #[default]
    Retain,

    /// Decommit the pages above the restored cursor, trading a syscall per restore for lower
    /// resident memory. Behaves like calling [`crate::Arena::shrink_to_fit`] after every restore.
    Decommit,
}

/// Parameters of a virtual memory arena. All values are fixed once the arena is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of the virtual address range reserved for the arena. Rounded up to the page size.
    /// The arena can never allocate more than this.
    pub reserve_size: usize,

    /// Granularity of growth. When an allocation reaches past the committed memory, the arena
    /// commits up to the next multiple of this size, but never past the reservation.
    ///
    /// Must be a power of two, otherwise creating the arena fails. Values smaller than the page
    /// size commit single pages.
    pub commit_size: usize,

    pub restore_policy: RestorePolicy,
}

impl ArenaConfig {
    /// Commits as little as possible by default. The OS page size is used instead of this, if it
    /// is larger.
    pub const DEFAULT_COMMIT_SIZE: usize = 4 << 10;

    /// Creates a config for an arena of `reserve_size` bytes with default growth and restore
    /// behavior.
    pub const fn new(reserve_size: usize) -> Self {
        Self {
            reserve_size,
            commit_size: Self::DEFAULT_COMMIT_SIZE,
            restore_policy: RestorePolicy::Retain,
        }
    }

    pub const fn with_commit_size(mut self, commit_size: usize) -> Self {
        self.commit_size = commit_size;
        self
    }

    pub const fn with_restore_policy(mut self, restore_policy: RestorePolicy) -> Self {
        self.restore_policy = restore_policy;
        self
    }
}

impl Default for ArenaConfig {
    /// A 64 MiB arena.
    fn default() -> Self {
        Self::new(64 << 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ArenaConfig::default();
        assert!(config.reserve_size == 64 << 20);
        assert!(config.commit_size == ArenaConfig::DEFAULT_COMMIT_SIZE);
        assert!(config.restore_policy == RestorePolicy::Retain);
    }

    #[test]
    fn test_config_builders() {
        let config = ArenaConfig::new(1 << 30)
            .with_commit_size(32 << 20)
            .with_restore_policy(RestorePolicy::Decommit);

        assert!(config.reserve_size == 1 << 30);
        assert!(config.commit_size == 32 << 20);
        assert!(config.restore_policy == RestorePolicy::Decommit);
    }
}
