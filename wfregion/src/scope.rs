use core::ops::Deref;
use core::ops::DerefMut;

use crate::arena::Arena;

/// A saved position of an arena's head. See [`Arena::checkpoint`] and [`Arena::restore`].
///
/// Checkpoints own nothing. They can be freely copied and dropped, but must only be restored into
/// the arena they were captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checkpoint {
    allocated: usize,
}

impl Checkpoint {
    pub(crate) const fn new(allocated: usize) -> Self {
        Self { allocated }
    }

    /// The allocated size of the arena at the time the checkpoint was captured.
    pub const fn allocated_size(&self) -> usize {
        self.allocated
    }
}

/// A scoped arena, created with [`Arena::scope`]. Dereferences to the arena it was created from.
///
/// Once dropped, it restores the arena to the checkpoint captured at its creation, reclaiming all
/// memory allocated within the scope.
///
/// The scope holds a unique borrow of its parent for as long as it lives. Nested scopes borrow
/// the enclosing scope in turn, so they always end in reverse order of creation, and nothing
/// allocated inside a scope (through the typed allocation functions or `allocator_api2`
/// collections) can outlive it.
///
/// ```compile_fail
/// use wfregion::Arena;
///
/// let mut arena = Arena::new(1 << 20).unwrap();
/// let value = {
///     let scope = arena.scope();
///     scope.alloc_value(42).unwrap()
/// };
///
/// assert!(*value == 42);
/// ```
#[derive(Debug)]
pub struct ArenaScope<'a> {
    arena: &'a mut Arena,
    checkpoint: Checkpoint,
}

impl<'a> ArenaScope<'a> {
    pub(crate) fn new(arena: &'a mut Arena) -> Self {
        let checkpoint = arena.checkpoint();
        Self { arena, checkpoint }
    }

    /// The checkpoint this scope restores once dropped.
    pub fn entry_checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }
}

impl Drop for ArenaScope<'_> {
    fn drop(&mut self) {
        self.arena.restore(self.checkpoint);
    }
}

impl Deref for ArenaScope<'_> {
    type Target = Arena;

    fn deref(&self) -> &Self::Target {
        &*self.arena
    }
}

impl DerefMut for ArenaScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.arena
    }
}

#[cfg(test)]
#[cfg(any(target_family = "windows", target_family = "unix"))]
mod tests {
    extern crate std;

    use std::panic;
    use std::panic::AssertUnwindSafe;

    use allocator_api2::vec::Vec;

    use super::*;
    use crate::error::ArenaError;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scope_restores_on_drop() {
        let mut arena = Arena::new(1 << 20).unwrap();
        arena.alloc(100).unwrap();
        let allocated = arena.allocated_size();

        {
            let scope = arena.scope();
            assert!(scope.entry_checkpoint().allocated_size() == allocated);

            scope.alloc(1000).unwrap();
            assert!(scope.allocated_size() > allocated + 1000);
        }

        assert!(arena.allocated_size() == allocated);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_nested_scopes() {
        let mut arena = Arena::new(1 << 20).unwrap();

        let mut outer = arena.scope();
        outer.alloc(10).unwrap();
        let outer_allocated = outer.allocated_size();

        {
            let mut inner = outer.scope();
            inner.alloc(20).unwrap();
            let inner_allocated = inner.allocated_size();

            {
                let innermost = inner.scope();
                innermost.alloc(30).unwrap();
            }

            assert!(inner.allocated_size() == inner_allocated);
        }

        assert!(outer.allocated_size() == outer_allocated);
        drop(outer);

        assert!(arena.allocated_size() == 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scope_restores_on_early_return() {
        fn fallible(arena: &mut Arena, fail: bool) -> Result<u32, ArenaError> {
            let scope = arena.scope();
            let values = scope.alloc_slice_copy(&[1u32, 2, 3])?;

            if fail {
                scope.alloc(usize::MAX)?;
            }

            Ok(values.iter().sum())
        }

        let mut arena = Arena::new(1 << 20).unwrap();

        assert!(fallible(&mut arena, false).unwrap() == 6);
        assert!(arena.allocated_size() == 0);

        assert!(matches!(fallible(&mut arena, true), Err(ArenaError::Exhausted { .. })));
        assert!(arena.allocated_size() == 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scope_restores_on_panic() {
        let mut arena = Arena::new(1 << 20).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let scope = arena.scope();
            scope.alloc(1000).unwrap();
            panic!("Oops");
        }));

        assert!(result.is_err());
        assert!(arena.allocated_size() == 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_with_scope() {
        let mut arena = Arena::new(1 << 20).unwrap();

        let sum = arena.with_scope(|temp| {
            let mut v = Vec::new_in(&*temp);
            for i in 0..100u32 {
                v.push(i);
            }

            v.iter().sum::<u32>()
        });

        assert!(sum == 4950);
        assert!(arena.allocated_size() == 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scope_reset_inside_is_not_undone() {
        let mut arena = Arena::new(1 << 20).unwrap();
        arena.alloc(100).unwrap();

        {
            let mut scope = arena.scope();
            scope.alloc(100).unwrap();

            // Rewinding below the scope's checkpoint is allowed, and dropping the scope won't move
            // the head forward again.
            scope.reset();
        }

        assert!(arena.allocated_size() == 0);
    }
}
