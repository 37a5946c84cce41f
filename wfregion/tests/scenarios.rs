#![cfg(any(target_family = "windows", target_family = "unix"))]

use std::slice;
use std::thread;

use allocator_api2::alloc::Allocator;
use allocator_api2::vec::Vec;
use wfregion::Arena;
use wfregion::ArenaConfig;
use wfregion::ArenaError;
use wfregion::RestorePolicy;

#[test]
fn test_megabyte_arena_with_checkpoint() {
    let mut arena = Arena::new(1 << 20).unwrap();
    assert!(arena.reserved_size() == 1 << 20);

    let p = arena.alloc_aligned(16, 100).unwrap();
    assert!(p.as_ptr() as usize % 16 == 0);
    assert!(arena.allocated_size() >= 100);
    let allocated = arena.allocated_size();

    let checkpoint = arena.checkpoint();

    let size = 900 << 10;
    let q = arena.alloc_zeroed(size).unwrap();
    let zeroed = unsafe { slice::from_raw_parts_mut(q.as_ptr(), size) };
    assert!(zeroed.iter().all(|&b| b == 0));
    assert!(arena.committed_size() >= arena.allocated_size());
    assert!(arena.committed_size() >= allocated + size);

    zeroed.fill(0xaa);
    let committed = arena.committed_size();

    arena.restore(checkpoint);
    assert!(arena.allocated_size() == allocated);
    assert!(arena.committed_size() == committed);

    // Reuses the pages committed before the restore.
    let r = arena.alloc(size).unwrap();
    assert!(r == q);
    assert!(arena.committed_size() == committed);
}

#[test]
fn test_single_page_arena() {
    let page_size = wfregion::VirtualMemory::system().page_size;
    let arena = Arena::new(page_size).unwrap();

    arena.alloc_packed(page_size).unwrap();
    assert!(arena.committed_size() == page_size);
    assert!(arena.allocated_size() == page_size);

    assert!(matches!(arena.alloc_packed(1), Err(ArenaError::Exhausted { .. })));
    assert!(arena.allocated_size() == page_size);
}

#[test]
fn test_fills_reservation_exactly() {
    let arena = Arena::new(1 << 20).unwrap();

    for _ in 0..(1 << 10) {
        arena.alloc_packed(1 << 10).unwrap();
    }

    assert!(arena.remaining_size() == 0);
    assert!(arena.committed_size() == 1 << 20);
    assert!(matches!(arena.alloc_packed(1), Err(ArenaError::Exhausted { .. })));
}

#[test]
fn test_shrink_is_idempotent() {
    let mut arena = Arena::new(4 << 20).unwrap();
    arena.alloc(3 << 20).unwrap();
    arena.reset();
    arena.alloc(100).unwrap();

    arena.shrink_to_fit().unwrap();
    let committed = arena.committed_size();
    assert!(committed == arena.page_size());

    arena.shrink_to_fit().unwrap();
    assert!(arena.committed_size() == committed);
}

#[test]
fn test_shrink_to_fit_with_allocator_in_scope() {
    let mut arena = Arena::new(4 << 20).unwrap();
    let page_size = arena.page_size();

    {
        let mut v: Vec<u8, &Arena> = Vec::new_in(&arena);
        v.resize(3 << 20, 0xff);
        v.truncate(10);
        v.shrink_to_fit();
    }

    let p = arena.alloc_packed(page_size).unwrap();
    let q = unsafe {
        let layout = std::alloc::Layout::from_size_align(page_size, 1).unwrap();
        let small = std::alloc::Layout::from_size_align(1, 1).unwrap();
        Allocator::shrink(&arena, p, layout, small).unwrap()
    };
    assert!(q.cast::<u8>() == p);

    arena.reset();
    arena.shrink_to_fit().unwrap();
    assert!(arena.committed_size() == 0);
    assert!(arena.allocated_size() == 0);
}

#[test]
fn test_reset_release_cycle() {
    let mut arena = Arena::with_config(ArenaConfig::new(16 << 20).with_commit_size(1 << 20)).unwrap();

    for frame in 0..10u8 {
        let data = arena.alloc_slice_zeroed::<u8>(4 << 20).unwrap();
        assert!(data.iter().all(|&b| b == 0));
        data.fill(frame + 1);

        if frame % 3 == 0 {
            arena.release().unwrap();
            assert!(arena.committed_size() == 0);
        } else {
            arena.reset();
            assert!(arena.committed_size() == 4 << 20);
        }

        assert!(arena.allocated_size() == 0);
    }
}

#[test]
fn test_scoped_batches() {
    let config = ArenaConfig::new(64 << 20).with_restore_policy(RestorePolicy::Decommit);
    let mut arena = Arena::with_config(config).unwrap();

    let shared: [u32; 100] = std::array::from_fn(|i| i as u32);
    let persistent = arena.alloc_str("persistent").unwrap().len();
    let allocated = arena.allocated_size();

    let mut total = 0;
    for batch in 0..10u32 {
        let scope = arena.scope();

        let mut temp = Vec::new_in(&*scope);
        for value in &shared {
            temp.push(value * batch);
        }

        total += temp.iter().sum::<u32>();
    }

    assert!(persistent == 10);
    assert!(total == 4950 * 45);
    assert!(arena.allocated_size() == allocated);

    // Every scope decommitted what it used on the way out.
    assert!(arena.committed_size() == arena.page_size());
}

#[test]
fn test_arena_moves_between_threads() {
    let arena = Arena::new(1 << 20).unwrap();
    arena.alloc_str("main").unwrap();

    let arena = thread::spawn(move || {
        arena.alloc_str("worker").unwrap();
        arena
    })
    .join()
    .unwrap();

    assert!(arena.allocated_size() == 10);
    arena.delete().unwrap();
}
