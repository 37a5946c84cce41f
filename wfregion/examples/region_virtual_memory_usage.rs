use core::alloc::Layout;

use wfregion::Arena;
use wfregion::ArenaConfig;
use wfregion::RestorePolicy;

// The arena reserves a contiguous range of virtual memory up front, and only commits physical
// memory as allocations reach into it. We can reserve huge amounts of address space, and the
// reported memory use of our program stays low until we actually use it.
//
// reserve_size bounds how much the arena can ever hold. commit_size trades the number of commit
// syscalls against how much memory is committed ahead of use. Committed memory is handed back to
// the OS with Arena::shrink_to_fit and Arena::release, or after every restore with
// RestorePolicy::Decommit.

fn main() {
    println!("Running arena virtual memory example:\n\n");

    let config = ArenaConfig::new(256 << 20)
        .with_commit_size(32 << 10)
        .with_restore_policy(RestorePolicy::Decommit);
    let mut arena = Arena::with_config(config).unwrap();

    print_stats("before use", &arena);

    allocate_and_use(&arena);
    print_stats("after use", &arena);

    {
        let scope = arena.scope();
        allocate_and_use(&scope);
        print_stats("inside scope", &scope);
    }
    print_stats("after scope", &arena);

    arena.reset();
    arena.shrink_to_fit().unwrap();
    print_stats("after reset and shrink", &arena);

    allocate_and_use(&arena);
    arena.release().unwrap();
    print_stats("after release", &arena);

    arena.delete().unwrap();

    println!("Done");
}

fn allocate_and_use(arena: &Arena) {
    for i in 1..50 {
        let size: usize = i << 10;
        let align: usize = usize::next_power_of_two(i);
        let layout = Layout::from_size_align(size, align).unwrap();

        let p = arena.allocate(layout).unwrap();
        let p = p.as_ptr() as *mut u8;

        unsafe {
            *p = 42;
        }

        let x = unsafe { *p };
        println!("Allocated and used {p:?}");

        assert!(x == 42);
    }
}

fn print_stats(label: &str, arena: &Arena) {
    println!(
        "Arena ({label}) has reserved size {}KB, committed size {}KB, allocated size {}KB",
        arena.reserved_size() >> 10,
        arena.committed_size() >> 10,
        arena.allocated_size() >> 10,
    );
}
