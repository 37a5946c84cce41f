use core::alloc::Layout;

use wfregion::Arena;

fn main() {
    let mut arena = Arena::new(1024 << 20).unwrap();

    let p = arena.allocate(Layout::new::<[u64; 1024]>()).unwrap();
    println!("Allocated memory at {p:?}");

    unsafe {
        *(p.as_ptr() as *mut [u64; 1024]) = [42; 1024];
    }
    println!("Written to memory");

    unsafe {
        let values: [u64; 1024] = *(p.as_ptr() as *mut [u64; 1024]);
        let v = values[0];
        println!("First value is {v}");
    }

    let name = arena.alloc_str("region").unwrap();
    let zeroes = arena.alloc_slice_zeroed::<u32>(256).unwrap();
    println!("Copied {name:?}, allocated {} zeroed values", zeroes.len());

    println!(
        "Arena has reserved size {}KB, committed size {}KB, allocated size {}KB",
        arena.reserved_size() >> 10,
        arena.committed_size() >> 10,
        arena.allocated_size() >> 10,
    );

    arena.reset();

    println!("Done");
}
