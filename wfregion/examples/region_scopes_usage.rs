use allocator_api2::vec::Vec;
use wfregion::Arena;

//
// If we know that we'll be entering a part of the program after which we can reset all of the
// allocations made inside, we can do so explicitly with Arena::scope. After the scope guard is
// dropped, the arena will once again have available the memory that was used while the scope was
// active.
//
// Scopes are also useful for bulk processing of data. For example, we may have to process a large
// amount of data spread across thousands of smaller files. We'd like to use an arena for this, but
// not reset it entirely after each processed batch, because we still care about the data stored
// at its start. Scopes reset just the tail part of the arena:
//
// fn process_data(temp: &mut Arena, files: &[File]) {
//     for f in files {
//         // Each time through the loop, temp gets reset back to the state it was in at the
//         // beginning of the function.
//         process_file(&temp.scope(), f);
//     }
// }
//

fn main() {
    let mut arena = Arena::new(64 << 20).unwrap();

    {
        let scope = arena.scope();
        // We can use the scope to allocate data here. The scope will be automatically cleaned up at
        // the end of this block (when the scope guard is dropped).

        let value = scope.alloc_value(42u128).unwrap();
        assert!(*value == 42);
        assert!(scope.allocated_size() == size_of::<u128>());

        // We can't use the parent arena while the scope exists, because the scope borrows it
        // mutably. The following fails at compile-time:
        //
        // let _ = arena.alloc(16).unwrap();
    }

    assert!(arena.allocated_size() == 0); // The arena is empty once the scope ended.

    // Allocations made before a scope survive it. References to them can't be held across the
    // scope though, so we take a copy.
    let shared_data = arena.alloc_slice_copy(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap().to_vec();
    let persistent = arena.allocated_size();

    let mut result = 0;
    for j in 0..10 {
        let scope = arena.scope();
        result += process(&scope, j, &shared_data);
    }

    assert!(arena.allocated_size() == persistent);
    println!("Result is {result}");

    println!("Done");
}

// This function doesn't do anything useful, but it does allocate a few things in temp.
fn process(temp: &Arena, value: i32, data: &[i32]) -> i32 {
    let mut x = value;

    let mut vec = Vec::new_in(temp);
    for v in data {
        if x % 2 == 0 {
            vec.push(x * v);
        }
        x += v;
    }

    vec.iter().sum()
}
