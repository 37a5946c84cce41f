#![no_std]

//! This library contains [`Arena`], a region allocator that reserves a contiguous range of virtual
//! memory up front and commits physical memory as allocations reach into it. Because the range
//! never moves, growing the arena never moves existing allocations.
//!
//! Memory is reclaimed in bulk: [`Arena::reset`] rewinds everything, [`Arena::restore`] and
//! [`Arena::scope`] rewind down to a [`Checkpoint`], and [`Arena::shrink_to_fit`] and
//! [`Arena::release`] hand physical memory back to the OS.
//!
//! The arena is not thread-safe. Independent arenas can be used from different threads freely.

mod arena;
mod config;
mod error;
mod scope;
pub mod vm;

pub use crate::arena::Arena;
pub use crate::arena::DEFAULT_ALIGNMENT;
pub use crate::config::ArenaConfig;
pub use crate::config::RestorePolicy;
pub use crate::error::ArenaError;
pub use crate::scope::ArenaScope;
pub use crate::scope::Checkpoint;
pub use crate::vm::VirtualMemory;
