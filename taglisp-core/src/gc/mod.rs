//! Heap memory management for the taglisp runtime.
//!
//! # Architecture
//!
//! Word-arena allocator with a mark-and-sweep collector:
//!
//! - **Heap**: owns the object arena, a free list threaded through the arena
//!   itself, a side mark bitmap, and a block table recording every live
//!   allocation.
//! - **Allocation**: first-fit over the free list; exact fits unlink the
//!   block, larger fits are split in place and the upper tail is returned.
//!   No coalescing on the allocation path.
//! - **Collection**: conservative marking from a caller-supplied root
//!   iterator (the evaluation stack plus the bootstrap packages), then a
//!   sweep over the block table that rebuilds the free list from the gaps
//!   between surviving blocks.
//! - **Mark bits** live in a side bitmap indexed by arena word, never inside
//!   object payload.

pub mod heap;
pub mod types;

pub use heap::Heap;
pub use types::{BlockKind, IrefKind, JrefKind};
