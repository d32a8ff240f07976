//! Memory substrate for a small Lisp runtime.
//!
//! Tagged word-sized values, a word arena managed by a first-fit free-list
//! allocator, and a conservative mark-and-sweep collector rooted in a fixed
//! evaluation stack. The evaluator and reader that would consume this layer
//! live elsewhere; this crate covers the value representation, heap object
//! layouts, allocation, collection, and the printer used to observe them.

pub mod context;
pub mod error;
pub mod gc;
pub mod objects;
pub mod print;
pub mod value;

pub use context::{Context, DEFAULT_ARENA_WORDS, DEFAULT_STACK_WORDS};
pub use error::{HeapError, HeapResult, PrintError, PrintResult};
pub use gc::{Heap, IrefKind, JrefKind};
pub use print::render;
pub use value::{LVal, Tag};
