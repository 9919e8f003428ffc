//! Memory Manager - concurrent generational garbage collector
//!
//! This component provides:
//! - A page/arena allocator for small objects, raw allocation for large ones
//! - A two-word object header whose colour byte is updated atomically
//! - A snapshot-at-the-beginning deletion write barrier
//! - A background collector thread that marks and sweeps while mutators run
//! - Weak references and finalizers
//!
//! The entry point is [`Heap`]. The layout of objects and the set of roots
//! are supplied by the embedder through the [`core_types::TypeLayout`] and
//! [`core_types::RootWalker`] traits.

#![warn(clippy::all)]

pub mod error;

pub mod arena;
pub mod concurrent_gc;
pub mod config;
pub mod header;
pub mod heap;
pub mod stats;

mod context;
mod gray;
mod layout;
mod write_barrier;

pub use arena::{size_class_for, ArenaCollection};
pub use concurrent_gc::{CollectionKind, CollectorPhase};
pub use config::GcConfig;
pub use error::{GcError, GcResult};
pub use header::{GcHeader, HEADER_SIZE, WORD};
pub use heap::Heap;
pub use stats::{CycleStats, CycleTotals, HeapStats};
