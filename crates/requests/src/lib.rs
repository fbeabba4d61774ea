//! Request model for batched AI generation work.
//!
//! Holds the vocabulary shared by the scheduler and its collaborators: the
//! request items of the current batch, the status store they live in, the
//! uploaded image library they reference, and the builder that composes
//! fully-resolved request descriptors from user input.

use std::sync::atomic::{AtomicU64, Ordering};

mod item;
pub use item::*;

mod store;
pub use store::*;

mod uploads;
pub use uploads::*;

pub mod builder;
pub use builder::BuildError;

/// Session-wide monotonic id allocator.
///
/// Ids are never reused within a session; uploaded images and request items
/// draw from separate allocators, each strictly increasing.
#[derive(Debug, Default)]
pub struct IdGen(AtomicU64);

impl IdGen {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
