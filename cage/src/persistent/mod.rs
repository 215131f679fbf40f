//! Registries of GC roots held from outside the managed heap.
//!
//! A root is a node in a block-allocated slot arena. Used nodes point back
//! at their owner and a trace callback; free nodes form an intrusive list.
//! [`PersistentRegion`] serves one thread without locking,
//! [`CrossThreadPersistentRegion`] serves all threads under
//! [`PersistentRegionLock`].

mod handle;
mod node;
mod region;

pub use handle::{CrossThreadPersistent, CrossThreadPersistentBase, Persistent, PersistentBase};
pub use node::{NODES_PER_BLOCK, NodeRef, PersistentNode, PersistentOwner, TraceRootCallback};
pub use region::{
    CrossThreadPersistentRegion, PersistentRegion, PersistentRegionGuard, PersistentRegionLock,
};
