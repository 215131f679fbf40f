pub mod fatal;
mod barrier;
mod heap;
mod platform;
mod system;
mod threading;
mod visitor;

pub mod persistent;
pub mod pointer_table;
pub mod sandbox;
pub mod settings;

pub use barrier::{BarrierState, CollectionBarrier, CollectionHost};
pub use heap::{GcStats, Heap, HeapMarker, TraceFn};
pub use persistent::{
    CrossThreadPersistent, CrossThreadPersistentRegion, Persistent, PersistentRegion,
    PersistentRegionLock,
};
pub use platform::{ForegroundTaskQueue, Task, TaskRunner};
pub use pointer_table::{
    ExternalPointerTable, HandleSlot, PointerHandle, PointerTag, TrustedPointerTable,
};
pub use sandbox::{Address, Cage, CageAddress, SandboxAddressSpace};
pub use settings::{HeapCreateInfo, HeapSettings, TableSettings};
pub use system::{OS_PAGE_SIZE, OsVirtualAddressSpace, PagePermissions, VirtualAddressSpace};
pub use threading::{OsThreadIdentity, ThreadIdentity, ThreadToken};
pub use visitor::{RootCollector, RootVisitor};
