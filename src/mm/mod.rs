//! The page-granular kernel heap (§4.2) and its external collaborators.

pub mod heap;
pub mod pmm;
pub mod vmm;

pub use heap::{Heap, HeapConfig, NodeState};
pub use pmm::PhysFrameAllocator;
pub use vmm::{MapFlags, VirtualMapper};
