pub mod slab;
pub use slab::{SlabAllocator, SlotIndex};
