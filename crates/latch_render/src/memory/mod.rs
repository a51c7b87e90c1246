//! Device memory sub-allocation
//!
//! [`MemoryArena`] owns native memory blocks and bump-allocates inside them;
//! [`Allocator`] is the per-call facade the rest of the renderer uses.

mod allocator;
mod arena;
mod block;

pub use allocator::Allocator;
pub use arena::{ArenaStats, MemoryArena};
pub use block::{Allocation, BlockId, BlockInfo, BlockState};

use crate::device::MemoryProperties;

/// Where an allocation has to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Device-local, never mapped.
    GpuOnly,
    /// Host memory for readback or CPU-side scratch.
    CpuOnly,
    /// Host-visible memory written by the CPU and read by the GPU.
    CpuToGpu,
}

impl AllocationType {
    pub fn required_properties(self) -> MemoryProperties {
        match self {
            AllocationType::GpuOnly => MemoryProperties::DEVICE_LOCAL,
            AllocationType::CpuOnly => {
                MemoryProperties::HOST_VISIBLE
                    | MemoryProperties::HOST_COHERENT
                    | MemoryProperties::HOST_CACHED
            }
            AllocationType::CpuToGpu => {
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT
            }
        }
    }

    /// Host-visible blocks are mapped for their whole lifetime.
    pub fn is_host_visible(self) -> bool {
        self.required_properties()
            .contains(MemoryProperties::HOST_VISIBLE)
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two; 0 means 1).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 0), 13);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn host_visibility_follows_type() {
        assert!(!AllocationType::GpuOnly.is_host_visible());
        assert!(AllocationType::CpuOnly.is_host_visible());
        assert!(AllocationType::CpuToGpu.is_host_visible());
    }
}
