use super::AllocationType;
use crate::device::MemoryHandle;
use std::ops::Range;
use std::ptr::NonNull;

/// Stable reference to an arena slot.
///
/// The generation changes whenever the slot's block is revived or released,
/// so an id held past its block's lifetime no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl BlockId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Lifecycle state of an arena slot.
///
/// `Free` slots hold no native memory. `Active` blocks have at least one
/// owner. `Tombstoned` blocks have no owners but still hold their native
/// memory until the next sweep releases it or an allocation revives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Active,
    Tombstoned,
}

/// One native memory object, bump-allocated from the front.
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    pub size: u64,
    pub kind: AllocationType,
    pub memory_type_bits: u32,
    pub memory_type_index: u32,
    pub memory: MemoryHandle,
    pub owners: u32,
    pub offset: u64,
    pub mapped: Option<NonNull<u8>>,
}

impl MemoryBlock {
    #[inline]
    pub fn matches(&self, kind: AllocationType, memory_type_bits: u32) -> bool {
        self.kind == kind && self.memory_type_bits == memory_type_bits
    }

    /// Start offset for `aligned_size` bytes, if they still fit.
    pub fn bump_offset(&self, aligned_size: u64, alignment: u64) -> Option<u64> {
        let start = super::align_up(self.offset, alignment);
        (start <= self.size && self.size - start >= aligned_size).then_some(start)
    }

    pub fn ptr_at(&self, offset: u64) -> Option<NonNull<u8>> {
        debug_assert!(offset <= self.size);
        self.mapped.map(|base| {
            // SAFETY: offset lies inside the mapped range of this block.
            unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }
        })
    }
}

/// A sub-range of an arena block handed to a caller.
///
/// Deliberately neither `Clone` nor `Copy`: each value accounts for exactly
/// one owner reference on its block and is consumed by `free`.
#[derive(Debug)]
#[must_use = "allocations must be returned to the arena or retired as garbage"]
pub struct Allocation {
    pub(crate) id: BlockId,
    pub(crate) memory: MemoryHandle,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) mapped: Option<NonNull<u8>>,
}

impl Allocation {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn memory(&self) -> MemoryHandle {
        self.memory
    }

    /// Byte offset inside the native memory object.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Aligned size reserved for this allocation.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }

    /// Host pointer to the first byte, for host-visible allocations.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }
}

/// Snapshot of a slot, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub state: BlockState,
    pub size: u64,
    pub kind: AllocationType,
    pub memory_type_bits: u32,
    pub memory_type_index: u32,
    pub memory: MemoryHandle,
    pub owners: u32,
    pub offset: u64,
    pub mapped: bool,
}
