use super::block::MemoryBlock;
use super::{align_up, Allocation, AllocationType, BlockId, BlockInfo, BlockState};
use crate::config::MemoryConfig;
use crate::device::GpuDevice;
use crate::error::{RenderError, Result};
use latch_metrics::Counter;

struct BlockSlot {
    generation: u32,
    state: BlockState,
    /// `Some` exactly when `state` is not `Free`.
    block: Option<MemoryBlock>,
}

impl BlockSlot {
    fn id(&self, index: usize) -> BlockId {
        BlockId {
            index: index as u32,
            generation: self.generation,
        }
    }
}

enum Fit {
    Revive(usize),
    Bump(usize, u64),
}

/// Aggregate view of the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub slots: usize,
    pub active_blocks: usize,
    pub tombstoned_blocks: usize,
    pub free_slots: usize,
    /// Native bytes held (active and tombstoned blocks).
    pub reserved_bytes: u64,
    /// Bytes handed out from active blocks, including alignment padding.
    pub used_bytes: u64,
}

/// Sub-allocator over native device memory blocks.
///
/// Blocks are bump-allocated and reclaimed whole: every allocation takes an
/// owner reference, and a block whose owners drop to zero is tombstoned
/// rather than freed. A tombstone survives until the *next* `free` call
/// sweeps it, and an allocation of the same kind may revive it in the
/// meantime at no native cost.
///
/// Slots are scanned first-fit in creation order. Released slots are
/// reused before the table grows, and block ids stay valid while the table
/// grows because they are indices, not pointers.
pub struct MemoryArena {
    config: MemoryConfig,
    slots: Vec<BlockSlot>,
    counters: Counter,
}

impl MemoryArena {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            counters: Counter::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Reserve `size` bytes aligned to `alignment` in memory of `kind` whose
    /// memory type is allowed by `memory_type_bits`.
    pub fn allocate<D: GpuDevice>(
        &mut self,
        device: &mut D,
        kind: AllocationType,
        size: u64,
        alignment: u64,
        memory_type_bits: u32,
    ) -> Result<Allocation> {
        let alignment = alignment.max(1);
        let aligned_size = align_up(size, alignment);

        let fit = self
            .slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| {
                let block = slot.block.as_ref()?;
                if !block.matches(kind, memory_type_bits) {
                    return None;
                }
                match slot.state {
                    BlockState::Tombstoned if block.size >= aligned_size => {
                        Some(Fit::Revive(index))
                    }
                    BlockState::Active => block
                        .bump_offset(aligned_size, alignment)
                        .map(|offset| Fit::Bump(index, offset)),
                    _ => None,
                }
            });

        match fit {
            Some(Fit::Revive(index)) => Ok(self.revive(index, aligned_size)),
            Some(Fit::Bump(index, offset)) => Ok(self.bump(index, offset, aligned_size)),
            None => self.create_block(device, kind, size, aligned_size, memory_type_bits),
        }
    }

    /// Drop one owner reference.
    ///
    /// Tombstones left by earlier calls are released first; the block this
    /// call tombstones stays physically alive until the next `free`.
    /// A stale `allocation` is rejected before anything is swept.
    pub fn free<D: GpuDevice>(&mut self, device: &mut D, allocation: Allocation) -> Result<()> {
        let id = allocation.id;
        let stale = RenderError::StaleBlock {
            index: id.index,
            generation: id.generation,
        };
        if self.live_block(id).is_none() {
            return Err(stale);
        }

        // the block being freed is Active, so the sweep leaves it alone
        self.sweep(device);

        let slot = &mut self.slots[id.index as usize];
        let Some(block) = slot.block.as_mut() else {
            return Err(stale);
        };

        block.owners = block.owners.saturating_sub(1);
        if block.owners == 0 {
            slot.state = BlockState::Tombstoned;
            tracing::trace!(
                "Tombstoned block {} ({:?}, {} bytes)",
                id.index,
                block.kind,
                block.size
            );
        }
        Ok(())
    }

    /// Physically release every tombstoned block. Returns how many were released.
    pub fn sweep<D: GpuDevice>(&mut self, device: &mut D) -> usize {
        let mut released = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].state == BlockState::Tombstoned {
                self.release(device, index);
                released += 1;
            }
        }
        released
    }

    /// Release every block regardless of owners. Outstanding allocations
    /// become stale.
    pub fn destroy<D: GpuDevice>(&mut self, device: &mut D) {
        for index in 0..self.slots.len() {
            let owners = self.slots[index].block.as_ref().map_or(0, |b| b.owners);
            if self.slots[index].state == BlockState::Active && owners > 0 {
                tracing::warn!(
                    "Releasing block {index} with {owners} live allocation(s) at shutdown"
                );
            }
            if self.slots[index].state != BlockState::Free {
                self.release(device, index);
            }
        }
        self.slots.clear();
        tracing::debug!("Memory arena destroyed");
    }

    /// Host view of a host-visible allocation.
    pub fn mapped_slice_mut(&mut self, allocation: &Allocation) -> Result<&mut [u8]> {
        let id = allocation.id;
        let block = self
            .live_block(id)
            .ok_or(RenderError::StaleBlock {
                index: id.index,
                generation: id.generation,
            })?;
        let ptr = block
            .ptr_at(allocation.offset)
            .ok_or(RenderError::NotHostVisible { kind: block.kind })?;
        // SAFETY: the allocation's range lies inside its live, mapped block and
        // no other allocation overlaps it; `&mut self` keeps the view unique.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), allocation.size as usize) })
    }

    /// Whether `id` still names a block with owners.
    pub fn is_live(&self, id: BlockId) -> bool {
        self.live_block(id).is_some()
    }

    pub fn block_info(&self, index: u32) -> Option<BlockInfo> {
        let slot = self.slots.get(index as usize)?;
        let block = slot.block.as_ref()?;
        Some(BlockInfo {
            id: slot.id(index as usize),
            state: slot.state,
            size: block.size,
            kind: block.kind,
            memory_type_bits: block.memory_type_bits,
            memory_type_index: block.memory_type_index,
            memory: block.memory,
            owners: block.owners,
            offset: block.offset,
            mapped: block.mapped.is_some(),
        })
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        (0..self.slots.len() as u32).filter_map(|index| self.block_info(index))
    }

    /// Blocks that still hold native memory (active or tombstoned).
    pub fn block_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state != BlockState::Free).count()
    }

    pub fn active_block_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == BlockState::Active)
            .count()
    }

    pub fn tombstoned_block_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == BlockState::Tombstoned)
            .count()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            slots: self.slots.len(),
            ..ArenaStats::default()
        };
        for slot in &self.slots {
            match (slot.state, slot.block.as_ref()) {
                (BlockState::Active, Some(block)) => {
                    stats.active_blocks += 1;
                    stats.reserved_bytes += block.size;
                    stats.used_bytes += block.offset;
                }
                (BlockState::Tombstoned, Some(block)) => {
                    stats.tombstoned_blocks += 1;
                    stats.reserved_bytes += block.size;
                }
                _ => stats.free_slots += 1,
            }
        }
        stats
    }

    pub fn counters(&self) -> &Counter {
        &self.counters
    }

    fn live_block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.state == BlockState::Active)
            .and_then(|slot| slot.block.as_ref())
    }

    fn revive(&mut self, index: usize, aligned_size: u64) -> Allocation {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = BlockState::Active;
        let id = slot.id(index);
        let block = slot
            .block
            .as_mut()
            .expect("tombstoned slot always holds a block");
        block.owners = 1;
        block.offset = aligned_size;

        self.counters.increment("arena.tombstone_reuses");
        tracing::trace!(
            "Revived tombstoned block {index} ({:?}, {} bytes)",
            block.kind,
            block.size
        );

        Allocation {
            id,
            memory: block.memory,
            offset: 0,
            size: aligned_size,
            mapped: block.ptr_at(0),
        }
    }

    fn bump(&mut self, index: usize, offset: u64, aligned_size: u64) -> Allocation {
        let slot = &mut self.slots[index];
        let id = slot.id(index);
        let block = slot
            .block
            .as_mut()
            .expect("active slot always holds a block");
        block.offset = offset + aligned_size;
        block.owners += 1;

        Allocation {
            id,
            memory: block.memory,
            offset,
            size: aligned_size,
            mapped: block.ptr_at(offset),
        }
    }

    fn create_block<D: GpuDevice>(
        &mut self,
        device: &mut D,
        kind: AllocationType,
        size: u64,
        aligned_size: u64,
        memory_type_bits: u32,
    ) -> Result<Allocation> {
        let memory_type_index = device
            .find_memory_type(memory_type_bits, kind.required_properties())
            .ok_or(RenderError::NoCompatibleMemoryType {
                kind,
                type_bits: memory_type_bits,
            })?;

        let block_size = size
            .saturating_mul(self.config.block_growth_factor)
            .max(self.config.min_block_size)
            .max(aligned_size);
        let memory = device.allocate_memory(block_size, memory_type_index)?;
        let mapped = if kind.is_host_visible() {
            match device.map_memory(memory) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    device.free_memory(memory);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let block = MemoryBlock {
            size: block_size,
            kind,
            memory_type_bits,
            memory_type_index,
            memory,
            owners: 1,
            offset: aligned_size,
            mapped,
        };
        let allocation = Allocation {
            id: BlockId {
                index: 0,
                generation: 0,
            },
            memory,
            offset: 0,
            size: aligned_size,
            mapped: block.ptr_at(0),
        };

        let index = match self.slots.iter().position(|s| s.state == BlockState::Free) {
            Some(index) => index,
            None => {
                self.slots.push(BlockSlot {
                    generation: 0,
                    state: BlockState::Free,
                    block: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.state = BlockState::Active;
        slot.block = Some(block);

        self.counters.increment("arena.blocks_created");
        self.counters.add("arena.bytes_reserved", block_size);
        tracing::debug!(
            "Created memory block {index}: {block_size} bytes, {kind:?}, memory type {memory_type_index}"
        );

        Ok(Allocation {
            id: slot.id(index),
            ..allocation
        })
    }

    fn release<D: GpuDevice>(&mut self, device: &mut D, index: usize) {
        let slot = &mut self.slots[index];
        let Some(block) = slot.block.take() else {
            return;
        };
        if block.mapped.is_some() {
            device.unmap_memory(block.memory);
        }
        device.free_memory(block.memory);
        slot.state = BlockState::Free;
        slot.generation = slot.generation.wrapping_add(1);

        self.counters.increment("arena.blocks_released");
        self.counters.sub("arena.bytes_reserved", block.size);
        tracing::trace!("Released block {index} ({} bytes)", block.size);
    }
}
