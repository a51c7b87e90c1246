//! Deferred destruction keyed by rotation slot
//!
//! Resources retired while slot `i` is current go into bucket `i` and are
//! destroyed the next time slot `i` comes back into use. By then the frame
//! scheduler has waited on the fence of the last frame that used slot `i`,
//! so nothing submitted before the retirement can still reference them.
//!
//! This only holds with exactly N frames in flight on a single queue.

use crate::device::{BufferHandle, DescriptorSetHandle, GpuDevice, ImageHandle};
use crate::error::Result;
use crate::memory::{Allocation, MemoryArena};

/// Something the GPU may still be using.
#[derive(Debug)]
pub enum Garbage {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Memory(Allocation),
    DescriptorSet(DescriptorSetHandle),
}

impl From<BufferHandle> for Garbage {
    fn from(buffer: BufferHandle) -> Self {
        Garbage::Buffer(buffer)
    }
}

impl From<ImageHandle> for Garbage {
    fn from(image: ImageHandle) -> Self {
        Garbage::Image(image)
    }
}

impl From<Allocation> for Garbage {
    fn from(allocation: Allocation) -> Self {
        Garbage::Memory(allocation)
    }
}

impl From<DescriptorSetHandle> for Garbage {
    fn from(set: DescriptorSetHandle) -> Self {
        Garbage::DescriptorSet(set)
    }
}

#[derive(Debug, Default)]
pub struct GarbageBucket {
    buffers: Vec<BufferHandle>,
    images: Vec<ImageHandle>,
    allocations: Vec<Allocation>,
    descriptor_sets: Vec<DescriptorSetHandle>,
}

impl GarbageBucket {
    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len() + self.allocations.len() + self.descriptor_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_buffer(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains(&buffer)
    }

    pub fn contains_descriptor_set(&self, set: DescriptorSetHandle) -> bool {
        self.descriptor_sets.contains(&set)
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    fn push(&mut self, item: Garbage) {
        match item {
            Garbage::Buffer(buffer) => self.buffers.push(buffer),
            Garbage::Image(image) => self.images.push(image),
            Garbage::Memory(allocation) => self.allocations.push(allocation),
            Garbage::DescriptorSet(set) => self.descriptor_sets.push(set),
        }
    }
}

/// Counts of what one flush destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub buffers: usize,
    pub images: usize,
    pub allocations: usize,
    pub descriptor_sets: usize,
}

impl FlushStats {
    pub fn total(&self) -> usize {
        self.buffers + self.images + self.allocations + self.descriptor_sets
    }
}

/// One garbage bucket per rotation slot.
pub struct GarbageCollector {
    buckets: Vec<GarbageBucket>,
}

impl GarbageCollector {
    pub fn new(slots: usize) -> Self {
        Self {
            buckets: (0..slots.max(1)).map(|_| GarbageBucket::default()).collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, slot: usize) -> &GarbageBucket {
        &self.buckets[slot % self.buckets.len()]
    }

    /// Queue `item` for destruction when `slot` is next reused.
    pub fn add(&mut self, slot: usize, item: impl Into<Garbage>) {
        let len = self.buckets.len();
        self.buckets[slot % len].push(item.into());
    }

    pub fn pending(&self) -> usize {
        self.buckets.iter().map(GarbageBucket::len).sum()
    }

    /// Destroy everything in `slot`'s bucket.
    ///
    /// The caller must have confirmed that the last frame which used `slot`
    /// has completed. Descriptor sets go first, then the buffers and images
    /// bound to memory, then the memory itself.
    pub fn flush<D: GpuDevice>(
        &mut self,
        slot: usize,
        device: &mut D,
        arena: &mut MemoryArena,
    ) -> Result<FlushStats> {
        let len = self.buckets.len();
        let bucket = std::mem::take(&mut self.buckets[slot % len]);
        if bucket.is_empty() {
            return Ok(FlushStats::default());
        }

        let stats = FlushStats {
            buffers: bucket.buffers.len(),
            images: bucket.images.len(),
            allocations: bucket.allocations.len(),
            descriptor_sets: bucket.descriptor_sets.len(),
        };

        for set in bucket.descriptor_sets {
            device.free_descriptor_set(set);
        }
        for buffer in bucket.buffers {
            device.destroy_buffer(buffer);
        }
        for image in bucket.images {
            device.destroy_image(image);
        }
        let mut first_error = None;
        for allocation in bucket.allocations {
            if let Err(err) = arena.free(device, allocation) {
                tracing::error!("Failed to free retired allocation in slot {}: {err}", slot % len);
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        tracing::debug!(
            "Flushed garbage slot {}: {} buffer(s), {} image(s), {} allocation(s), {} descriptor set(s)",
            slot % len,
            stats.buffers,
            stats.images,
            stats.allocations,
            stats.descriptor_sets
        );
        Ok(stats)
    }

    /// Flush every bucket. Only valid once the device is idle.
    pub fn flush_all<D: GpuDevice>(
        &mut self,
        device: &mut D,
        arena: &mut MemoryArena,
    ) -> Result<FlushStats> {
        let mut total = FlushStats::default();
        for slot in 0..self.buckets.len() {
            let stats = self.flush(slot, device, arena)?;
            total.buffers += stats.buffers;
            total.images += stats.images;
            total.allocations += stats.allocations;
            total.descriptor_sets += stats.descriptor_sets;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::headless::HeadlessDevice;
    use crate::device::{BufferDesc, DescriptorSetLayoutHandle};
    use crate::error::RenderError;
    use crate::memory::{AllocationType, Allocator};

    fn buffer(device: &mut HeadlessDevice, arena: &mut MemoryArena) -> (BufferHandle, Allocation) {
        Allocator::new(device, arena)
            .allocate_buffer(
                &BufferDesc {
                    label: None,
                    size: 256,
                    usage: wgpu::BufferUsages::VERTEX,
                },
                AllocationType::GpuOnly,
            )
            .unwrap()
    }

    #[test]
    fn flush_only_touches_its_slot() {
        let mut device = HeadlessDevice::new();
        let mut arena = MemoryArena::new(MemoryConfig::default());
        let mut garbage = GarbageCollector::new(2);

        let (a, a_mem) = buffer(&mut device, &mut arena);
        let (b, b_mem) = buffer(&mut device, &mut arena);
        garbage.add(0, a);
        garbage.add(0, a_mem);
        garbage.add(1, b);
        garbage.add(1, b_mem);
        assert_eq!(garbage.pending(), 4);

        let stats = garbage.flush(0, &mut device, &mut arena).unwrap();
        assert_eq!(stats.total(), 2);
        assert!(!device.is_buffer_alive(a));
        assert!(device.is_buffer_alive(b));
        assert!(garbage.bucket(1).contains_buffer(b));
        assert!(garbage.bucket(0).is_empty());
    }

    #[test]
    fn flush_releases_memory_through_the_arena() {
        let mut device = HeadlessDevice::new();
        let mut arena = MemoryArena::new(MemoryConfig::default());
        let mut garbage = GarbageCollector::new(2);

        let (a, a_mem) = buffer(&mut device, &mut arena);
        let block = a_mem.id();
        garbage.add(1, Garbage::Buffer(a));
        garbage.add(1, Garbage::Memory(a_mem));

        garbage.flush_all(&mut device, &mut arena).unwrap();
        assert!(!arena.is_live(block));
        assert_eq!(arena.tombstoned_block_count(), 1);
        assert_eq!(garbage.pending(), 0);
    }

    #[test]
    fn descriptor_sets_are_freed() {
        let mut device = HeadlessDevice::new();
        let mut arena = MemoryArena::new(MemoryConfig::default());
        let mut garbage = GarbageCollector::new(2);

        let set = device
            .allocate_descriptor_set(DescriptorSetLayoutHandle(1))
            .unwrap();
        garbage.add(3, set);
        assert!(garbage.bucket(1).contains_descriptor_set(set));

        garbage.flush(1, &mut device, &mut arena).unwrap();
        assert!(!device.is_descriptor_set_alive(set));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn stale_allocation_does_not_strand_the_rest_of_its_bucket() {
        let mut device = HeadlessDevice::new();
        let mut arena = MemoryArena::new(MemoryConfig::default());
        let mut garbage = GarbageCollector::new(2);

        let (a, a_mem) = buffer(&mut device, &mut arena);
        let reused = Allocation {
            id: a_mem.id,
            memory: a_mem.memory,
            offset: a_mem.offset,
            size: a_mem.size,
            mapped: None,
        };
        device.destroy_buffer(a);
        arena.free(&mut device, a_mem).unwrap();

        let (b, b_mem) = buffer(&mut device, &mut arena);
        let live = b_mem.id();
        garbage.add(0, b);
        garbage.add(0, reused);
        garbage.add(0, b_mem);

        let err = garbage.flush(0, &mut device, &mut arena).unwrap_err();
        assert!(matches!(err, RenderError::StaleBlock { .. }));
        assert!(!arena.is_live(live));
        assert_eq!(arena.active_block_count(), 0);
        assert!(garbage.bucket(0).is_empty());
    }
}
