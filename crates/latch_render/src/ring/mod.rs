//! Per-frame resource rings
//!
//! A ring owns one buffer per rotation slot, all bound into a single arena
//! allocation. Each slot is bump-allocated during its frame and reset only by
//! [`Ring::next_buffer`] or by its own growth. On overflow every slot buffer
//! and the shared memory are retired into the current slot's garbage bucket
//! and replaced by buffers `growth_factor` times the overflowing requirement.
//!
//! The typed wrappers add what each resource class needs on top:
//!
//! - [`StagingRing`] - host-visible, written through the mapped pointer
//! - [`DeviceRing`] - device-local vertex/index data filled by recorded copies
//! - [`UniformRing`] - device-local uniforms plus one dynamic descriptor set per slot

mod device_ring;
mod set;
mod staging;
mod uniform;

pub use device_ring::{DeviceRing, StageResult};
pub use set::RingSet;
pub use staging::{MapResult, StagingRing};
pub use uniform::{UniformBinding, UniformRing};

use crate::config::RingConfig;
use crate::context::RenderContext;
use crate::device::{BufferDesc, BufferHandle, GpuDevice};
use crate::error::Result;
use crate::memory::{align_up, Allocation, AllocationType};
use std::ptr::NonNull;

/// Static description of a ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingDesc {
    pub label: &'static str,
    pub usage: wgpu::BufferUsages,
    pub kind: AllocationType,
    /// Initial bytes per slot.
    pub capacity: u64,
    /// Alignment of every reservation inside a slot.
    pub alignment: u64,
    pub growth_factor: u64,
}

impl RingDesc {
    pub fn staging(config: &RingConfig) -> Self {
        Self {
            label: "staging ring",
            usage: wgpu::BufferUsages::COPY_SRC,
            kind: AllocationType::CpuToGpu,
            capacity: config.staging_capacity,
            alignment: config.staging_alignment,
            growth_factor: config.growth_factor,
        }
    }

    pub fn vertex(config: &RingConfig) -> Self {
        Self {
            label: "vertex ring",
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            kind: AllocationType::GpuOnly,
            capacity: config.vertex_capacity,
            alignment: config.vertex_alignment,
            growth_factor: config.growth_factor,
        }
    }

    pub fn index(config: &RingConfig) -> Self {
        Self {
            label: "index ring",
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            kind: AllocationType::GpuOnly,
            capacity: config.index_capacity,
            alignment: config.index_alignment,
            growth_factor: config.growth_factor,
        }
    }

    /// `min_offset_alignment` is the device's dynamic uniform offset alignment.
    pub fn uniform(config: &RingConfig, min_offset_alignment: u64) -> Self {
        Self {
            label: "uniform ring",
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            kind: AllocationType::GpuOnly,
            capacity: config.uniform_capacity.max(config.uniform_binding_range),
            alignment: min_offset_alignment.max(1),
            growth_factor: config.growth_factor,
        }
    }
}

/// A reserved byte range inside the current slot's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSpan {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct RingSlot {
    buffer: BufferHandle,
    offset: u64,
}

/// Buffers for every slot plus the memory they share.
struct SlotBuffers {
    buffers: Vec<BufferHandle>,
    memory: Allocation,
    stride: u64,
}

pub struct Ring {
    desc: RingDesc,
    slots: Vec<RingSlot>,
    memory: Option<Allocation>,
    stride: u64,
    capacity: u64,
    current: usize,
    growths: u32,
}

impl Ring {
    pub fn new<D: GpuDevice>(ctx: &mut RenderContext<D>, desc: RingDesc) -> Result<Self> {
        let slot_count = ctx.frames_in_flight();
        let SlotBuffers {
            buffers,
            memory,
            stride,
        } = create_slot_buffers(ctx, &desc, slot_count, desc.capacity)?;

        tracing::debug!(
            "Created {} with {} slot(s) of {} bytes",
            desc.label,
            slot_count,
            desc.capacity
        );
        Ok(Self {
            slots: buffers
                .into_iter()
                .map(|buffer| RingSlot { buffer, offset: 0 })
                .collect(),
            memory: Some(memory),
            stride,
            capacity: desc.capacity,
            current: 0,
            growths: 0,
            desc,
        })
    }

    /// Bump-allocate `size` bytes in the current slot, growing first if the
    /// slot cannot hold them.
    pub fn reserve<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        size: u64,
    ) -> Result<RingSpan> {
        let mut offset = align_up(self.slots[self.current].offset, self.desc.alignment);
        if offset + size > self.capacity {
            self.grow(ctx, offset + size)?;
            offset = 0;
        }

        let slot = &mut self.slots[self.current];
        slot.offset = offset + size;
        Ok(RingSpan {
            buffer: slot.buffer,
            offset,
            size,
        })
    }

    /// Rotate to the next slot and reclaim its whole range.
    pub fn next_buffer(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
        self.slots[self.current].offset = 0;
    }

    pub fn desc(&self) -> &RingDesc {
        &self.desc
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Bytes available to each slot.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn offset(&self, slot: usize) -> u64 {
        self.slots[slot].offset
    }

    pub fn buffer(&self, slot: usize) -> BufferHandle {
        self.slots[slot].buffer
    }

    pub fn current_buffer(&self) -> BufferHandle {
        self.slots[self.current].buffer
    }

    pub fn growth_count(&self) -> u32 {
        self.growths
    }

    /// Host pointer to `offset` within the current slot's buffer.
    pub(crate) fn host_ptr(&self, offset: u64) -> Option<NonNull<u8>> {
        let base = self.memory.as_ref()?.mapped_ptr()?;
        let delta = self.current as u64 * self.stride + offset;
        // SAFETY: the slot buffer lies inside the mapped allocation and
        // `offset` is below its capacity
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(delta as usize)) })
    }

    /// Destroy every buffer and the shared memory right away. The device
    /// must be idle.
    pub fn destroy<D: GpuDevice>(mut self, ctx: &mut RenderContext<D>) -> Result<()> {
        for slot in &self.slots {
            ctx.device_mut().destroy_buffer(slot.buffer);
        }
        if let Some(memory) = self.memory.take() {
            ctx.allocator().free(memory)?;
        }
        Ok(())
    }

    fn grow<D: GpuDevice>(&mut self, ctx: &mut RenderContext<D>, required: u64) -> Result<()> {
        let new_capacity = required.saturating_mul(self.desc.growth_factor);
        let replacement = create_slot_buffers(ctx, &self.desc, self.slots.len(), new_capacity)?;

        for slot in &self.slots {
            ctx.add_to_garbage(self.current, slot.buffer);
        }
        if let Some(old) = self.memory.take() {
            ctx.add_to_garbage(self.current, old);
        }

        for (slot, buffer) in self.slots.iter_mut().zip(replacement.buffers) {
            slot.buffer = buffer;
        }
        self.slots[self.current].offset = 0;
        self.memory = Some(replacement.memory);
        self.stride = replacement.stride;

        tracing::info!(
            "{} grew from {} to {} bytes per slot (slot {})",
            self.desc.label,
            self.capacity,
            new_capacity,
            self.current
        );
        self.capacity = new_capacity;
        self.growths += 1;
        ctx.counters_mut().increment("ring.growths");
        Ok(())
    }
}

fn create_slot_buffers<D: GpuDevice>(
    ctx: &mut RenderContext<D>,
    desc: &RingDesc,
    slot_count: usize,
    capacity: u64,
) -> Result<SlotBuffers> {
    let buffer_desc = BufferDesc {
        label: Some(desc.label),
        size: capacity,
        usage: desc.usage,
    };

    let mut buffers = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        match ctx.device_mut().create_buffer(&buffer_desc) {
            Ok(buffer) => buffers.push(buffer),
            Err(err) => {
                destroy_all(ctx, &buffers);
                return Err(err.into());
            }
        }
    }

    let bound = bind_slot_buffers(ctx, desc.kind, &buffers);
    match bound {
        Ok((memory, stride)) => Ok(SlotBuffers {
            buffers,
            memory,
            stride,
        }),
        Err(err) => {
            destroy_all(ctx, &buffers);
            Err(err)
        }
    }
}

fn bind_slot_buffers<D: GpuDevice>(
    ctx: &mut RenderContext<D>,
    kind: AllocationType,
    buffers: &[BufferHandle],
) -> Result<(Allocation, u64)> {
    let req = ctx.device().buffer_requirements(buffers[0])?;
    let stride = align_up(req.size, req.alignment);
    let memory = ctx.allocator().allocate(
        kind,
        stride * buffers.len() as u64,
        req.alignment,
        req.memory_type_bits,
    )?;

    for (i, &buffer) in buffers.iter().enumerate() {
        let offset = memory.offset() + i as u64 * stride;
        if let Err(err) = ctx
            .device_mut()
            .bind_buffer_memory(buffer, memory.memory(), offset)
        {
            ctx.allocator().free(memory)?;
            return Err(err.into());
        }
    }
    Ok((memory, stride))
}

fn destroy_all<D: GpuDevice>(ctx: &mut RenderContext<D>, buffers: &[BufferHandle]) {
    for &buffer in buffers {
        ctx.device_mut().destroy_buffer(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::device::headless::HeadlessDevice;

    fn context() -> RenderContext<HeadlessDevice> {
        RenderContext::new(HeadlessDevice::new(), RenderConfig::default()).unwrap()
    }

    fn small_desc() -> RingDesc {
        RingDesc {
            label: "test ring",
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            kind: AllocationType::GpuOnly,
            capacity: 1024,
            alignment: 16,
            growth_factor: 2,
        }
    }

    #[test]
    fn slot_buffers_share_one_allocation() {
        let mut ctx = context();
        let ring = Ring::new(&mut ctx, small_desc()).unwrap();

        assert_eq!(ring.slot_count(), 2);
        assert_ne!(ring.buffer(0), ring.buffer(1));
        assert_eq!(ctx.arena().active_block_count(), 1);
        assert_eq!(ctx.device().live_buffer_count(), 2);
    }

    #[test]
    fn reservations_are_aligned_bumps() {
        let mut ctx = context();
        let mut ring = Ring::new(&mut ctx, small_desc()).unwrap();

        let a = ring.reserve(&mut ctx, 10).unwrap();
        let b = ring.reserve(&mut ctx, 10).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(ring.offset(0), 26);
    }

    #[test]
    fn offsets_reset_only_on_rotation() {
        let mut ctx = context();
        let mut ring = Ring::new(&mut ctx, small_desc()).unwrap();

        ring.reserve(&mut ctx, 100).unwrap();
        ring.next_buffer();
        ring.reserve(&mut ctx, 50).unwrap();
        assert_eq!(ring.offset(0), 100);
        assert_eq!(ring.offset(1), 50);

        ring.next_buffer();
        assert_eq!(ring.current_slot(), 0);
        assert_eq!(ring.offset(0), 0);
        assert_eq!(ring.offset(1), 50);
    }

    #[test]
    fn overflow_retires_old_buffers_into_current_slot() {
        let mut ctx = context();
        let mut ring = Ring::new(&mut ctx, small_desc()).unwrap();
        ring.next_buffer();
        ring.reserve(&mut ctx, 1000).unwrap();
        ring.next_buffer();
        ring.reserve(&mut ctx, 1000).unwrap();
        let old = [ring.buffer(0), ring.buffer(1)];

        // slot 0 has 1000 bytes used, 1008 + 100 does not fit in 1024
        let span = ring.reserve(&mut ctx, 100).unwrap();

        assert_eq!(span.offset, 0);
        assert_eq!(ring.capacity(), 2 * (1008 + 100));
        assert_eq!(ring.growth_count(), 1);
        assert_ne!(span.buffer, old[0]);

        let bucket = ctx.garbage().bucket(0);
        assert!(bucket.contains_buffer(old[0]));
        assert!(bucket.contains_buffer(old[1]));
        assert_eq!(bucket.allocations().len(), 1);
        assert!(ctx.garbage().bucket(1).is_empty());

        // the other slot keeps its offset but now points at a new buffer
        assert_eq!(ring.offset(1), 1000);
        assert_ne!(ring.buffer(1), old[1]);
        assert!(ctx.device().is_buffer_alive(old[1]));
    }

    #[test]
    fn retired_buffers_are_destroyed_on_flush() {
        let mut ctx = context();
        let mut ring = Ring::new(&mut ctx, small_desc()).unwrap();
        let old = ring.buffer(0);
        ring.reserve(&mut ctx, 4096).unwrap();

        let stats = ctx.flush_garbage(0).unwrap();
        assert_eq!(stats.buffers, 2);
        assert_eq!(stats.allocations, 1);
        assert!(!ctx.device().is_buffer_alive(old));
        assert!(ctx.device().violations().is_empty());

        ring.destroy(&mut ctx).unwrap();
        assert_eq!(ctx.device().live_buffer_count(), 0);
    }
}
