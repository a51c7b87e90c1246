use super::{DeviceRing, MapResult, RingDesc, StageResult, StagingRing};
use crate::config::RingConfig;
use crate::context::RenderContext;
use crate::device::{
    CommandBufferHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, GpuDevice,
};
use crate::error::{RenderError, Result};
use bytemuck::Pod;

/// Where a staged uniform block lives and how to bind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub staged: StageResult,
    pub descriptor_set: DescriptorSetHandle,
    pub dynamic_offset: u32,
}

/// Device-local uniform ring with one dynamic-offset descriptor set per slot.
///
/// Each set points at its slot's buffer with the full binding range. Every
/// block reserves that whole range, so any dynamic offset handed out leaves
/// the bound window inside the buffer. When the ring grows the sets are
/// retired together with the buffers and rewritten against the new ones.
pub struct UniformRing {
    inner: DeviceRing,
    layout: DescriptorSetLayoutHandle,
    binding: u32,
    binding_range: u64,
    descriptor_sets: Vec<DescriptorSetHandle>,
}

impl UniformRing {
    pub fn new<D: GpuDevice>(
        ctx: &mut RenderContext<D>,
        config: &RingConfig,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<Self> {
        let alignment = ctx.device().limits().min_uniform_buffer_offset_alignment;
        let inner = DeviceRing::new(ctx, RingDesc::uniform(config, alignment))?;
        let mut ring = Self {
            inner,
            layout,
            binding: 0,
            binding_range: config.uniform_binding_range,
            descriptor_sets: Vec::new(),
        };
        ring.descriptor_sets = ring.write_descriptor_sets(ctx)?;
        Ok(ring)
    }

    /// Stage `src` and return the set and dynamic offset that expose it.
    pub fn stage<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        src: &MapResult,
    ) -> Result<UniformBinding> {
        if src.size > self.binding_range {
            return Err(RenderError::UniformBlockTooLarge {
                size: src.size,
                range: self.binding_range,
            });
        }

        let growths = self.inner.ring().growth_count();
        let staged = self
            .inner
            .stage_within(ctx, command_buffer, src, self.binding_range)?;
        if self.inner.ring().growth_count() != growths {
            self.replace_descriptor_sets(ctx)?;
        }

        let dynamic_offset = u32::try_from(staged.offset)
            .map_err(|_| RenderError::DynamicOffsetOverflow { offset: staged.offset })?;
        Ok(UniformBinding {
            staged,
            descriptor_set: self.descriptor_set(),
            dynamic_offset,
        })
    }

    pub fn upload_pod<D: GpuDevice, T: Pod>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        staging: &mut StagingRing,
        value: &T,
    ) -> Result<UniformBinding> {
        let mapped = staging.map(ctx, bytemuck::bytes_of(value))?;
        self.stage(ctx, command_buffer, &mapped)
    }

    /// Descriptor set of the current slot.
    pub fn descriptor_set(&self) -> DescriptorSetHandle {
        self.descriptor_sets[self.inner.ring().current_slot()]
    }

    pub fn next_buffer(&mut self) {
        self.inner.next_buffer();
    }

    pub fn ring(&self) -> &super::Ring {
        self.inner.ring()
    }

    pub fn destroy<D: GpuDevice>(self, ctx: &mut RenderContext<D>) -> Result<()> {
        for set in &self.descriptor_sets {
            ctx.device_mut().free_descriptor_set(*set);
        }
        self.inner.destroy(ctx)
    }

    fn replace_descriptor_sets<D: GpuDevice>(&mut self, ctx: &mut RenderContext<D>) -> Result<()> {
        let slot = self.inner.ring().current_slot();
        let fresh = self.write_descriptor_sets(ctx)?;
        for old in std::mem::replace(&mut self.descriptor_sets, fresh) {
            ctx.add_to_garbage(slot, old);
        }
        Ok(())
    }

    fn write_descriptor_sets<D: GpuDevice>(
        &self,
        ctx: &mut RenderContext<D>,
    ) -> Result<Vec<DescriptorSetHandle>> {
        let ring = self.inner.ring();
        let range = self.binding_range;
        let mut sets = Vec::with_capacity(ring.slot_count());
        for slot in 0..ring.slot_count() {
            let device = ctx.device_mut();
            let set = device.allocate_descriptor_set(self.layout)?;
            device.write_uniform_descriptor(set, self.binding, ring.buffer(slot), 0, range);
            sets.push(set);
        }
        Ok(sets)
    }
}
