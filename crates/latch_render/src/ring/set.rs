use super::{DeviceRing, StageResult, StagingRing, UniformBinding, UniformRing};
use crate::context::RenderContext;
use crate::device::{CommandBufferHandle, DescriptorSetLayoutHandle, GpuDevice};
use crate::error::Result;
use bytemuck::Pod;

/// The four per-frame rings a renderer uploads through, rotated together.
pub struct RingSet {
    pub staging: StagingRing,
    pub vertex: DeviceRing,
    pub index: DeviceRing,
    pub uniform: UniformRing,
}

impl RingSet {
    pub fn new<D: GpuDevice>(
        ctx: &mut RenderContext<D>,
        uniform_layout: DescriptorSetLayoutHandle,
    ) -> Result<Self> {
        let config = ctx.config().rings;
        Ok(Self {
            staging: StagingRing::new(ctx, &config)?,
            vertex: DeviceRing::vertex(ctx, &config)?,
            index: DeviceRing::index(ctx, &config)?,
            uniform: UniformRing::new(ctx, &config, uniform_layout)?,
        })
    }

    pub fn upload_vertices<D: GpuDevice, T: Pod>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        vertices: &[T],
    ) -> Result<StageResult> {
        self.vertex
            .upload_pod(ctx, command_buffer, &mut self.staging, vertices)
    }

    pub fn upload_indices<D: GpuDevice, T: Pod>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        indices: &[T],
    ) -> Result<StageResult> {
        self.index
            .upload_pod(ctx, command_buffer, &mut self.staging, indices)
    }

    pub fn upload_uniform<D: GpuDevice, T: Pod>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        value: &T,
    ) -> Result<UniformBinding> {
        self.uniform
            .upload_pod(ctx, command_buffer, &mut self.staging, value)
    }

    pub fn current_slot(&self) -> usize {
        self.staging.ring().current_slot()
    }

    pub fn next_buffer(&mut self) {
        self.staging.next_buffer();
        self.vertex.next_buffer();
        self.index.next_buffer();
        self.uniform.next_buffer();
    }

    /// Destroy every ring immediately. The device must be idle.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut RenderContext<D>) -> Result<()> {
        self.uniform.destroy(ctx)?;
        self.index.destroy(ctx)?;
        self.vertex.destroy(ctx)?;
        self.staging.destroy(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::device::headless::HeadlessDevice;

    #[test]
    fn rings_rotate_in_lockstep() {
        let mut ctx = RenderContext::new(HeadlessDevice::new(), RenderConfig::default()).unwrap();
        let mut rings = RingSet::new(&mut ctx, DescriptorSetLayoutHandle(1)).unwrap();

        rings.next_buffer();
        assert_eq!(rings.current_slot(), 1);
        assert_eq!(rings.vertex.ring().current_slot(), 1);
        assert_eq!(rings.index.ring().current_slot(), 1);
        assert_eq!(rings.uniform.ring().current_slot(), 1);

        rings.destroy(&mut ctx).unwrap();
        let device = ctx.shutdown().unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
        assert!(device.violations().is_empty());
    }
}
