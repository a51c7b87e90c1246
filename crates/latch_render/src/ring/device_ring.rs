use super::{MapResult, Ring, RingDesc, StagingRing};
use crate::config::RingConfig;
use crate::context::RenderContext;
use crate::device::{BufferCopy, BufferHandle, CommandBufferHandle, GpuDevice};
use crate::error::Result;
use bytemuck::Pod;

/// Device-local bytes written by a recorded copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageResult {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// Device-local per-frame ring (vertex or index data), filled from staging.
pub struct DeviceRing {
    ring: Ring,
}

impl DeviceRing {
    pub fn vertex<D: GpuDevice>(ctx: &mut RenderContext<D>, config: &RingConfig) -> Result<Self> {
        Self::new(ctx, RingDesc::vertex(config))
    }

    pub fn index<D: GpuDevice>(ctx: &mut RenderContext<D>, config: &RingConfig) -> Result<Self> {
        Self::new(ctx, RingDesc::index(config))
    }

    pub fn new<D: GpuDevice>(ctx: &mut RenderContext<D>, desc: RingDesc) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(ctx, desc)?,
        })
    }

    /// Reserve room for `src` and record a copy from staging into it.
    pub fn stage<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        src: &MapResult,
    ) -> Result<StageResult> {
        self.stage_within(ctx, command_buffer, src, src.size)
    }

    /// Like [`stage`](Self::stage) but reserves `footprint` bytes, so the
    /// returned offset is followed by at least that much room in the buffer.
    pub(crate) fn stage_within<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        src: &MapResult,
        footprint: u64,
    ) -> Result<StageResult> {
        let span = self.ring.reserve(ctx, footprint.max(src.size))?;
        ctx.device_mut().cmd_copy_buffer(
            command_buffer,
            src.buffer,
            span.buffer,
            &[BufferCopy {
                src_offset: src.offset,
                dst_offset: span.offset,
                size: src.size,
            }],
        );
        Ok(StageResult {
            buffer: span.buffer,
            offset: span.offset,
            size: src.size,
        })
    }

    /// Map `bytes` into `staging`, then stage them here.
    pub fn upload<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        staging: &mut StagingRing,
        bytes: &[u8],
    ) -> Result<StageResult> {
        let mapped = staging.map(ctx, bytes)?;
        self.stage(ctx, command_buffer, &mapped)
    }

    pub fn upload_pod<D: GpuDevice, T: Pod>(
        &mut self,
        ctx: &mut RenderContext<D>,
        command_buffer: CommandBufferHandle,
        staging: &mut StagingRing,
        data: &[T],
    ) -> Result<StageResult> {
        self.upload(ctx, command_buffer, staging, bytemuck::cast_slice(data))
    }

    pub fn next_buffer(&mut self) {
        self.ring.next_buffer();
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn destroy<D: GpuDevice>(self, ctx: &mut RenderContext<D>) -> Result<()> {
        self.ring.destroy(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::device::headless::HeadlessDevice;
    use crate::device::SubmitInfo;

    fn context() -> RenderContext<HeadlessDevice> {
        RenderContext::new(HeadlessDevice::new(), RenderConfig::default()).unwrap()
    }

    fn submit(ctx: &mut RenderContext<HeadlessDevice>, command_buffer: CommandBufferHandle) {
        let device = ctx.device_mut();
        device.end_command_buffer(command_buffer).unwrap();
        device
            .submit(&SubmitInfo {
                command_buffers: &[command_buffer],
                ..Default::default()
            })
            .unwrap();
        device.queue_wait_idle().unwrap();
    }

    #[test]
    fn staged_vertices_arrive_after_submit() {
        let mut ctx = context();
        let config = RingConfig::default();
        let mut staging = StagingRing::new(&mut ctx, &config).unwrap();
        let mut vertices = DeviceRing::vertex(&mut ctx, &config).unwrap();

        let cb = ctx.device_mut().allocate_command_buffer().unwrap();
        ctx.device_mut().begin_command_buffer(cb).unwrap();
        let positions: [f32; 6] = [0.0, 0.5, -0.5, -0.5, 0.5, -0.5];
        let staged = vertices
            .upload_pod(&mut ctx, cb, &mut staging, &positions)
            .unwrap();

        // nothing copied until the command buffer runs
        assert_eq!(
            ctx.device_mut().read_buffer(staged.buffer, staged.offset, 24).unwrap(),
            vec![0; 24]
        );
        submit(&mut ctx, cb);
        assert_eq!(
            ctx.device_mut().read_buffer(staged.buffer, staged.offset, 24).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&positions)
        );
    }

    #[test]
    fn oversized_stage_grows_ring() {
        let mut ctx = context();
        let mut config = RingConfig::default();
        config.index_capacity = 64;
        let mut staging = StagingRing::new(&mut ctx, &config).unwrap();
        let mut indices = DeviceRing::index(&mut ctx, &config).unwrap();
        let old = indices.ring().current_buffer();

        let cb = ctx.device_mut().allocate_command_buffer().unwrap();
        ctx.device_mut().begin_command_buffer(cb).unwrap();
        let mapped = staging.map(&mut ctx, &[0xab; 100]).unwrap();
        let staged = indices.stage(&mut ctx, cb, &mapped).unwrap();

        assert_eq!(staged.offset, 0);
        assert_eq!(indices.ring().capacity(), 200);
        assert!(ctx.garbage().bucket(0).contains_buffer(old));

        submit(&mut ctx, cb);
        assert_eq!(
            ctx.device_mut().read_buffer(staged.buffer, 0, 100).unwrap(),
            vec![0xab; 100]
        );
    }
}
