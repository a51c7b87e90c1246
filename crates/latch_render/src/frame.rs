//! Frame scheduler
//!
//! Drives every frame through Acquire → Record → Submit → Present → Rotate.
//! Three indices rotate independently:
//!
//! - frame-in-flight index (mod N): selects the fence and semaphore pair
//! - dynamic-buffer index (mod N): selects the command buffer, ring slot and
//!   garbage bucket
//! - presentable-image index: whatever the surface hands back on acquire
//!
//! The first two always advance together. Rotating onto slot `i` waits on
//! the fence of the frame that last used `i` and only then flushes bucket
//! `i`, which is what makes deferred destruction safe.

use crate::context::RenderContext;
use crate::device::{
    AcquireOutcome, CommandBufferHandle, FenceHandle, GpuDevice, PresentationSurface,
    SemaphoreHandle, SubmitInfo,
};
use crate::error::{RenderError, Result};
use crate::ring::RingSet;
use latch_metrics::FrameTimer;
use std::time::Instant;
use winit::dpi::PhysicalSize;

/// Frame states, in the order they must be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Acquire,
    Record,
    Submit,
    Present,
    Rotate,
}

/// What the renderer needs to record one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    pub frame_number: u64,
    pub frame_index: usize,
    pub buffer_index: usize,
    pub image_index: u32,
    pub command_buffer: CommandBufferHandle,
}

struct FrameSync {
    in_flight: FenceHandle,
    image_available: SemaphoreHandle,
    render_finished: SemaphoreHandle,
}

impl FrameSync {
    fn create<D: GpuDevice>(device: &mut D) -> Result<Self> {
        Ok(Self {
            // signaled so the first wait on each slot returns at once
            in_flight: device.create_fence(true)?,
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
        })
    }

    fn destroy<D: GpuDevice>(self, device: &mut D) {
        device.destroy_fence(self.in_flight);
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
    }
}

pub struct FrameScheduler {
    sync: Vec<FrameSync>,
    command_buffers: Vec<CommandBufferHandle>,
    frame_index: usize,
    buffer_index: usize,
    image_index: u32,
    phase: FramePhase,
    frame_count: u64,
    recreations: u32,
    resize_pending: Option<PhysicalSize<u32>>,
    recreate_after_present: bool,
    timer: FrameTimer,
}

impl FrameScheduler {
    pub fn new<D: GpuDevice>(ctx: &mut RenderContext<D>) -> Result<Self> {
        let frames = ctx.frames_in_flight();
        let device = ctx.device_mut();

        let mut sync = Vec::with_capacity(frames);
        let mut command_buffers = Vec::with_capacity(frames);
        for _ in 0..frames {
            sync.push(FrameSync::create(device)?);
            command_buffers.push(device.allocate_command_buffer()?);
        }

        tracing::debug!("Frame scheduler created with {frames} frame(s) in flight");
        Ok(Self {
            sync,
            command_buffers,
            frame_index: 0,
            buffer_index: 0,
            image_index: 0,
            phase: FramePhase::Acquire,
            frame_count: 0,
            recreations: 0,
            resize_pending: None,
            recreate_after_present: false,
            timer: FrameTimer::new(120),
        })
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn buffer_index(&self) -> usize {
        self.buffer_index
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Frames that completed rotation.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Presentation chain recreations so far.
    pub fn recreations(&self) -> u32 {
        self.recreations
    }

    pub fn timer(&self) -> &FrameTimer {
        &self.timer
    }

    /// Record an external resize; the chain is rebuilt at the next acquire
    /// or present. Zero-sized (minimized) extents are ignored.
    pub fn notify_resize(&mut self, size: PhysicalSize<u32>) {
        if size.width > 0 && size.height > 0 {
            self.resize_pending = Some(size);
        }
    }

    /// Wait for this slot's previous frame, acquire a presentable image and
    /// begin recording.
    pub fn acquire<D: GpuDevice, S: PresentationSurface<D>>(
        &mut self,
        ctx: &mut RenderContext<D>,
        surface: &mut S,
    ) -> Result<FrameToken> {
        self.expect_phase(FramePhase::Acquire)?;
        self.timer.begin();

        self.wait_in_flight(ctx, self.frame_index)?;
        if self.resize_pending.is_some() {
            self.recreate_surface(ctx, surface)?;
        }
        self.image_index = self.acquire_image(ctx, surface, 0)?;

        let sync = &self.sync[self.frame_index];
        let command_buffer = self.command_buffers[self.buffer_index];
        let device = ctx.device_mut();
        device.reset_fence(sync.in_flight)?;
        device.begin_command_buffer(command_buffer)?;

        self.phase = FramePhase::Record;
        Ok(FrameToken {
            frame_number: self.frame_count,
            frame_index: self.frame_index,
            buffer_index: self.buffer_index,
            image_index: self.image_index,
            command_buffer,
        })
    }

    /// The command buffer being recorded.
    pub fn command_buffer(&self) -> Result<CommandBufferHandle> {
        self.expect_phase(FramePhase::Record)?;
        Ok(self.command_buffers[self.buffer_index])
    }

    /// Close the command buffer and submit it.
    ///
    /// The phase only advances past each step once that step succeeded: a
    /// failed device submit leaves the frame in `Submit` with its command
    /// buffer closed, and calling `submit` again retries just the submission.
    pub fn submit<D: GpuDevice>(&mut self, ctx: &mut RenderContext<D>) -> Result<()> {
        if self.phase != FramePhase::Submit {
            self.expect_phase(FramePhase::Record)?;
        }

        let command_buffer = self.command_buffers[self.buffer_index];
        if self.phase == FramePhase::Record {
            ctx.device_mut().end_command_buffer(command_buffer)?;
            self.phase = FramePhase::Submit;
        }

        let sync = &self.sync[self.frame_index];
        ctx.device_mut().submit(&SubmitInfo {
            command_buffers: &[command_buffer],
            wait_semaphores: &[sync.image_available],
            signal_semaphores: &[sync.render_finished],
            fence: Some(sync.in_flight),
        })?;

        self.phase = FramePhase::Present;
        Ok(())
    }

    /// Present the acquired image. Returns `true` if the chain was recreated.
    pub fn present<D: GpuDevice, S: PresentationSurface<D>>(
        &mut self,
        ctx: &mut RenderContext<D>,
        surface: &mut S,
    ) -> Result<bool> {
        self.expect_phase(FramePhase::Present)?;

        let wait = self.sync[self.frame_index].render_finished;
        let outcome = surface.present(ctx.device_mut(), self.image_index, wait)?;
        let suboptimal_acquire = std::mem::take(&mut self.recreate_after_present);
        let recreate =
            outcome.needs_recreation() || self.resize_pending.is_some() || suboptimal_acquire;
        if recreate {
            tracing::debug!("Present reported {outcome:?}, recreating presentation chain");
            self.recreate_surface(ctx, surface)?;
        }

        self.phase = FramePhase::Rotate;
        Ok(recreate)
    }

    /// Advance both rotating indices, wait for the frame that last used the
    /// new slot, then destroy that slot's garbage.
    pub fn rotate<D: GpuDevice>(&mut self, ctx: &mut RenderContext<D>) -> Result<()> {
        self.expect_phase(FramePhase::Rotate)?;

        let frames = self.sync.len();
        self.frame_index = (self.frame_index + 1) % frames;
        self.buffer_index = (self.buffer_index + 1) % frames;

        self.wait_in_flight(ctx, self.frame_index)?;
        ctx.flush_garbage(self.buffer_index)?;

        self.frame_count += 1;
        self.timer.end();
        self.phase = FramePhase::Acquire;
        self.log_stats(ctx);
        Ok(())
    }

    /// Submit, present and rotate, keeping the ring slots in step with the
    /// dynamic-buffer index.
    pub fn end_frame<D: GpuDevice, S: PresentationSurface<D>>(
        &mut self,
        ctx: &mut RenderContext<D>,
        surface: &mut S,
        rings: &mut RingSet,
    ) -> Result<()> {
        self.submit(ctx)?;
        self.present(ctx, surface)?;
        self.rotate(ctx)?;
        rings.next_buffer();
        debug_assert_eq!(rings.current_slot(), self.buffer_index);
        Ok(())
    }

    /// Wait for the device, flush every garbage bucket and release sync
    /// objects and command buffers.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut RenderContext<D>) -> Result<()> {
        ctx.device_mut().queue_wait_idle()?;
        for slot in 0..ctx.frames_in_flight() {
            ctx.flush_garbage(slot)?;
        }

        let device = ctx.device_mut();
        for sync in self.sync {
            sync.destroy(device);
        }
        for command_buffer in self.command_buffers {
            device.free_command_buffer(command_buffer);
        }
        tracing::debug!("Frame scheduler destroyed after {} frame(s)", self.frame_count);
        Ok(())
    }

    fn expect_phase(&self, expected: FramePhase) -> Result<()> {
        if self.phase != expected {
            return Err(RenderError::InvalidFramePhase {
                expected,
                found: self.phase,
            });
        }
        Ok(())
    }

    fn wait_in_flight<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        frame_index: usize,
    ) -> Result<()> {
        let fence = self.sync[frame_index].in_flight;
        let timeout = ctx.config().frame.fence_timeout_ns;
        let started = Instant::now();
        ctx.device_mut().wait_for_fence(fence, timeout)?;
        self.timer.record_gpu_wait(started.elapsed());
        Ok(())
    }

    fn acquire_image<D: GpuDevice, S: PresentationSurface<D>>(
        &mut self,
        ctx: &mut RenderContext<D>,
        surface: &mut S,
        attempt: u32,
    ) -> Result<u32> {
        let signal = self.sync[self.frame_index].image_available;
        let timeout = ctx.config().frame.fence_timeout_ns;
        match surface.acquire_next_image(ctx.device_mut(), signal, timeout)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                self.recreate_after_present |= suboptimal;
                Ok(image_index)
            }
            AcquireOutcome::OutOfDate => {
                let max = ctx.config().frame.max_acquire_retries;
                if attempt >= max {
                    return Err(RenderError::SurfaceLost { attempts: attempt });
                }
                tracing::warn!(
                    "Acquire reported an out-of-date surface, retry {}/{}",
                    attempt + 1,
                    max
                );
                self.recreate_surface(ctx, surface)?;
                self.acquire_image(ctx, surface, attempt + 1)
            }
        }
    }

    /// Rebuild the presentation chain and every frame's sync objects. Rings
    /// and garbage are untouched.
    fn recreate_surface<D: GpuDevice, S: PresentationSurface<D>>(
        &mut self,
        ctx: &mut RenderContext<D>,
        surface: &mut S,
    ) -> Result<()> {
        let extent = self.resize_pending.take().unwrap_or_else(|| surface.extent());
        let device = ctx.device_mut();
        device.queue_wait_idle()?;
        surface.recreate(device, extent)?;

        for slot in 0..self.sync.len() {
            let fresh = FrameSync::create(device)?;
            std::mem::replace(&mut self.sync[slot], fresh).destroy(device);
        }

        self.recreations += 1;
        tracing::info!(
            "Presentation chain recreated at {}x{}",
            extent.width,
            extent.height
        );
        Ok(())
    }

    fn log_stats<D: GpuDevice>(&self, ctx: &RenderContext<D>) {
        latch_metrics::metrics! {
            let interval = ctx.config().frame.stats_interval;
            if interval > 0 && self.frame_count % interval == 0 {
                let stats = ctx.arena().stats();
                tracing::info!(
                    "frame {}: {:.2} ms avg ({:.1} fps), {:.2} ms last, {:.2} ms worst, {:.3} ms fence wait, {} block(s), {} bytes reserved, {} garbage pending",
                    self.frame_count,
                    self.timer.frame_time_ms(),
                    self.timer.fps(),
                    self.timer.last_frame_ms(),
                    self.timer.worst_frame_ms(),
                    self.timer.gpu_wait_ms(),
                    stats.active_blocks + stats.tombstoned_blocks,
                    stats.reserved_bytes,
                    ctx.garbage().pending()
                );
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = ctx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::device::headless::{HeadlessDevice, HeadlessSurface};
    use crate::device::{BufferDesc, DeviceError, PresentOutcome};
    use crate::memory::AllocationType;

    fn setup() -> (RenderContext<HeadlessDevice>, HeadlessSurface, FrameScheduler) {
        let mut ctx = RenderContext::new(HeadlessDevice::new(), RenderConfig::default()).unwrap();
        let surface = HeadlessSurface::new(PhysicalSize::new(800, 600), 3);
        let scheduler = FrameScheduler::new(&mut ctx).unwrap();
        (ctx, surface, scheduler)
    }

    fn run_frame(
        ctx: &mut RenderContext<HeadlessDevice>,
        surface: &mut HeadlessSurface,
        scheduler: &mut FrameScheduler,
    ) -> FrameToken {
        let token = scheduler.acquire(ctx, surface).unwrap();
        scheduler.submit(ctx).unwrap();
        scheduler.present(ctx, surface).unwrap();
        scheduler.rotate(ctx).unwrap();
        token
    }

    #[test]
    fn indices_rotate_together() {
        let (mut ctx, mut surface, mut scheduler) = setup();

        let tokens: Vec<_> = (0..4)
            .map(|_| run_frame(&mut ctx, &mut surface, &mut scheduler))
            .collect();

        let slots: Vec<_> = tokens.iter().map(|t| (t.frame_index, t.buffer_index)).collect();
        assert_eq!(slots, vec![(0, 0), (1, 1), (0, 0), (1, 1)]);
        // three swapchain images, two frames in flight
        let images: Vec<_> = tokens.iter().map(|t| t.image_index).collect();
        assert_eq!(images, vec![0, 1, 2, 0]);
        assert_eq!(scheduler.frame_count(), 4);
        assert!(ctx.device().violations().is_empty());
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let (mut ctx, mut surface, mut scheduler) = setup();

        assert!(matches!(
            scheduler.submit(&mut ctx),
            Err(RenderError::InvalidFramePhase {
                expected: FramePhase::Record,
                found: FramePhase::Acquire
            })
        ));
        scheduler.acquire(&mut ctx, &mut surface).unwrap();
        assert!(scheduler.acquire(&mut ctx, &mut surface).is_err());
        assert!(scheduler.rotate(&mut ctx).is_err());
        assert_eq!(scheduler.phase(), FramePhase::Record);
    }

    #[test]
    fn failed_submit_can_be_retried() {
        let (mut ctx, mut surface, mut scheduler) = setup();
        scheduler.acquire(&mut ctx, &mut surface).unwrap();
        ctx.device_mut().fail_next_submits(1);

        assert!(matches!(
            scheduler.submit(&mut ctx),
            Err(RenderError::Device(DeviceError::DeviceLost))
        ));
        assert_eq!(scheduler.phase(), FramePhase::Submit);
        assert!(scheduler.present(&mut ctx, &mut surface).is_err());

        scheduler.submit(&mut ctx).unwrap();
        assert_eq!(scheduler.phase(), FramePhase::Present);
        scheduler.present(&mut ctx, &mut surface).unwrap();
        scheduler.rotate(&mut ctx).unwrap();
        assert_eq!(ctx.device().stats().submissions, 1);
        assert!(ctx.device().violations().is_empty());
    }

    #[test]
    fn garbage_waits_for_its_slot_to_come_back() {
        let (mut ctx, mut surface, mut scheduler) = setup();
        let (buffer, memory) = ctx
            .allocator()
            .allocate_buffer(
                &BufferDesc {
                    label: None,
                    size: 64,
                    usage: wgpu::BufferUsages::VERTEX,
                },
                AllocationType::GpuOnly,
            )
            .unwrap();

        let token = scheduler.acquire(&mut ctx, &mut surface).unwrap();
        ctx.device_mut().cmd_bind_vertex_buffer(token.command_buffer, buffer, 0);
        ctx.add_to_garbage(token.buffer_index, buffer);
        ctx.add_to_garbage(token.buffer_index, memory);
        scheduler.submit(&mut ctx).unwrap();
        scheduler.present(&mut ctx, &mut surface).unwrap();
        scheduler.rotate(&mut ctx).unwrap();

        // slot 1 is current, slot 0's frame may still be running
        assert!(ctx.device().is_buffer_alive(buffer));

        run_frame(&mut ctx, &mut surface, &mut scheduler);
        assert!(!ctx.device().is_buffer_alive(buffer));
        assert!(ctx.device().violations().is_empty());
    }

    #[test]
    fn out_of_date_acquire_recreates_and_retries() {
        let (mut ctx, mut surface, mut scheduler) = setup();
        surface.fail_next_acquires(1);

        let token = scheduler.acquire(&mut ctx, &mut surface).unwrap();
        assert_eq!(token.image_index, 0);
        assert_eq!(surface.recreations(), 1);
        assert_eq!(scheduler.recreations(), 1);
    }

    #[test]
    fn acquire_gives_up_after_bounded_retries() {
        let (mut ctx, mut surface, mut scheduler) = setup();
        surface.fail_next_acquires(2);

        let err = scheduler.acquire(&mut ctx, &mut surface).unwrap_err();
        assert!(matches!(err, RenderError::SurfaceLost { attempts: 1 }));
    }

    #[test]
    fn suboptimal_present_and_resize_recreate() {
        let (mut ctx, mut surface, mut scheduler) = setup();

        surface.script_present(PresentOutcome::Suboptimal);
        scheduler.acquire(&mut ctx, &mut surface).unwrap();
        scheduler.submit(&mut ctx).unwrap();
        assert!(scheduler.present(&mut ctx, &mut surface).unwrap());
        scheduler.rotate(&mut ctx).unwrap();

        scheduler.notify_resize(PhysicalSize::new(1024, 768));
        run_frame(&mut ctx, &mut surface, &mut scheduler);
        assert_eq!(
            PresentationSurface::<HeadlessDevice>::extent(&surface),
            PhysicalSize::new(1024, 768)
        );
        assert_eq!(surface.recreations(), 2);
        assert!(ctx.device().violations().is_empty());
    }

    #[test]
    fn zero_sized_resize_is_ignored() {
        let (_ctx, _surface, mut scheduler) = setup();
        scheduler.notify_resize(PhysicalSize::new(0, 600));
        assert!(scheduler.resize_pending.is_none());
    }

    #[test]
    fn destroy_flushes_and_releases() {
        let (mut ctx, mut surface, mut scheduler) = setup();
        run_frame(&mut ctx, &mut surface, &mut scheduler);
        scheduler.acquire(&mut ctx, &mut surface).unwrap();
        scheduler.submit(&mut ctx).unwrap();
        scheduler.present(&mut ctx, &mut surface).unwrap();

        scheduler.destroy(&mut ctx).unwrap();
        let device = ctx.shutdown().unwrap();
        assert!(device.violations().is_empty());
        assert_eq!(device.in_flight_submissions(), 0);
    }
}
