//! Device collaborator interfaces
//!
//! The core never talks to a graphics API directly. Everything it consumes
//! (memory-type queries, buffer/image/memory creation, command recording and
//! submission, fences, semaphores, descriptor sets) goes through [`GpuDevice`],
//! and presentation goes through [`PresentationSurface`]. A software
//! implementation lives in [`headless`].

pub mod headless;
mod types;

pub use types::*;

use thiserror::Error;
use winit::dpi::PhysicalSize;

/// Failures reported by the device collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("{kind} handle {id} is not alive")]
    InvalidHandle { kind: &'static str, id: u64 },

    #[error("memory {0} cannot be mapped")]
    MapFailed(u64),

    #[error("wait timed out")]
    Timeout,

    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("device lost")]
    DeviceLost,
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Native device operations consumed by the arena, rings and scheduler.
///
/// All calls come from the single submitting thread.
pub trait GpuDevice {
    fn limits(&self) -> DeviceLimits;

    /// First memory type index allowed by `type_bits` whose properties
    /// contain `required`.
    fn find_memory_type(&self, type_bits: u32, required: MemoryProperties) -> Option<u32>;

    fn allocate_memory(&mut self, size: u64, memory_type_index: u32) -> DeviceResult<MemoryHandle>;
    fn free_memory(&mut self, memory: MemoryHandle);

    /// Persistently maps the whole memory object. The pointer stays valid
    /// until [`GpuDevice::unmap_memory`] or [`GpuDevice::free_memory`].
    fn map_memory(&mut self, memory: MemoryHandle) -> DeviceResult<std::ptr::NonNull<u8>>;
    fn unmap_memory(&mut self, memory: MemoryHandle);

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferHandle>;
    fn buffer_requirements(&self, buffer: BufferHandle) -> DeviceResult<MemoryRequirements>;
    fn bind_buffer_memory(
        &mut self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> DeviceResult<()>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageHandle>;
    fn image_requirements(&self, image: ImageHandle) -> DeviceResult<MemoryRequirements>;
    fn bind_image_memory(
        &mut self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> DeviceResult<()>;
    fn destroy_image(&mut self, image: ImageHandle);

    fn allocate_command_buffer(&mut self) -> DeviceResult<CommandBufferHandle>;
    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle);
    fn begin_command_buffer(&mut self, command_buffer: CommandBufferHandle) -> DeviceResult<()>;
    fn end_command_buffer(&mut self, command_buffer: CommandBufferHandle) -> DeviceResult<()>;

    fn cmd_copy_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    );
    fn cmd_bind_vertex_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
    );
    fn cmd_bind_index_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
    );
    fn cmd_bind_descriptor_set(
        &mut self,
        command_buffer: CommandBufferHandle,
        set: DescriptorSetHandle,
        dynamic_offset: u32,
    );
    fn cmd_draw_indexed(
        &mut self,
        command_buffer: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
    );

    fn submit(&mut self, submit: &SubmitInfo<'_>) -> DeviceResult<()>;
    fn queue_wait_idle(&mut self) -> DeviceResult<()>;

    fn create_fence(&mut self, signaled: bool) -> DeviceResult<FenceHandle>;
    fn wait_for_fence(&mut self, fence: FenceHandle, timeout_ns: u64) -> DeviceResult<()>;
    fn reset_fence(&mut self, fence: FenceHandle) -> DeviceResult<()>;
    fn destroy_fence(&mut self, fence: FenceHandle);

    fn create_semaphore(&mut self) -> DeviceResult<SemaphoreHandle>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle>;
    fn write_uniform_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    );
    fn free_descriptor_set(&mut self, set: DescriptorSetHandle);
}

/// Result of asking the surface for the next presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_recreation(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

/// Presentation chain collaborator (swapchain, depth target, framebuffers and
/// the pipelines that depend on them).
pub trait PresentationSurface<D: GpuDevice> {
    fn extent(&self) -> PhysicalSize<u32>;

    fn acquire_next_image(
        &mut self,
        device: &mut D,
        signal: SemaphoreHandle,
        timeout_ns: u64,
    ) -> DeviceResult<AcquireOutcome>;

    fn present(
        &mut self,
        device: &mut D,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> DeviceResult<PresentOutcome>;

    /// Tear down and rebuild everything sized by the surface.
    fn recreate(&mut self, device: &mut D, extent: PhysicalSize<u32>) -> DeviceResult<()>;
}
