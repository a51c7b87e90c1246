use bitflags::bitflags;
use winit::dpi::PhysicalSize;

macro_rules! native_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                #[inline]
                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

native_handle!(
    /// Native device memory object.
    MemoryHandle,
    BufferHandle,
    ImageHandle,
    CommandBufferHandle,
    FenceHandle,
    SemaphoreHandle,
    DescriptorSetHandle,
    DescriptorSetLayoutHandle,
);

bitflags! {
    /// Memory heap properties, as reported per memory type by the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub optimal_copy_offset_alignment: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            optimal_copy_offset_alignment: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: Option<&'static str>,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub label: Option<&'static str>,
    pub size: PhysicalSize<u32>,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// One queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    pub wait_semaphores: &'a [SemaphoreHandle],
    pub signal_semaphores: &'a [SemaphoreHandle],
    pub fence: Option<FenceHandle>,
}

/// Timeout used for every GPU wait: the driver is trusted to signal eventually.
pub const WAIT_FOREVER: u64 = u64::MAX;
