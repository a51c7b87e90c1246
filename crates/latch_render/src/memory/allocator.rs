use super::{Allocation, AllocationType, MemoryArena};
use crate::device::{BufferDesc, BufferHandle, GpuDevice, ImageDesc, ImageHandle};
use crate::error::Result;

/// Per-call facade routing allocation requests to the arena.
///
/// Holds nothing but the two borrows, so it is created on demand
/// (`RenderContext::allocator`) and dropped right after use.
pub struct Allocator<'a, D: GpuDevice> {
    device: &'a mut D,
    arena: &'a mut MemoryArena,
}

impl<'a, D: GpuDevice> Allocator<'a, D> {
    pub fn new(device: &'a mut D, arena: &'a mut MemoryArena) -> Self {
        Self { device, arena }
    }

    pub fn allocate(
        &mut self,
        kind: AllocationType,
        size: u64,
        alignment: u64,
        memory_type_bits: u32,
    ) -> Result<Allocation> {
        self.arena
            .allocate(self.device, kind, size, alignment, memory_type_bits)
    }

    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.arena.free(self.device, allocation)
    }

    /// Create a buffer and bind it to fresh arena memory.
    pub fn allocate_buffer(
        &mut self,
        desc: &BufferDesc,
        kind: AllocationType,
    ) -> Result<(BufferHandle, Allocation)> {
        let buffer = self.device.create_buffer(desc)?;
        match self.bind_buffer(buffer, kind) {
            Ok(allocation) => Ok((buffer, allocation)),
            Err(err) => {
                self.device.destroy_buffer(buffer);
                Err(err)
            }
        }
    }

    /// Create an image and bind it to fresh arena memory.
    pub fn allocate_image(
        &mut self,
        desc: &ImageDesc,
        kind: AllocationType,
    ) -> Result<(ImageHandle, Allocation)> {
        let image = self.device.create_image(desc)?;
        let requirements = self.device.image_requirements(image).map_err(Into::into);
        let bound: Result<Allocation> = requirements.and_then(|req| {
            let allocation = self.allocate(kind, req.size, req.alignment, req.memory_type_bits)?;
            match self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                Ok(()) => Ok(allocation),
                Err(err) => {
                    self.free(allocation)?;
                    Err(err.into())
                }
            }
        });
        if bound.is_err() {
            self.device.destroy_image(image);
        }
        bound.map(|allocation| (image, allocation))
    }

    /// Destroy a buffer and drop its allocation right away.
    ///
    /// Only valid once the GPU can no longer reference the buffer; otherwise
    /// retire both through the garbage collector.
    pub fn free_buffer(&mut self, buffer: BufferHandle, allocation: Allocation) -> Result<()> {
        self.device.destroy_buffer(buffer);
        self.free(allocation)
    }

    fn bind_buffer(&mut self, buffer: BufferHandle, kind: AllocationType) -> Result<Allocation> {
        let req = self.device.buffer_requirements(buffer)?;
        let allocation = self.allocate(kind, req.size, req.alignment, req.memory_type_bits)?;
        if let Err(err) = self
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        {
            self.free(allocation)?;
            return Err(err.into());
        }
        Ok(allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::headless::HeadlessDevice;
    use winit::dpi::PhysicalSize;

    #[test]
    fn buffers_from_same_kind_share_a_block() {
        let mut device = HeadlessDevice::new();
        let mut arena = MemoryArena::new(MemoryConfig::default());
        let desc = BufferDesc {
            label: Some("mesh"),
            size: 1000,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        };

        let mut allocator = Allocator::new(&mut device, &mut arena);
        let (a, a_mem) = allocator.allocate_buffer(&desc, AllocationType::GpuOnly).unwrap();
        let (b, b_mem) = allocator.allocate_buffer(&desc, AllocationType::GpuOnly).unwrap();

        assert_ne!(a, b);
        assert_eq!(a_mem.id(), b_mem.id());
        assert_eq!(b_mem.offset(), 1024);

        allocator.free_buffer(a, a_mem).unwrap();
        allocator.free_buffer(b, b_mem).unwrap();
        assert_eq!(arena.tombstoned_block_count(), 1);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn images_are_bound_into_device_local_memory() {
        let mut device = HeadlessDevice::new();
        let mut arena = MemoryArena::new(MemoryConfig::default());

        let (image, allocation) = Allocator::new(&mut device, &mut arena)
            .allocate_image(
                &ImageDesc {
                    label: Some("depth"),
                    size: PhysicalSize::new(128, 64),
                    format: wgpu::TextureFormat::Depth32Float,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                },
                AllocationType::GpuOnly,
            )
            .unwrap();

        assert_eq!(allocation.size(), 128 * 64 * 4);
        assert_eq!(
            device.image_binding(image),
            Some((allocation.memory(), allocation.offset()))
        );
    }

    #[test]
    fn image_without_matching_memory_type_is_rejected() {
        let mut device = HeadlessDevice::new();
        let mut arena = MemoryArena::new(MemoryConfig::default());

        // images only accept device-local types, none of which are host cached
        let result = Allocator::new(&mut device, &mut arena).allocate_image(
            &ImageDesc {
                label: None,
                size: PhysicalSize::new(4, 4),
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
            },
            AllocationType::CpuOnly,
        );

        assert!(matches!(
            result,
            Err(crate::RenderError::NoCompatibleMemoryType { .. })
        ));
        assert_eq!(arena.slot_count(), 0);
    }
}
