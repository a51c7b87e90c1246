use super::{Ring, RingDesc};
use crate::config::RingConfig;
use crate::context::RenderContext;
use crate::device::{BufferHandle, GpuDevice};
use crate::error::{RenderError, Result};
use bytemuck::Pod;
use std::ptr::NonNull;

/// Host-visible bytes reserved in the staging ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    ptr: NonNull<u8>,
}

impl MapResult {
    /// Host address of the first reserved byte.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// View the reserved bytes.
    ///
    /// # Safety
    ///
    /// The ring must not have been rotated back onto this slot or grown since
    /// the map, and no other view of the same range may be alive.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size as usize)
    }
}

/// Per-frame upload staging, written directly through the mapped pointer.
pub struct StagingRing {
    ring: Ring,
}

impl StagingRing {
    pub fn new<D: GpuDevice>(ctx: &mut RenderContext<D>, config: &RingConfig) -> Result<Self> {
        Self::with_desc(ctx, RingDesc::staging(config))
    }

    pub fn with_desc<D: GpuDevice>(ctx: &mut RenderContext<D>, desc: RingDesc) -> Result<Self> {
        if !desc.kind.is_host_visible() {
            return Err(RenderError::NotHostVisible { kind: desc.kind });
        }
        Ok(Self {
            ring: Ring::new(ctx, desc)?,
        })
    }

    /// Reserve `size` writable bytes in the current slot.
    pub fn reserve<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        size: u64,
    ) -> Result<MapResult> {
        let span = self.ring.reserve(ctx, size)?;
        let ptr = self.ring.host_ptr(span.offset).ok_or(RenderError::NotHostVisible {
            kind: self.ring.desc().kind,
        })?;
        Ok(MapResult {
            buffer: span.buffer,
            offset: span.offset,
            size: span.size,
            ptr,
        })
    }

    /// Copy `bytes` into the current slot.
    pub fn map<D: GpuDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        bytes: &[u8],
    ) -> Result<MapResult> {
        let mapped = self.reserve(ctx, bytes.len() as u64)?;
        // SAFETY: freshly reserved, exclusive to this call
        unsafe { mapped.as_mut_slice() }.copy_from_slice(bytes);
        Ok(mapped)
    }

    pub fn map_pod<D: GpuDevice, T: Pod>(
        &mut self,
        ctx: &mut RenderContext<D>,
        data: &[T],
    ) -> Result<MapResult> {
        self.map(ctx, bytemuck::cast_slice(data))
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
    use crate::memory::AllocationType;

    fn context() -> RenderContext<HeadlessDevice> {
        RenderContext::new(HeadlessDevice::new(), RenderConfig::default()).unwrap()
    }

    #[test]
    fn mapped_bytes_read_back_through_pointer() {
        let mut ctx = context();
        let mut staging = StagingRing::new(&mut ctx, &RingConfig::default()).unwrap();

        staging.map(&mut ctx, &[9; 5]).unwrap();
        let mapped = staging.map(&mut ctx, b"vertex payload").unwrap();

        assert_eq!(mapped.offset, 16);
        let read = unsafe { std::slice::from_raw_parts(mapped.as_ptr().as_ptr(), 14) };
        assert_eq!(read, b"vertex payload");
        assert_eq!(ctx.device().stats().submissions, 0);
    }

    #[test]
    fn slots_write_to_disjoint_memory() {
        let mut ctx = context();
        let mut staging = StagingRing::new(&mut ctx, &RingConfig::default()).unwrap();

        let first = staging.map_pod(&mut ctx, &[1u32, 2, 3]).unwrap();
        staging.next_buffer();
        let second = staging.map_pod(&mut ctx, &[7u32, 8, 9]).unwrap();

        assert_eq!(first.offset, second.offset);
        assert_ne!(first.buffer, second.buffer);
        let first_bytes = unsafe { first.as_mut_slice() };
        assert_eq!(first_bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2, 3]));
    }

    #[test]
    fn device_local_staging_is_rejected() {
        let mut ctx = context();
        let mut desc = RingDesc::staging(&RingConfig::default());
        desc.kind = AllocationType::GpuOnly;

        assert!(matches!(
            StagingRing::with_desc(&mut ctx, desc),
            Err(RenderError::NotHostVisible { .. })
        ));
    }
}
