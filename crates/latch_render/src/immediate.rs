//! One-shot setup submissions
//!
//! Acquire a transient command buffer, record, submit, block until the queue
//! is idle, release. Every setup upload goes through [`immediate_submit`].

use crate::context::RenderContext;
use crate::device::{
    BufferCopy, BufferDesc, BufferHandle, CommandBufferHandle, GpuDevice, SubmitInfo,
};
use crate::error::Result;
use crate::memory::{Allocation, AllocationType};
use bytemuck::Pod;

pub fn immediate_submit<D: GpuDevice, R>(
    device: &mut D,
    record: impl FnOnce(&mut D, CommandBufferHandle) -> Result<R>,
) -> Result<R> {
    let command_buffer = device.allocate_command_buffer()?;
    let result = record_and_wait(device, command_buffer, record);
    device.free_command_buffer(command_buffer);
    result
}

fn record_and_wait<D: GpuDevice, R>(
    device: &mut D,
    command_buffer: CommandBufferHandle,
    record: impl FnOnce(&mut D, CommandBufferHandle) -> Result<R>,
) -> Result<R> {
    device.begin_command_buffer(command_buffer)?;
    let value = record(device, command_buffer)?;
    device.end_command_buffer(command_buffer)?;
    device.submit(&SubmitInfo {
        command_buffers: &[command_buffer],
        ..Default::default()
    })?;
    device.queue_wait_idle()?;
    Ok(value)
}

/// Create a device-local buffer holding `bytes`, filled through a temporary
/// staging buffer.
pub fn upload_static_buffer<D: GpuDevice>(
    ctx: &mut RenderContext<D>,
    label: &'static str,
    bytes: &[u8],
    usage: wgpu::BufferUsages,
) -> Result<(BufferHandle, Allocation)> {
    let size = bytes.len() as u64;
    let (dst, dst_memory) = ctx.allocator().allocate_buffer(
        &BufferDesc {
            label: Some(label),
            size,
            usage: usage | wgpu::BufferUsages::COPY_DST,
        },
        AllocationType::GpuOnly,
    )?;
    let (src, src_memory) = ctx.allocator().allocate_buffer(
        &BufferDesc {
            label: Some("static upload staging"),
            size,
            usage: wgpu::BufferUsages::COPY_SRC,
        },
        AllocationType::CpuToGpu,
    )?;

    ctx.arena_mut().mapped_slice_mut(&src_memory)?[..bytes.len()].copy_from_slice(bytes);
    ctx.immediate_submit(|device, command_buffer| {
        device.cmd_copy_buffer(
            command_buffer,
            src,
            dst,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );
        Ok(())
    })?;

    // queue is idle, the staging copy can go right away
    ctx.allocator().free_buffer(src, src_memory)?;
    tracing::debug!("Uploaded static buffer '{label}' ({size} bytes)");
    Ok((dst, dst_memory))
}

pub fn upload_static_pod<D: GpuDevice, T: Pod>(
    ctx: &mut RenderContext<D>,
    label: &'static str,
    data: &[T],
    usage: wgpu::BufferUsages,
) -> Result<(BufferHandle, Allocation)> {
    upload_static_buffer(ctx, label, bytemuck::cast_slice(data), usage)
}
