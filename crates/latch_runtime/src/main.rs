//! Latch Engine Runtime
//!
//! Boots the render core on the headless device and drives a frame loop that
//! streams geometry and uniforms through the per-frame rings, survives a
//! resize and an out-of-date present, then shuts down and reports.
//!
//! Usage: `latch [render-config.json] [frames]`

use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec3};
use latch_render::device::headless::{HeadlessDevice, HeadlessSurface};
use latch_render::device::{DescriptorSetLayoutHandle, GpuDevice, PresentOutcome};
use latch_render::winit::dpi::PhysicalSize;
use latch_render::{FrameScheduler, RenderConfig, RenderContext, RingSet};

const DEFAULT_FRAMES: u64 = 300;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    view_proj: [[f32; 4]; 4],
    time: f32,
    _padding: [f32; 3],
}

/// Small ring capacities so the demo exercises ring growth.
fn demo_config() -> RenderConfig {
    let mut config = RenderConfig::default();
    config.rings.staging_capacity = 32 * 1024;
    config.rings.vertex_capacity = 16 * 1024;
    config.rings.index_capacity = 4 * 1024;
    config.rings.uniform_capacity = 4 * 1024;
    config.frame.stats_interval = 60;
    config
}

/// A fan of triangles; the count ramps up over the run.
fn build_geometry(frame: u64) -> (Vec<Vertex>, Vec<u32>) {
    let triangles = 64 * (1 + frame / 30) as usize;
    let mut vertices = Vec::with_capacity(triangles * 3);
    let mut indices = Vec::with_capacity(triangles * 3);

    for i in 0..triangles {
        let angle = i as f32 / triangles as f32 * std::f32::consts::TAU;
        let (sin, cos) = angle.sin_cos();
        let base = vertices.len() as u32;
        vertices.push(Vertex { position: [0.0, 0.0], color: [1.0, 1.0, 1.0] });
        vertices.push(Vertex { position: [cos, sin], color: [cos.abs(), sin.abs(), 0.5] });
        vertices.push(Vertex {
            position: [(angle + 0.05).cos(), (angle + 0.05).sin()],
            color: [0.5, cos.abs(), sin.abs()],
        });
        indices.extend_from_slice(&[base, base + 1, base + 2]);
    }
    (vertices, indices)
}

fn uniforms(frame: u64, extent: PhysicalSize<u32>) -> Uniforms {
    let time = frame as f32 / 60.0;
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let projection = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
    let eye = Vec3::new(time.sin() * 3.0, 1.5, time.cos() * 3.0);
    let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
    Uniforms {
        view_proj: (projection * view).to_cols_array_2d(),
        time,
        _padding: [0.0; 3],
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    tracing::info!("Latch Engine v{}", latch_render::VERSION);

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => RenderConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => demo_config(),
    };
    let frames = match args.next() {
        Some(n) => n.parse().context("frame count must be an integer")?,
        None => DEFAULT_FRAMES,
    };

    let mut ctx = RenderContext::new(HeadlessDevice::new(), config)?;
    let mut surface = HeadlessSurface::new(PhysicalSize::new(1280, 720), 3);
    let mut extent = PhysicalSize::new(1280, 720);

    let layout = DescriptorSetLayoutHandle(1);
    let mut rings = RingSet::new(&mut ctx, layout)?;
    let mut scheduler = FrameScheduler::new(&mut ctx)?;

    for frame in 0..frames {
        if frame == frames / 3 {
            extent = PhysicalSize::new(1920, 1080);
            scheduler.notify_resize(extent);
        }
        if frame == 2 * frames / 3 {
            surface.script_present(PresentOutcome::OutOfDate);
        }

        let token = scheduler.acquire(&mut ctx, &mut surface)?;
        let cb = token.command_buffer;

        let (vertices, indices) = build_geometry(frame);
        let vertex_span = rings.upload_vertices(&mut ctx, cb, &vertices)?;
        let index_span = rings.upload_indices(&mut ctx, cb, &indices)?;
        let binding = rings.upload_uniform(&mut ctx, cb, &uniforms(frame, extent))?;

        let device = ctx.device_mut();
        device.cmd_bind_vertex_buffer(cb, vertex_span.buffer, vertex_span.offset);
        device.cmd_bind_index_buffer(cb, index_span.buffer, index_span.offset);
        device.cmd_bind_descriptor_set(cb, binding.descriptor_set, binding.dynamic_offset);
        device.cmd_draw_indexed(cb, indices.len() as u32, 1);

        scheduler.end_frame(&mut ctx, &mut surface, &mut rings)?;
    }

    let recreations = scheduler.recreations();
    let growths = [
        ("staging", rings.staging.ring().growth_count()),
        ("vertex", rings.vertex.ring().growth_count()),
        ("index", rings.index.ring().growth_count()),
        ("uniform", rings.uniform.ring().growth_count()),
    ];
    let arena = ctx.arena().stats();

    scheduler.destroy(&mut ctx)?;
    rings.destroy(&mut ctx)?;

    latch_metrics::metrics! {
        for (name, value) in ctx.arena().counters().iter().chain(ctx.counters().iter()) {
            tracing::info!("{name}: {} (peak {})", value.current, value.peak);
        }
    }

    let device = ctx.shutdown()?;
    let stats = device.stats();

    tracing::info!("Ran {frames} frame(s), {recreations} presentation chain recreation(s)");
    for (name, count) in growths {
        tracing::info!("{name} ring grew {count} time(s)");
    }
    tracing::info!(
        "Arena: {} active / {} tombstoned block(s), {} of {} bytes used",
        arena.active_blocks,
        arena.tombstoned_blocks,
        arena.used_bytes,
        arena.reserved_bytes
    );
    tracing::info!(
        "Device: {} submission(s), {} draw(s), {} copies ({} bytes), {} memory allocation(s)",
        stats.submissions,
        stats.draws,
        stats.copies,
        stats.bytes_copied,
        stats.memory_allocations
    );

    if !device.violations().is_empty() {
        bail!("{} GPU lifetime violation(s) detected", device.violations().len());
    }
    if device.live_memory_count() != 0 {
        bail!("{} native memory object(s) leaked", device.live_memory_count());
    }

    tracing::info!("Runtime shut down cleanly");
    Ok(())
}
