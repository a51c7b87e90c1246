//! Latch Render Core
//!
//! GPU memory sub-allocation and the frame-synchronized transient resource
//! lifecycle:
//!
//! - [`memory`] - block arena with bump allocation, tombstones and owner counts
//! - [`ring`] - per-frame staging, vertex, index and uniform rings
//! - [`garbage`] - deferred destruction keyed by rotation slot
//! - [`frame`] - Acquire → Record → Submit → Present → Rotate scheduling
//! - [`immediate`] - one-shot setup submissions
//!
//! The graphics API itself sits behind [`device::GpuDevice`] and
//! [`device::PresentationSurface`]; [`device::headless`] provides a software
//! implementation.

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod frame;
pub mod garbage;
pub mod immediate;
pub mod memory;
pub mod ring;

pub use config::RenderConfig;
pub use context::RenderContext;
pub use error::{RenderError, Result};
pub use frame::{FramePhase, FrameScheduler, FrameToken};
pub use garbage::{Garbage, GarbageCollector};
pub use immediate::{immediate_submit, upload_static_buffer, upload_static_pod};
pub use memory::{Allocation, AllocationType, Allocator, MemoryArena};
pub use ring::{DeviceRing, MapResult, Ring, RingSet, StageResult, StagingRing, UniformRing};

pub use wgpu;
pub use winit;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
