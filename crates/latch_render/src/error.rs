//! Error types for the GPU memory and frame lifecycle core.
//!
//! Every [`RenderError`] is unrecoverable from the renderer's point of view:
//! a missing memory class or a failed native creation leaves nothing sensible
//! to fall back to, so callers propagate them up and stop. Capacity misses in
//! the arena or a ring are not errors at all (they trigger growth), and a
//! stale presentation surface is recovered internally by the frame scheduler.

use crate::device::DeviceError;
use crate::frame::FramePhase;
use crate::memory::AllocationType;
use thiserror::Error;

/// Errors raised by the render core.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no memory type satisfies {kind:?} within type bits {type_bits:#x}")]
    NoCompatibleMemoryType { kind: AllocationType, type_bits: u32 },

    #[error("device call failed: {0}")]
    Device(#[from] DeviceError),

    #[error("block slot {index} generation {generation} has been released or reused")]
    StaleBlock { index: u32, generation: u32 },

    #[error("{kind:?} memory is not host visible and cannot be mapped")]
    NotHostVisible { kind: AllocationType },

    #[error("uniform block of {size} bytes exceeds the {range} byte binding range")]
    UniformBlockTooLarge { size: u64, range: u64 },

    #[error("dynamic uniform offset {offset} does not fit in 32 bits")]
    DynamicOffsetOverflow { offset: u64 },

    #[error("frame scheduler expected phase {expected:?}, found {found:?}")]
    InvalidFramePhase {
        expected: FramePhase,
        found: FramePhase,
    },

    #[error("presentation surface still out of date after {attempts} recreation attempt(s)")]
    SurfaceLost { attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;
