//! Render core configuration
//!
//! Loaded from JSON; every section falls back to its defaults so a partial
//! file only needs the values it overrides.

use crate::device::WAIT_FOREVER;
use crate::error::{RenderError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rotation depth of every per-frame resource.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Smallest native memory block the arena creates.
pub const MIN_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// New arena blocks are this many times the request that created them.
pub const BLOCK_GROWTH_FACTOR: u64 = 2;

/// Ring slots grow to this many times the overflowing requirement.
pub const RING_GROWTH_FACTOR: u64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub frames_in_flight: usize,
    pub memory: MemoryConfig,
    pub rings: RingConfig,
    pub frame: FrameConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub min_block_size: u64,
    pub block_growth_factor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub growth_factor: u64,
    pub staging_capacity: u64,
    pub vertex_capacity: u64,
    pub index_capacity: u64,
    pub uniform_capacity: u64,
    pub staging_alignment: u64,
    pub vertex_alignment: u64,
    pub index_alignment: u64,
    /// Bytes visible through one dynamic uniform binding.
    pub uniform_binding_range: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Recreate-and-reacquire attempts after an out-of-date acquisition.
    pub max_acquire_retries: u32,
    pub fence_timeout_ns: u64,
    /// Frames between statistics log lines; 0 disables them.
    pub stats_interval: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: FRAMES_IN_FLIGHT,
            memory: MemoryConfig::default(),
            rings: RingConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_block_size: MIN_BLOCK_SIZE,
            block_growth_factor: BLOCK_GROWTH_FACTOR,
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            growth_factor: RING_GROWTH_FACTOR,
            staging_capacity: 4 * 1024 * 1024,
            vertex_capacity: 2 * 1024 * 1024,
            index_capacity: 1024 * 1024,
            uniform_capacity: 256 * 1024,
            staging_alignment: 16,
            vertex_alignment: wgpu::COPY_BUFFER_ALIGNMENT,
            index_alignment: wgpu::COPY_BUFFER_ALIGNMENT,
            uniform_binding_range: 256,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_acquire_retries: 1,
            fence_timeout_ns: WAIT_FOREVER,
            stats_interval: 0,
        }
    }
}

impl RenderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        tracing::info!("Loaded render config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(RenderError::InvalidConfig(msg))
        }

        if self.frames_in_flight == 0 {
            return invalid("frames_in_flight must be at least 1".into());
        }
        if self.memory.block_growth_factor < 2 {
            return invalid("memory.block_growth_factor must be at least 2".into());
        }
        if self.rings.growth_factor < 2 {
            return invalid("rings.growth_factor must be at least 2".into());
        }
        let r = &self.rings;
        for (name, capacity) in [
            ("staging_capacity", r.staging_capacity),
            ("vertex_capacity", r.vertex_capacity),
            ("index_capacity", r.index_capacity),
            ("uniform_capacity", r.uniform_capacity),
            ("uniform_binding_range", r.uniform_binding_range),
        ] {
            if capacity == 0 {
                return invalid(format!("rings.{name} must be non-zero"));
            }
        }
        for (name, alignment) in [
            ("staging_alignment", r.staging_alignment),
            ("vertex_alignment", r.vertex_alignment),
            ("index_alignment", r.index_alignment),
        ] {
            if !alignment.is_power_of_two() {
                return invalid(format!("rings.{name} must be a power of two, got {alignment}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RenderConfig::from_json_str(
            r#"{ "memory": { "min_block_size": 1048576 }, "frame": { "stats_interval": 60 } }"#,
        )
        .unwrap();

        assert_eq!(config.memory.min_block_size, 1024 * 1024);
        assert_eq!(config.memory.block_growth_factor, BLOCK_GROWTH_FACTOR);
        assert_eq!(config.frames_in_flight, FRAMES_IN_FLIGHT);
        assert_eq!(config.frame.stats_interval, 60);
        assert_eq!(config.frame.fence_timeout_ns, u64::MAX);
    }

    #[test]
    fn rejects_zero_frames_in_flight() {
        let err = RenderConfig::from_json_str(r#"{ "frames_in_flight": 0 }"#).unwrap_err();
        assert!(matches!(err, RenderError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let mut config = RenderConfig::default();
        config.rings.vertex_alignment = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = RenderConfig::from_json_str("{ frames_in_flight: }").unwrap_err();
        assert!(matches!(err, RenderError::ConfigParse(_)));
    }
}
