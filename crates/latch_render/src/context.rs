//! Render context
//!
//! Owns the device, the memory arena and the garbage buckets. It is built
//! once at startup and passed by `&mut` to every ring, upload and frame call;
//! there is no global arena. All mutation happens on the submitting thread.

use crate::config::RenderConfig;
use crate::device::{CommandBufferHandle, GpuDevice};
use crate::error::Result;
use crate::garbage::{FlushStats, Garbage, GarbageCollector};
use crate::memory::{Allocator, MemoryArena};
use latch_metrics::Counter;

pub struct RenderContext<D: GpuDevice> {
    device: D,
    arena: MemoryArena,
    garbage: GarbageCollector,
    config: RenderConfig,
    counters: Counter,
}

impl<D: GpuDevice> RenderContext<D> {
    pub fn new(device: D, config: RenderConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "Render context created: {} frame(s) in flight, {} byte minimum block",
            config.frames_in_flight,
            config.memory.min_block_size
        );
        Ok(Self {
            device,
            arena: MemoryArena::new(config.memory),
            garbage: GarbageCollector::new(config.frames_in_flight),
            config,
            counters: Counter::new(),
        })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn frames_in_flight(&self) -> usize {
        self.config.frames_in_flight
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut MemoryArena {
        &mut self.arena
    }

    pub fn allocator(&mut self) -> Allocator<'_, D> {
        Allocator::new(&mut self.device, &mut self.arena)
    }

    pub fn garbage(&self) -> &GarbageCollector {
        &self.garbage
    }

    /// Retire `item` into `slot`'s bucket.
    pub fn add_to_garbage(&mut self, slot: usize, item: impl Into<Garbage>) {
        self.garbage.add(slot, item);
    }

    /// Destroy `slot`'s garbage. The frame that last used `slot` must be complete.
    pub fn flush_garbage(&mut self, slot: usize) -> Result<FlushStats> {
        let stats = self.garbage.flush(slot, &mut self.device, &mut self.arena)?;
        self.counters.add("garbage.destroyed", stats.total() as u64);
        Ok(stats)
    }

    /// Record, submit and block until the GPU is idle.
    pub fn immediate_submit<R>(
        &mut self,
        record: impl FnOnce(&mut D, CommandBufferHandle) -> Result<R>,
    ) -> Result<R> {
        crate::immediate::immediate_submit(&mut self.device, record)
    }

    pub fn counters(&self) -> &Counter {
        &self.counters
    }

    pub(crate) fn counters_mut(&mut self) -> &mut Counter {
        &mut self.counters
    }

    /// Wait for the device, flush every bucket, release all memory and hand
    /// the device back.
    pub fn shutdown(mut self) -> Result<D> {
        self.device.queue_wait_idle()?;
        let flushed = self
            .garbage
            .flush_all(&mut self.device, &mut self.arena)?;
        self.arena.destroy(&mut self.device);
        tracing::info!("Render context shut down ({} garbage item(s) flushed)", flushed.total());
        Ok(self.device)
    }
}
