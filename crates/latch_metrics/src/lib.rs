//! Latch Metrics - Common utilities for performance tracking
//!
//! Provides zero-cost abstractions for metrics collection that completely
//! vanish in production builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use latch_metrics::{Counter, FrameTimer};
//!
//! let mut timer = FrameTimer::new(60); // Track last 60 frames
//! timer.begin();
//! // ... record and submit ...
//! timer.end();
//!
//! let mut counters = Counter::new();
//! counters.increment("arena.blocks_created");
//! ```
//!
//! In production builds (without `metrics` feature), all instrumentation
//! is compiled out to zero overhead.

#[cfg(feature = "metrics")]
mod counter;
#[cfg(feature = "metrics")]
mod frame_timer;
#[cfg(feature = "metrics")]
mod rolling;

#[cfg(feature = "metrics")]
pub use counter::{Counter, CounterValue};
#[cfg(feature = "metrics")]
pub use frame_timer::FrameTimer;
#[cfg(feature = "metrics")]
pub use rolling::RollingWindow;

// ============================================================================
// Macros for conditional compilation
// ============================================================================

/// Execute code only when metrics are enabled
#[macro_export]
macro_rules! metrics {
    ($($tt:tt)*) => {
        #[cfg(feature = "metrics")]
        {
            $($tt)*
        }
    };
}

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
pub struct FrameTimer;

#[cfg(not(feature = "metrics"))]
impl FrameTimer {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn begin(&mut self) {}
    pub fn end(&mut self) {}
    pub fn record_gpu_wait(&mut self, _waited: std::time::Duration) {}
    pub fn frames(&self) -> u64 { 0 }
    pub fn fps(&self) -> f64 { 0.0 }
    pub fn frame_time_ms(&self) -> f64 { 0.0 }
    pub fn last_frame_ms(&self) -> f64 { 0.0 }
    pub fn worst_frame_ms(&self) -> f64 { 0.0 }
    pub fn gpu_wait_ms(&self) -> f64 { 0.0 }
}

#[cfg(not(feature = "metrics"))]
pub struct RollingWindow<T>(std::marker::PhantomData<T>);

#[cfg(not(feature = "metrics"))]
impl<T> RollingWindow<T> {
    pub fn new(_capacity: usize) -> Self { Self(std::marker::PhantomData) }
    pub fn push(&mut self, _value: T) -> Option<T> { None }
    pub fn latest(&self) -> Option<T> { None }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub current: u64,
    pub peak: u64,
}

#[cfg(not(feature = "metrics"))]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&mut self, _name: &'static str) {}
    pub fn add(&mut self, _name: &'static str, _value: u64) {}
    pub fn sub(&mut self, _name: &'static str, _value: u64) {}
    pub fn set(&mut self, _name: &'static str, _value: u64) {}
    pub fn get(&self, _name: &str) -> u64 { 0 }
    pub fn peak(&self, _name: &str) -> u64 { 0 }
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, CounterValue)> + '_ {
        std::iter::empty()
    }
}

#[cfg(not(feature = "metrics"))]
impl Default for Counter {
    fn default() -> Self { Self }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_compiles_with_or_without_metrics() {
        let mut timer = super::FrameTimer::new(60);
        timer.begin();
        timer.end();
        let mut _window = super::RollingWindow::<std::time::Duration>::new(10);
        let mut counter = super::Counter::new();
        counter.increment("arena.blocks_created");
        let _ = counter.get("arena.blocks_created");
    }
}
