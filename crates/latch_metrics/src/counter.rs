//! Named counters and gauges for allocator and frame events

use std::collections::HashMap;

/// A named value with its high-water mark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub current: u64,
    pub peak: u64,
}

/// Counters keyed by static names (e.g. `"arena.blocks_created"`).
///
/// Monotonic counters only ever go through [`Counter::increment`]; gauges such
/// as reserved bytes move both ways through [`Counter::add`] / [`Counter::sub`]
/// and remember their peak.
pub struct Counter {
    values: HashMap<&'static str, CounterValue>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    pub fn increment(&mut self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &'static str, value: u64) {
        let entry = self.values.entry(name).or_default();
        entry.current += value;
        entry.peak = entry.peak.max(entry.current);
    }

    /// Saturates at zero.
    pub fn sub(&mut self, name: &'static str, value: u64) {
        let entry = self.values.entry(name).or_default();
        entry.current = entry.current.saturating_sub(value);
    }

    pub fn set(&mut self, name: &'static str, value: u64) {
        let entry = self.values.entry(name).or_default();
        entry.current = value;
        entry.peak = entry.peak.max(value);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).map_or(0, |v| v.current)
    }

    pub fn peak(&self, name: &str) -> u64 {
        self.values.get(name).map_or(0, |v| v.peak)
    }

    pub fn reset_all(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, CounterValue)> + '_ {
        self.values.iter().map(|(name, value)| (*name, *value))
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_peak() {
        let mut counter = Counter::new();
        counter.add("arena.bytes_reserved", 64);
        counter.add("arena.bytes_reserved", 32);
        counter.sub("arena.bytes_reserved", 80);

        assert_eq!(counter.get("arena.bytes_reserved"), 16);
        assert_eq!(counter.peak("arena.bytes_reserved"), 96);
    }

    #[test]
    fn sub_saturates() {
        let mut counter = Counter::new();
        counter.increment("ring.growths");
        counter.sub("ring.growths", 5);
        assert_eq!(counter.get("ring.growths"), 0);
        assert_eq!(counter.get("missing"), 0);
    }
}
