//! Rolling sample windows for frame statistics

use std::collections::VecDeque;
use std::time::Duration;

/// The last `capacity` samples in arrival order.
pub struct RollingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `sample`, returning the one that fell out of the window.
    pub fn push(&mut self, sample: T) -> Option<T> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn latest(&self) -> Option<T> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl RollingWindow<Duration> {
    pub fn average(&self) -> Duration {
        match u32::try_from(self.samples.len()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.samples.iter().sum::<Duration>() / n,
        }
    }

    /// Longest sample in the window.
    pub fn worst(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn oldest_sample_falls_out() {
        let mut window = RollingWindow::new(3);
        assert_eq!(window.average(), Duration::ZERO);
        assert_eq!(window.latest(), None);

        assert_eq!(window.push(ms(10)), None);
        window.push(ms(20));
        window.push(ms(30));
        assert_eq!(window.average(), ms(20));

        assert_eq!(window.push(ms(40)), Some(ms(10)));
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), ms(30));
        assert_eq!(window.latest(), Some(ms(40)));
        assert_eq!(window.worst(), ms(40));
    }

    #[test]
    fn spike_is_reported_until_it_leaves() {
        let mut window = RollingWindow::new(2);
        window.push(ms(50));
        window.push(ms(5));
        assert_eq!(window.worst(), ms(50));

        window.push(ms(6));
        assert_eq!(window.worst(), ms(6));
    }
}
