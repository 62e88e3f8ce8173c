//! Sample-counter to UTC mapping
//!
//! The instrument timestamps streaming data with a free-running sample
//! counter. Time synchronization exchanges yield `(counter, utc)` anchor
//! pairs; [`TimeMapFilter`] keeps a ring of recent anchors and produces a
//! [`TimeMap`] whose prediction never exceeds any observed anchor (lower
//! envelope), which keeps high-latency anchors from skewing time forward.

use std::collections::VecDeque;

/// Nanoseconds per second, the driver's integer time base
pub const NS_PER_SECOND: i64 = 1_000_000_000;

/// Linear relation from sample counter to UTC nanoseconds
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeMap {
    pub offset_counter: u64,
    /// UTC nanoseconds corresponding to `offset_counter`
    pub offset_time: i64,
    /// Counter ticks per second
    pub counter_rate: f64,
}

impl TimeMap {
    /// UTC nanoseconds for a counter value.
    pub fn time_at(&self, counter: u64) -> i64 {
        let delta = counter.wrapping_sub(self.offset_counter) as i64;
        self.offset_time + (delta as f64 * NS_PER_SECOND as f64 / self.counter_rate) as i64
    }

    /// Counter value for a UTC timestamp.
    pub fn counter_at(&self, time: i64) -> u64 {
        let delta_ns = time - self.offset_time;
        let ticks = (delta_ns as f64 * self.counter_rate / NS_PER_SECOND as f64) as i64;
        self.offset_counter.wrapping_add(ticks as u64)
    }
}

/// Ring of `(counter, utc)` anchors with lower-envelope offset selection
pub struct TimeMapFilter {
    anchors: VecDeque<(u64, i64)>,
    capacity: usize,
    /// Minimum UTC spacing between admitted anchors, nanoseconds
    interval: i64,
    /// Rate used until two anchors span the ring
    nominal_rate: f64,
}

impl TimeMapFilter {
    /// Default anchor ring capacity
    pub const CAPACITY_DEFAULT: usize = 64;
    /// Default minimum anchor spacing: 1 second
    pub const INTERVAL_DEFAULT: i64 = NS_PER_SECOND;

    /// Create a filter for an instrument with the given nominal counter rate.
    pub fn new(nominal_rate: f64) -> Self {
        Self {
            anchors: VecDeque::with_capacity(Self::CAPACITY_DEFAULT),
            capacity: Self::CAPACITY_DEFAULT,
            interval: Self::INTERVAL_DEFAULT,
            nominal_rate,
        }
    }

    /// Override the minimum anchor spacing.
    pub fn with_interval(mut self, interval_ns: i64) -> Self {
        self.interval = interval_ns;
        self
    }

    /// Offer an anchor pair. Returns whether it was admitted (anchors closer
    /// than the minimum spacing to the previous one are dropped).
    pub fn add(&mut self, counter: u64, utc: i64) -> bool {
        if let Some(&(_, last_utc)) = self.anchors.back() {
            if utc - last_utc < self.interval {
                return false;
            }
        }
        if self.anchors.len() == self.capacity {
            self.anchors.pop_front();
        }
        self.anchors.push_back((counter, utc));
        true
    }

    /// Number of anchors currently held.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether no anchors have been admitted.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Discard all anchors (device reopen).
    pub fn clear(&mut self) {
        self.anchors.clear();
    }

    /// The current map, or `None` before the first anchor.
    ///
    /// The counter rate comes from the oldest/newest anchor span; the offset
    /// is the minimum over all anchors of the time each one implies for the
    /// oldest anchor's counter, so the prediction at every anchor's counter
    /// is at most that anchor's utc.
    pub fn get(&self) -> Option<TimeMap> {
        let &(first_counter, first_utc) = self.anchors.front()?;
        let &(last_counter, last_utc) = self.anchors.back()?;

        let span_ns = last_utc - first_utc;
        let rate = if span_ns > 0 && last_counter > first_counter {
            (last_counter - first_counter) as f64 * NS_PER_SECOND as f64 / span_ns as f64
        } else {
            self.nominal_rate
        };

        let mut offset_time = first_utc;
        for &(counter, utc) in &self.anchors {
            let delta = counter.wrapping_sub(first_counter) as i64;
            let est = utc - (delta as f64 * NS_PER_SECOND as f64 / rate) as i64;
            offset_time = offset_time.min(est);
        }

        Some(TimeMap {
            offset_counter: first_counter,
            offset_time,
            counter_rate: rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 1_000_000.0; // 1 Msps

    #[test]
    fn test_single_anchor_uses_nominal_rate() {
        let mut tmf = TimeMapFilter::new(RATE);
        assert!(tmf.get().is_none());
        assert!(tmf.add(1000, 5 * NS_PER_SECOND));
        let map = tmf.get().unwrap();
        assert_eq!(map.offset_counter, 1000);
        assert_eq!(map.counter_rate, RATE);
        assert_eq!(map.time_at(1000), 5 * NS_PER_SECOND);
        assert_eq!(map.time_at(1000 + 1_000_000), 6 * NS_PER_SECOND);
    }

    #[test]
    fn test_interval_rejects_dense_anchors() {
        let mut tmf = TimeMapFilter::new(RATE);
        assert!(tmf.add(0, 0));
        assert!(!tmf.add(1000, NS_PER_SECOND / 2));
        assert!(tmf.add(2_000_000, 2 * NS_PER_SECOND));
        assert_eq!(tmf.len(), 2);
    }

    #[test]
    fn test_lower_envelope_property() {
        let mut tmf = TimeMapFilter::new(RATE);
        // One anchor arrives with extra latency (utc reads late).
        let anchors = [
            (0u64, 0i64),
            (1_000_000, NS_PER_SECOND + 3_000_000), // +3 ms latency
            (2_000_000, 2 * NS_PER_SECOND),
            (3_000_000, 3 * NS_PER_SECOND + 500_000),
            (4_000_000, 4 * NS_PER_SECOND),
        ];
        for (c, t) in anchors {
            assert!(tmf.add(c, t));
        }
        let map = tmf.get().unwrap();
        for (c, t) in anchors {
            assert!(
                map.time_at(c) <= t,
                "prediction at {c} exceeds anchor utc"
            );
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut tmf = TimeMapFilter::new(RATE);
        for k in 0..(TimeMapFilter::CAPACITY_DEFAULT as i64 + 8) {
            tmf.add((k as u64) * 1_000_000, k * NS_PER_SECOND);
        }
        assert_eq!(tmf.len(), TimeMapFilter::CAPACITY_DEFAULT);
        assert_eq!(tmf.get().unwrap().offset_counter, 8 * 1_000_000);
    }

    #[test]
    fn test_counter_at_inverts_time_at() {
        let map = TimeMap {
            offset_counter: 500,
            offset_time: 10 * NS_PER_SECOND,
            counter_rate: RATE,
        };
        let t = map.time_at(500 + 123_456);
        let c = map.counter_at(t);
        assert!((c as i64 - (500 + 123_456) as i64).abs() <= 1);
    }
}
