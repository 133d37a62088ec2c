// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};

use super::counters::MAX_RESPONSE_BUCKET;
use crate::config::MonitorConfig;

/// Half-open range `[min, max)` of response times in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value < self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// Log-spaced response time buckets
///
/// Slot 0 catches everything below `min`, the last slot everything at or
/// above `max`. The regular slots in between grow geometrically in
/// `ln(1 + t)` so short and long statements both get useful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHistogram {
    edges: Vec<f64>, // lower edge of slots 1..=buckets+1
}

impl ResponseHistogram {
    pub fn new(min: f64, max: f64, buckets: usize) -> Self {
        let buckets = buckets.clamp(1, MAX_RESPONSE_BUCKET - 2);
        let low = (1.0 + min).ln();
        let high = (1.0 + max).ln();

        let mut edges = Vec::with_capacity(buckets + 1);
        edges.push(min);
        for i in 1..buckets {
            let edge = (low + (high - low) * i as f64 / buckets as f64).exp() - 1.0;
            edges.push(edge);
        }
        edges.push(max);

        Self { edges }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.histogram_min_ms, config.histogram_max_ms, config.histogram_buckets)
    }

    /// Number of slots including the two edge slots
    pub fn len(&self) -> usize {
        self.edges.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Slot receiving a response time of `value` milliseconds
    pub fn bucket_for(&self, value: f64) -> usize {
        if value.is_nan() {
            return 0;
        }
        // Count of edges <= value is exactly the slot index
        self.edges.partition_point(|&edge| edge <= value)
    }

    pub fn ranges(&self) -> Vec<ValueRange> {
        let mut ranges = Vec::with_capacity(self.len());
        ranges.push(ValueRange::new(0.0, self.edges[0]));
        for pair in self.edges.windows(2) {
            ranges.push(ValueRange::new(pair[0], pair[1]));
        }
        ranges.push(ValueRange::new(self.edges[self.edges.len() - 1], f64::INFINITY));
        ranges
    }

    pub fn record(&self, resp_calls: &mut [u64; MAX_RESPONSE_BUCKET], value: f64) {
        let slot = self.bucket_for(value).min(MAX_RESPONSE_BUCKET - 1);
        resp_calls[slot] += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_edge_slots() {
        let hist = ResponseHistogram::new(1.0, 100_000.0, 20);
        assert_eq!(hist.len(), 22);
        assert_eq!(hist.bucket_for(0.0), 0);
        assert_eq!(hist.bucket_for(0.999), 0);
        assert_eq!(hist.bucket_for(1.0), 1);
        assert_eq!(hist.bucket_for(100_000.0), 21);
        assert_eq!(hist.bucket_for(1e12), 21);
    }

    #[test]
    fn test_ranges_are_contiguous() {
        let hist = ResponseHistogram::new(1.0, 1000.0, 5);
        let ranges = hist.ranges();
        assert_eq!(ranges.len(), hist.len());
        assert_eq!(ranges[0].min, 0.0);
        assert!(ranges.last().unwrap().max.is_infinite());
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].max, pair[1].min);
            assert!(pair[0].width() > 0.0);
        }
    }

    #[test]
    fn test_regular_ranges_grow() {
        let hist = ResponseHistogram::new(1.0, 100_000.0, 20);
        let ranges = hist.ranges();
        let widths: Vec<f64> = ranges[1..ranges.len() - 1].iter().map(|r| r.width()).collect();
        for pair in widths.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_record_increments_one_slot() {
        let hist = ResponseHistogram::new(1.0, 100.0, 4);
        let mut resp = [0u64; MAX_RESPONSE_BUCKET];
        hist.record(&mut resp, 5.0);
        hist.record(&mut resp, 5.0);
        hist.record(&mut resp, 500.0);
        assert_eq!(resp.iter().sum::<u64>(), 3);
        assert_eq!(resp[hist.bucket_for(5.0)], 2);
        assert_eq!(resp[hist.len() - 1], 1);
    }

    proptest! {
        #[test]
        fn prop_value_lands_in_its_range(value in 0.0f64..1e7, buckets in 2usize..48) {
            let hist = ResponseHistogram::new(1.0, 100_000.0, buckets);
            let slot = hist.bucket_for(value);
            prop_assert!(slot < hist.len());
            prop_assert!(hist.ranges()[slot].contains(value));
        }
    }
}
