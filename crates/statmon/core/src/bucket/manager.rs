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

use std::sync::Arc;
use std::sync::atomic::Ordering;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::clock::Clock;
use crate::memory::BucketState;
use crate::table::{StatsTable, TableWriter};

/// Point-in-time view of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub id: u64,
    pub start_time: u64,
    pub entry_count: u64,
    pub text_used: u64,
    pub current: bool,
}

/// Ring of time buckets shared by the process group
///
/// Rotation is lazy: every caller of [`BucketManager::tick`] checks whether
/// the bucket length has elapsed since the last rotation, and the one caller
/// that wins the compare-and-swap on the shared marker performs it. Bucket
/// starts are aligned to multiples of the bucket length.
pub struct BucketManager {
    table: Arc<StatsTable>,
    clock: Arc<dyn Clock>,
    bucket_time: u64,
}

impl BucketManager {
    pub fn new(table: Arc<StatsTable>, clock: Arc<dyn Clock>, bucket_time: u64) -> Self {
        Self {
            table,
            clock,
            bucket_time: bucket_time.max(1),
        }
    }

    fn align(&self, secs: u64) -> u64 {
        secs - secs % self.bucket_time
    }

    fn bucket_count(&self) -> u64 {
        self.table.region().buckets().len() as u64
    }

    /// Starts the ring at bucket 0, run once by the creator
    pub fn initialize(&self) {
        let now = self.clock.now_secs();
        let shared = self.table.region().shared();
        shared.current_bucket.store(0, Ordering::Release);
        shared.prev_bucket_sec.store(self.align(now), Ordering::Release);
        if let Some(first) = self.table.region().buckets().first() {
            let _guard = shared.mutex.lock();
            first.start_time.store(self.align(now), Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> u64 {
        self.table.region().shared().current_bucket()
    }

    /// Returns the active bucket, rotating first if its time is up
    pub fn tick(&self) -> u64 {
        let now = self.clock.now_secs();
        let shared = self.table.region().shared();
        let prev = shared.prev_bucket_sec.load(Ordering::Acquire);

        if now.saturating_sub(prev) >= self.bucket_time {
            let start = self.align(now);
            // Losers of the race carry on with whatever the winner publishes
            if shared.prev_bucket_sec.compare_exchange(prev, start, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return self.rotate_at(start);
            }
        }
        self.current()
    }

    /// Advances the ring by one bucket unconditionally
    pub fn rotate(&self) -> u64 {
        let start = self.align(self.clock.now_secs());
        self.table.region().shared().prev_bucket_sec.store(start, Ordering::Release);
        self.rotate_at(start)
    }

    fn rotate_at(&self, start: u64) -> u64 {
        let writer = self.table.writer();
        let shared = self.table.region().shared();
        let next = (shared.current_bucket() + 1) % self.bucket_count();

        let purged = self.clear_locked(&writer, next, start);
        shared.current_bucket.store(next, Ordering::Release);
        shared.rotations.fetch_add(1, Ordering::Relaxed);
        drop(writer);

        counter!("statmon_bucket_rotations", 1);
        info!(bucket = next, purged, start, "rotated to next bucket");
        next
    }

    /// Purges entries and text of `bucket` and restarts its bookkeeping
    fn clear_locked(&self, writer: &TableWriter<'_>, bucket: u64, start: u64) -> usize {
        let purged = writer.remove_where(|key| key.bucket_id == bucket);
        self.table.text_store().reset_bucket(bucket);

        if let Some(state) = self.table.region().buckets().get(bucket as usize) {
            let _guard = self.table.region().shared().mutex.lock();
            state.entry_count.store(0, Ordering::Relaxed);
            state.start_time.store(start, Ordering::Relaxed);
        }
        purged
    }

    /// Clears one bucket without changing which bucket is active
    pub fn reset_bucket(&self, bucket: u64) -> usize {
        if bucket >= self.bucket_count() {
            return 0;
        }
        let writer = self.table.writer();
        let start = if bucket == self.current() { self.align(self.clock.now_secs()) } else { 0 };
        let purged = self.clear_locked(&writer, bucket, start);
        drop(writer);

        debug!(bucket, purged, "bucket reset");
        purged
    }

    /// Drops every entry and restarts the ring at bucket 0
    pub fn reset_all(&self) -> usize {
        let writer = self.table.writer();
        let now = self.align(self.clock.now_secs());
        let mut purged = 0;
        for bucket in 0..self.bucket_count() {
            purged += self.clear_locked(&writer, bucket, if bucket == 0 { now } else { 0 });
        }
        let shared = self.table.region().shared();
        shared.current_bucket.store(0, Ordering::Release);
        shared.prev_bucket_sec.store(now, Ordering::Release);
        drop(writer);

        info!(purged, "all statistics reset");
        purged
    }

    pub fn bucket_info(&self, bucket: u64) -> Option<BucketInfo> {
        let state: &BucketState = self.table.region().buckets().get(bucket as usize)?;
        Some(BucketInfo {
            id: bucket,
            start_time: state.start_time(),
            entry_count: state.entry_count(),
            text_used: state.text_used(),
            current: bucket == self.current(),
        })
    }

    pub fn buckets(&self) -> Vec<BucketInfo> {
        (0..self.bucket_count()).filter_map(|id| self.bucket_info(id)).collect()
    }

    pub fn bucket_time(&self) -> u64 {
        self.bucket_time
    }
}
