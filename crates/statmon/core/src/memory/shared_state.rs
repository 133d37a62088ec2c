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

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use super::sync::{self, RwSpinLock, SpinGuard, SpinLock};

/// Marks an empty link in the entry free list
pub const NO_SLOT: u32 = u32::MAX;

/// Process-group wide state at a fixed offset of the shared region
///
/// `lock` guards the table structure (index, free list, slot ownership).
/// `mutex` guards the per-bucket scalars in [`BucketState`] and `n_writers`.
/// The bucket markers are plain atomics updated by compare-and-swap.
#[repr(C)]
#[derive(Debug)]
pub struct SharedState {
    pub(crate) lock: RwSpinLock,
    pub(crate) mutex: SpinLock,
    pub(crate) current_bucket: AtomicU64,
    pub(crate) prev_bucket_sec: AtomicU64,
    pub(crate) cur_median_usage: AtomicU64, // f64 bits, written under `lock`
    pub(crate) n_writers: AtomicI64,        // text copies in flight, shared segment or overflow file
    pub(crate) live_entries: AtomicU64,     // written under `lock`
    pub(crate) free_head: AtomicU32,        // written under `lock`
    pub(crate) dealloc_passes: AtomicU64,
    pub(crate) rotations: AtomicU64,
}

impl SharedState {
    pub fn median_usage(&self) -> f64 {
        f64::from_bits(self.cur_median_usage.load(Ordering::Relaxed))
    }

    pub(crate) fn set_median_usage(&self, usage: f64) {
        self.cur_median_usage.store(usage.to_bits(), Ordering::Relaxed);
    }

    pub fn current_bucket(&self) -> u64 {
        self.current_bucket.load(Ordering::Acquire)
    }

    pub fn live_entries(&self) -> u64 {
        self.live_entries.load(Ordering::Relaxed)
    }

    pub fn writers(&self) -> i64 {
        self.n_writers.load(Ordering::Relaxed)
    }

    /// Takes `mutex` once no text copy is in flight
    ///
    /// Writers register under `mutex` before they copy and deregister after,
    /// so while the returned guard is held no reservation handed out earlier
    /// can still be writing bytes. Resetting a text segment or overflow file
    /// requires this.
    pub(crate) fn lock_quiescent(&self) -> SpinGuard<'_> {
        let mut spins = 0;
        loop {
            let guard = self.mutex.lock();
            if self.n_writers.load(Ordering::Relaxed) <= 0 {
                return guard;
            }
            drop(guard);
            sync::backoff(&mut spins);
        }
    }

    pub fn dealloc_passes(&self) -> u64 {
        self.dealloc_passes.load(Ordering::Relaxed)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }
}

/// Per-bucket bookkeeping, one per configured bucket
///
/// Every field is mutated only while holding [`SharedState::mutex`], reads
/// that only need an estimate load them without it.
#[repr(C)]
#[derive(Debug)]
pub struct BucketState {
    pub(crate) start_time: AtomicU64,
    pub(crate) entry_count: AtomicU64,
    pub(crate) text_epoch: AtomicU64,
    pub(crate) text_used: AtomicU64,
    pub(crate) text_live: AtomicU64,
    pub(crate) overflow_epoch: AtomicU64,
    pub(crate) overflow_used: AtomicU64,
    pub(crate) overflow_live: AtomicU64,
}

impl BucketState {
    pub fn start_time(&self) -> u64 {
        self.start_time.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn text_used(&self) -> u64 {
        self.text_used.load(Ordering::Relaxed)
    }

    /// Forgets all text of the bucket, outstanding handles stop resolving
    pub(crate) fn reset_text(&self) {
        self.text_epoch.fetch_add(1, Ordering::Relaxed);
        self.text_used.store(0, Ordering::Relaxed);
        self.text_live.store(0, Ordering::Relaxed);
    }

    pub(crate) fn reset_overflow(&self) {
        self.overflow_epoch.fetch_add(1, Ordering::Relaxed);
        self.overflow_used.store(0, Ordering::Relaxed);
        self.overflow_live.store(0, Ordering::Relaxed);
    }
}
