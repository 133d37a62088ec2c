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

//! Placement of every sub-region inside the shared mapping
//!
//! ```text
//! +--------+-------------+--------------+-----------+---------------+------------------+
//! | Header | SharedState | BucketState  | Index     | Entry slots   | Query text       |
//! |        |             | x buckets    | u32 x 2^k | x max_entries | segment x bucket |
//! +--------+-------------+--------------+-----------+---------------+------------------+
//! ```
//!
//! All offsets are cache-line aligned. The layout is a pure function of the
//! configuration, so a creator and its attachers compute the same offsets
//! independently and the creator records the parameters in the header for
//! attachers to verify.

use std::mem;
use std::sync::atomic::AtomicU32;

use super::lib::{CACHE_LINE, align_to, next_power_of_two};
use super::region::RegionHeader;
use super::shared_state::{BucketState, SharedState};
use crate::config::MonitorConfig;
use crate::table::EntrySlot;

/// Parameters that must agree between the creator and every attacher
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayoutParams {
    pub max_entries: u64,
    pub bucket_count: u64,
    pub index_len: u64,
    pub segment_size: u64,
    pub slot_size: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub max_entries: usize,
    pub bucket_count: usize,
    pub index_len: usize,
    pub segment_size: usize,
    pub shared_offset: usize,
    pub buckets_offset: usize,
    pub index_offset: usize,
    pub slots_offset: usize,
    pub text_offset: usize,
    pub total_size: usize,
}

impl RegionLayout {
    pub fn for_config(config: &MonitorConfig) -> Self {
        let max_entries = config.max_entries;
        let bucket_count = config.max_buckets;
        // Load factor stays at or below one half so probe chains remain short
        let index_len = next_power_of_two(max_entries * 2).max(8);
        let segment_size = config.segment_size();

        let shared_offset = align_to(mem::size_of::<RegionHeader>(), CACHE_LINE);
        let buckets_offset = align_to(shared_offset + mem::size_of::<SharedState>(), CACHE_LINE);
        let index_offset = align_to(buckets_offset + bucket_count * mem::size_of::<BucketState>(), CACHE_LINE);
        let slots_offset = align_to(index_offset + index_len * mem::size_of::<AtomicU32>(), CACHE_LINE);
        let text_offset = align_to(slots_offset + max_entries * mem::size_of::<EntrySlot>(), CACHE_LINE);
        let total_size = text_offset + bucket_count * segment_size;

        Self {
            max_entries,
            bucket_count,
            index_len,
            segment_size,
            shared_offset,
            buckets_offset,
            index_offset,
            slots_offset,
            text_offset,
            total_size,
        }
    }

    pub fn params(&self) -> LayoutParams {
        LayoutParams {
            max_entries: self.max_entries as u64,
            bucket_count: self.bucket_count as u64,
            index_len: self.index_len as u64,
            segment_size: self.segment_size as u64,
            slot_size: mem::size_of::<EntrySlot>() as u64,
            total_size: self.total_size as u64,
        }
    }

    /// Total bytes of query text the region can hold
    pub fn text_capacity(&self) -> usize {
        self.bucket_count * self.segment_size
    }
}

/// Bytes of shared memory a region created from `config` occupies
pub fn required_shared_memory(config: &MonitorConfig) -> usize {
    RegionLayout::for_config(config).total_size
}
