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

//! Usage-decay eviction
//!
//! Every access adds to an entry's usage score and every dealloc pass decays
//! all scores, so the score approximates recent access frequency. Entries
//! that were seen but never finished ("sticky") decay faster. A pass removes
//! a small fixed share of the lowest scores, never more than the half at or
//! below the median.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;

use metrics::counter;
use tracing::debug;

use super::entry::EntryHandle;
use super::hash_table::TableWriter;

/// Usage added per finished execution
pub const USAGE_EXEC: f64 = 1.0;
/// Usage of a newly created regular entry
pub const USAGE_INIT: f64 = 1.0;
/// Median assumed before the first pass has computed one
pub const ASSUMED_MEDIAN_INIT: f64 = 10.0;
pub const USAGE_DECREASE_FACTOR: f64 = 0.99;
pub const STICKY_DECREASE_FACTOR: f64 = 0.50;
/// Share of live entries removed per pass, in percent
pub const USAGE_DEALLOC_PERCENT: usize = 5;

/// Number of entries one pass removes out of `live`
pub fn victims_for(live: usize) -> usize {
    if live == 0 {
        return 0;
    }
    let share = (live * USAGE_DEALLOC_PERCENT).div_ceil(100).max(1);
    share.min((live / 2).max(1))
}

/// Decays every score, records the median and frees the lowest-usage entries
///
/// Runs entirely under the exclusive table lock, so the set of entries is
/// fixed for the whole pass and the insert that triggered it happens after.
/// Ties keep slot order.
pub(crate) fn dealloc_pass(writer: &TableWriter<'_>) -> usize {
    let mut scored: Vec<(EntryHandle, f64)> = Vec::new();
    for handle in writer.handles() {
        let Ok(mut entry) = writer.lock_entry(handle) else {
            continue;
        };
        let factor = if entry.counters.is_sticky() { STICKY_DECREASE_FACTOR } else { USAGE_DECREASE_FACTOR };
        entry.counters.calls.usage *= factor;
        scored.push((handle, entry.counters.calls.usage));
    }
    if scored.is_empty() {
        return 0;
    }

    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal));
    let median = scored[scored.len() / 2].1;

    let shared = writer.table().region().shared();
    shared.set_median_usage(median);
    shared.dealloc_passes.fetch_add(1, Ordering::Relaxed);

    let victims = victims_for(scored.len());
    let removed = scored.iter().take(victims).filter(|(handle, _)| writer.remove(*handle)).count();

    counter!("statmon_entries_evicted", removed as u64);
    debug!(live = scored.len(), removed, median, "dealloc pass finished");
    removed
}
