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
use std::sync::atomic::{AtomicU32, Ordering};

use metrics::gauge;
use tracing::{debug, trace};

use super::entry::{EntryBody, EntryGuard, EntryHandle, EntrySlot};
use super::eviction::{self, ASSUMED_MEDIAN_INIT, USAGE_INIT};
use super::{TableError, TableResult};
use crate::memory::sync::{ReadGuard, WriteGuard};
use crate::memory::{NO_SLOT, SharedRegion};
use crate::statistics::EntryKey;
use crate::text::{QueryTextStore, TextHandle};

/// Index cell value of an empty position; occupied cells hold `slot + 1`
const EMPTY: u32 = 0;

/// How a newly claimed entry starts its usage score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryInit {
    /// Finished statements start at the regular initial usage
    Regular,
    /// In-flight statements start at the current median so they survive a pass or two
    Sticky,
}

/// Fixed-capacity hash table over the shared entry arena
///
/// The index is an open-addressing array of slot references with linear
/// probing; deletions shift later cells back instead of leaving tombstones.
/// Structural changes take the table lock exclusively, lookups share it.
/// Counter updates never touch the table lock, they go through
/// [`StatsTable::lock_entry`].
pub struct StatsTable {
    region: Arc<SharedRegion>,
    text: Arc<QueryTextStore>,
}

impl StatsTable {
    pub fn new(region: Arc<SharedRegion>, text: Arc<QueryTextStore>) -> Self {
        Self { region, text }
    }

    /// Builds the free list; run once by the creator before the region is published
    pub fn initialize(&self) {
        let slots = self.slots();
        for (i, slot) in slots.iter().enumerate() {
            let next = if i + 1 < slots.len() { (i + 1) as u32 } else { NO_SLOT };
            slot.next_free.store(next, Ordering::Relaxed);
        }
        let shared = self.region.shared();
        shared.free_head.store(if slots.is_empty() { NO_SLOT } else { 0 }, Ordering::Relaxed);
        shared.live_entries.store(0, Ordering::Relaxed);
        shared.set_median_usage(ASSUMED_MEDIAN_INIT);
        debug!(capacity = slots.len(), "statistics table initialized");
    }

    pub(crate) fn slots(&self) -> &[EntrySlot] {
        self.region.slots()
    }

    fn index(&self) -> &[AtomicU32] {
        self.region.index()
    }

    pub(crate) fn text_store(&self) -> &QueryTextStore {
        &self.text
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    pub fn len(&self) -> usize {
        self.region.shared().live_entries() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index position holding `key`, or the empty position where it would go
    ///
    /// Caller holds the table lock in either mode.
    fn probe(&self, key: &EntryKey, hash: u64) -> Result<usize, usize> {
        let index = self.index();
        let mask = index.len() - 1;
        let mut pos = hash as usize & mask;
        loop {
            let cell = index[pos].load(Ordering::Relaxed);
            if cell == EMPTY {
                return Err(pos);
            }
            let slot = &self.slots()[(cell - 1) as usize];
            // SAFETY: table lock held by the caller
            if slot.hash.load(Ordering::Relaxed) == hash && unsafe { slot.key_unchecked() } == key {
                return Ok(pos);
            }
            pos = (pos + 1) & mask;
        }
    }

    fn handle_at(&self, pos: usize) -> EntryHandle {
        let slot = self.index()[pos].load(Ordering::Relaxed) - 1;
        EntryHandle {
            slot,
            generation: self.slots()[slot as usize].generation(),
        }
    }

    /// Pure lookup
    pub fn find(&self, key: &EntryKey) -> Option<EntryHandle> {
        let _guard = self.region.shared().lock.read();
        self.probe(key, key.slot_hash()).ok().map(|pos| self.handle_at(pos))
    }

    pub fn find_or_insert(&self, key: &EntryKey) -> TableResult<(EntryHandle, bool)> {
        self.find_or_insert_with(key, EntryInit::Regular)
    }

    /// Returns the entry for `key`, claiming a slot if it does not exist yet
    ///
    /// A full table gets one dealloc pass under the same exclusive lock
    /// before the insert is retried. The entry lock is not held on return.
    pub fn find_or_insert_with(&self, key: &EntryKey, init: EntryInit) -> TableResult<(EntryHandle, bool)> {
        let hash = key.slot_hash();
        if let Some(found) = self.find(key) {
            return Ok((found, false));
        }

        let writer = self.writer();
        // Someone may have inserted it between the two locks
        if let Ok(pos) = self.probe(key, hash) {
            return Ok((self.handle_at(pos), false));
        }

        if self.region.shared().free_head.load(Ordering::Relaxed) == NO_SLOT {
            let evicted = eviction::dealloc_pass(&writer);
            debug!(evicted, "table full, ran dealloc pass");
        }

        let shared = self.region.shared();
        let slot_id = shared.free_head.load(Ordering::Relaxed);
        if slot_id == NO_SLOT {
            return Err(TableError::TableFull);
        }
        // Dealloc may have shifted index cells
        let pos = match self.probe(key, hash) {
            Ok(pos) => return Ok((self.handle_at(pos), false)),
            Err(pos) => pos,
        };

        let slot = &self.slots()[slot_id as usize];
        shared.free_head.store(slot.next_free.load(Ordering::Relaxed), Ordering::Relaxed);
        slot.next_free.store(NO_SLOT, Ordering::Relaxed);

        let usage = match init {
            EntryInit::Regular => USAGE_INIT,
            EntryInit::Sticky => {
                let median = shared.median_usage();
                if median > 0.0 { median } else { ASSUMED_MEDIAN_INIT }
            }
        };
        slot.claim(key, hash, usage);
        self.index()[pos].store(slot_id + 1, Ordering::Relaxed);

        if let Some(bucket) = self.region.buckets().get(key.bucket_id as usize) {
            let _guard = shared.mutex.lock();
            bucket.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        let live = shared.live_entries.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("statmon_live_entries", live as f64);
        trace!(slot = slot_id, query_id = key.query_id, bucket = key.bucket_id, "entry created");

        drop(writer);
        Ok((EntryHandle { slot: slot_id, generation: slot.generation() }, true))
    }

    /// Removes the entry for `key`, returns whether it existed
    pub fn delete(&self, key: &EntryKey) -> bool {
        let writer = self.writer();
        match self.probe(key, key.slot_hash()) {
            Ok(pos) => {
                let handle = self.handle_at(pos);
                writer.remove(handle)
            }
            Err(_) => false,
        }
    }

    /// Takes the entry lock, failing if the entry was freed since `handle` was issued
    pub fn lock_entry(&self, handle: EntryHandle) -> TableResult<EntryGuard<'_>> {
        self.slots().get(handle.slot as usize).and_then(|slot| slot.lock(handle)).ok_or(TableError::StaleEntry)
    }

    /// Attaches saved text to an entry, releasing the text if the entry is gone
    pub fn set_text(&self, handle: EntryHandle, text: TextHandle) -> TableResult<()> {
        self.attach_text(handle, text, |entry| &mut entry.text)
    }

    /// Attaches the calling statement's text to a nested entry
    pub fn set_parent_text(&self, handle: EntryHandle, text: TextHandle) -> TableResult<()> {
        self.attach_text(handle, text, |entry| &mut entry.counters.info.parent_text)
    }

    fn attach_text(&self, handle: EntryHandle, text: TextHandle, field: impl FnOnce(&mut EntryBody) -> &mut TextHandle) -> TableResult<()> {
        match self.lock_entry(handle) {
            Ok(mut entry) => {
                let previous = std::mem::replace(field(&mut *entry), text);
                drop(entry);
                if !previous.is_empty() {
                    self.text.release(&previous);
                }
                Ok(())
            }
            Err(e) => {
                self.text.release(&text);
                Err(e)
            }
        }
    }

    /// Scan over live entries
    ///
    /// With `lock` the table lock is held in shared mode until the scan is
    /// dropped, so no entry is created or removed underneath it. Without it
    /// the scan may see entries appear and disappear; stale handles then fail
    /// at [`StatsTable::lock_entry`].
    pub fn iter(&self, lock: bool) -> TableScan<'_> {
        let guard = if lock { Some(self.region.shared().lock.read()) } else { None };
        TableScan { table: self, _guard: guard, next: 0 }
    }

    /// Takes the table lock exclusively
    pub fn writer(&self) -> TableWriter<'_> {
        TableWriter {
            table: self,
            _guard: self.region.shared().lock.write(),
        }
    }

    /// Runs one dealloc pass regardless of occupancy
    pub fn dealloc(&self) -> usize {
        let writer = self.writer();
        eviction::dealloc_pass(&writer)
    }

    /// Removes `slot_id` from the index with backward-shift deletion
    fn unlink(&self, slot_id: u32) {
        let index = self.index();
        let mask = index.len() - 1;
        let slot_hash = |slot: u32| self.slots()[slot as usize].hash.load(Ordering::Relaxed) as usize;

        let mut hole = slot_hash(slot_id) & mask;
        while index[hole].load(Ordering::Relaxed) != slot_id + 1 {
            if index[hole].load(Ordering::Relaxed) == EMPTY {
                return;
            }
            hole = (hole + 1) & mask;
        }

        let mut pos = hole;
        loop {
            pos = (pos + 1) & mask;
            let cell = index[pos].load(Ordering::Relaxed);
            if cell == EMPTY {
                break;
            }
            let ideal = slot_hash(cell - 1) & mask;
            // The cell may move back only if its home is not inside (hole, pos]
            if (pos.wrapping_sub(ideal) & mask) >= (pos.wrapping_sub(hole) & mask) {
                index[hole].store(cell, Ordering::Relaxed);
                hole = pos;
            }
        }
        index[hole].store(EMPTY, Ordering::Relaxed);
    }
}

/// Exclusive hold on the table structure
pub struct TableWriter<'a> {
    table: &'a StatsTable,
    _guard: WriteGuard<'a>,
}

impl<'a> TableWriter<'a> {
    pub fn table(&self) -> &'a StatsTable {
        self.table
    }

    /// Handles of every live entry, in slot order
    pub fn handles(&self) -> Vec<EntryHandle> {
        self.table
            .slots()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_live())
            .map(|(i, slot)| EntryHandle {
                slot: i as u32,
                generation: slot.generation(),
            })
            .collect()
    }

    pub fn key_of(&self, handle: EntryHandle) -> Option<EntryKey> {
        let slot = self.table.slots().get(handle.slot as usize)?;
        if !slot.is_live() || slot.generation() != handle.generation {
            return None;
        }
        // SAFETY: exclusive table lock held
        Some(unsafe { *slot.key_unchecked() })
    }

    pub fn lock_entry(&self, handle: EntryHandle) -> TableResult<EntryGuard<'a>> {
        self.table.lock_entry(handle)
    }

    /// Frees the entry behind `handle` and its text span
    pub fn remove(&self, handle: EntryHandle) -> bool {
        let Some(key) = self.key_of(handle) else {
            return false;
        };
        let table = self.table;
        let slot = &table.slots()[handle.slot as usize];
        let shared = table.region.shared();

        table.unlink(handle.slot);
        let spans = slot.release();
        slot.next_free.store(shared.free_head.load(Ordering::Relaxed), Ordering::Relaxed);
        shared.free_head.store(handle.slot, Ordering::Relaxed);

        if let Some(bucket) = table.region.buckets().get(key.bucket_id as usize) {
            let _guard = shared.mutex.lock();
            let count = bucket.entry_count.load(Ordering::Relaxed);
            bucket.entry_count.store(count.saturating_sub(1), Ordering::Relaxed);
        }
        let live = shared.live_entries.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        gauge!("statmon_live_entries", live as f64);

        for text in &spans {
            table.text.release(text);
        }
        true
    }

    /// Removes every entry whose key matches, returns how many went
    pub fn remove_where(&self, mut predicate: impl FnMut(&EntryKey) -> bool) -> usize {
        let mut removed = 0;
        for handle in self.handles() {
            if let Some(key) = self.key_of(handle) {
                if predicate(&key) && self.remove(handle) {
                    removed += 1;
                }
            }
        }
        removed
    }
}

/// Lazy scan over live entries, see [`StatsTable::iter`]
pub struct TableScan<'a> {
    table: &'a StatsTable,
    _guard: Option<ReadGuard<'a>>,
    next: usize,
}

impl Iterator for TableScan<'_> {
    type Item = EntryHandle;

    fn next(&mut self) -> Option<EntryHandle> {
        let slots = self.table.slots();
        while self.next < slots.len() {
            let i = self.next;
            self.next += 1;
            if slots[i].is_live() {
                return Some(EntryHandle {
                    slot: i as u32,
                    generation: slots[i].generation(),
                });
            }
        }
        None
    }
}
