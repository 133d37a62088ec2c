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

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::memory::SpinLock;
use crate::memory::sync::SpinGuard;
use crate::statistics::{Counters, EntryKey};
use crate::text::TextHandle;

pub(crate) const SLOT_FREE: u32 = 0;
pub(crate) const SLOT_LIVE: u32 = 1;

/// Mutable part of an entry, guarded by the entry's own lock
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntryBody {
    pub pgsm_query_id: u64, // fingerprint of the text as generated, not normalized
    pub encoding: i32,
    _reserved: u32,
    pub text: TextHandle,
    pub counters: Counters,
}

/// One fixed-size slot of the entry arena
///
/// Slots never move. The key is written only while the table lock is held
/// exclusively and the slot is being claimed; the body is touched only under
/// `mutex`. `generation` changes every time the slot is freed, which is what
/// makes an [`EntryHandle`] detect that its entry is gone.
#[repr(C)]
pub struct EntrySlot {
    pub(crate) mutex: SpinLock,
    pub(crate) state: AtomicU32,
    pub(crate) generation: AtomicU32,
    pub(crate) next_free: AtomicU32,
    pub(crate) hash: AtomicU64,
    key: UnsafeCell<EntryKey>,
    body: UnsafeCell<EntryBody>,
}

// SAFETY: `key` is only written under the exclusive table lock and `body`
// only under `mutex`.
unsafe impl Sync for EntrySlot {}

impl EntrySlot {
    pub(crate) fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_LIVE
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Caller holds the table lock in either mode
    pub(crate) unsafe fn key_unchecked(&self) -> &EntryKey {
        unsafe { &*self.key.get() }
    }

    /// Claims a free slot for `key`, caller holds the table lock exclusively
    pub(crate) fn claim(&self, key: &EntryKey, hash: u64, usage: f64) {
        let _guard = self.mutex.lock();
        // SAFETY: exclusive table lock plus the entry lock
        unsafe {
            *self.key.get() = *key;
            let body = &mut *self.body.get();
            *body = EntryBody::default();
            body.counters.calls.usage = usage;
        }
        self.hash.store(hash, Ordering::Relaxed);
        self.state.store(SLOT_LIVE, Ordering::Release);
    }

    /// Frees the slot and returns the text spans it held, query then parent
    pub(crate) fn release(&self) -> [TextHandle; 2] {
        let _guard = self.mutex.lock();
        // SAFETY: entry lock held
        let body = unsafe { &*self.body.get() };
        let spans = [body.text, body.counters.info.parent_text];
        self.state.store(SLOT_FREE, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        spans
    }

    pub(crate) fn lock(&self, handle: EntryHandle) -> Option<EntryGuard<'_>> {
        let guard = self.mutex.lock();
        if self.state.load(Ordering::Acquire) != SLOT_LIVE || self.generation.load(Ordering::Acquire) != handle.generation {
            return None;
        }
        Some(EntryGuard { slot: self, handle, _lock: guard })
    }
}

/// Process-independent reference to a live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    pub slot: u32,
    pub generation: u32,
}

/// Exclusive access to an entry's body, the entry lock is held until drop
pub struct EntryGuard<'a> {
    slot: &'a EntrySlot,
    handle: EntryHandle,
    _lock: SpinGuard<'a>,
}

impl EntryGuard<'_> {
    pub fn key(&self) -> &EntryKey {
        // SAFETY: the key cannot change while the slot is live and its lock is held
        unsafe { &*self.slot.key.get() }
    }

    pub fn handle(&self) -> EntryHandle {
        self.handle
    }
}

impl Deref for EntryGuard<'_> {
    type Target = EntryBody;

    fn deref(&self) -> &EntryBody {
        unsafe { &*self.slot.body.get() }
    }
}

impl DerefMut for EntryGuard<'_> {
    fn deref_mut(&mut self) -> &mut EntryBody {
        unsafe { &mut *self.slot.body.get() }
    }
}
