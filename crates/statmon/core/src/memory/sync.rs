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

//! Locks that live inside the shared region
//!
//! Both locks are a single `AtomicU32` whose all-zero state means unlocked,
//! so a freshly zeroed mapping needs no further initialization. They only use
//! the word itself, never an address-keyed parking table, which keeps them
//! valid when the same memory is mapped at different addresses in different
//! processes.

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

/// Busy-wait iterations before a waiter starts yielding its time slice
const SPINS_BEFORE_YIELD: u32 = 64;

#[inline]
pub(crate) fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

/// Low-level mutual exclusion lock for short critical sections
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(0) }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        let mut spins = 0;
        loop {
            if self.state.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                return SpinGuard { lock: self };
            }
            while self.state.load(Ordering::Relaxed) != 0 {
                backoff(&mut spins);
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.state.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed).ok().map(|_| SpinGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

const WRITER: u32 = 1 << 31;
const WRITER_WAITING: u32 = 1 << 30;
const READER_MASK: u32 = WRITER_WAITING - 1;

/// Reader-writer lock guarding structural changes to the statistics table
///
/// A waiting writer sets `WRITER_WAITING`, which stops new readers from
/// entering until the writer has acquired and released the lock.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RwSpinLock {
    state: AtomicU32,
}

impl RwSpinLock {
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(0) }
    }

    pub fn read(&self) -> ReadGuard<'_> {
        let mut spins = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | WRITER_WAITING) == 0 && state & READER_MASK < READER_MASK {
                if self.state.compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                    return ReadGuard { lock: self };
                }
                continue;
            }
            backoff(&mut spins);
        }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        let mut spins = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | READER_MASK) == 0 {
                // Clears our own (or a peer's) waiting bit, peers set it again on their next pass
                if self.state.compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                    return WriteGuard { lock: self };
                }
                continue;
            }
            if state & WRITER_WAITING == 0 {
                self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            backoff(&mut spins);
        }
    }

    pub fn readers(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READER_MASK
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

pub struct ReadGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_spinlock_excludes() {
        let lock = SpinLock::new();
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spinlock_counts_under_contention() {
        struct Shared {
            lock: SpinLock,
            value: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            value: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let _guard = shared.lock.lock();
                        unsafe { *shared.value.get() += 1 };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *shared.value.get() }, 80_000);
    }

    #[test]
    fn test_rwlock_allows_many_readers() {
        let lock = RwSpinLock::new();
        let a = lock.read();
        let b = lock.read();
        assert_eq!(lock.readers(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.readers(), 0);

        let w = lock.write();
        assert!(lock.is_write_locked());
        drop(w);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_rwlock_writer_is_exclusive() {
        let lock = Arc::new(RwSpinLock::new());
        let inside = Arc::new(AtomicU64::new(0));
        let violations = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let violations = Arc::clone(&violations);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        if i % 3 == 0 {
                            let _w = lock.write();
                            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            inside.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let _r = lock.read();
                            assert!(!lock.is_write_locked());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }
}
