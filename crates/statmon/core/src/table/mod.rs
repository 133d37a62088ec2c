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

/// The shared statistics table
///
/// Lock order, outermost first: table lock, entry lock, header mutex.
/// Nothing takes the table lock while holding an entry lock.
pub mod entry; // Entry slots, handles and guards
pub mod eviction; // Usage-decay dealloc pass
pub mod hash_table; // Index, free list, insert/delete/scan

use thiserror::Error;

pub use entry::{EntryBody, EntryGuard, EntryHandle, EntrySlot};
pub use eviction::{ASSUMED_MEDIAN_INIT, STICKY_DECREASE_FACTOR, USAGE_DEALLOC_PERCENT, USAGE_DECREASE_FACTOR, USAGE_EXEC, USAGE_INIT};
pub use hash_table::{EntryInit, StatsTable, TableScan, TableWriter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("Statistics table is full")]
    TableFull,
    #[error("Entry was removed or reused")]
    StaleEntry,
}

pub type TableResult<T> = std::result::Result<T, TableError>;
