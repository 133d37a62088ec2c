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

//! StatMon Core Library
//!
//! Per-query execution statistics aggregated in one shared memory region that
//! many worker processes map at once. Statistics are kept per composite key in
//! a fixed-capacity hash table, scoped to a ring of rotating time buckets, with
//! the query text stored out of line in per-bucket segments.

pub mod bucket;
pub mod config;
pub mod memory;
pub mod monitor;
pub mod statistics;
pub mod table;
pub mod text;

// Re-export main components for easy access
pub use bucket::{BucketInfo, BucketManager, Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MonitorConfig, OverflowTarget, TrackLevel};
pub use memory::{RegionError, SharedRegion, required_shared_memory};
pub use monitor::{ErrorReport, ExecutionStats, MonitorError, MonitorResult, MonitorStats, PlanStats, StatMonitor, StatementEvent, StoreKind};
pub use statistics::{CmdType, EntryKey, EntrySnapshot, KeyFields, QueryState};
pub use table::{EntryHandle, StatsTable, TableError};
pub use text::{QueryTextStore, TextHandle, TextStoreError};
