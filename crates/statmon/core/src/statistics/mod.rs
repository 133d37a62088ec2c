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

/// Value types aggregated per statistics entry
///
/// Everything that is stored inside a shared entry slot is `#[repr(C)]`,
/// `Copy` and valid when zeroed. Snapshot types are the owned counterparts
/// handed to the reporting layer.
pub mod counters; // Per-entry counters and metadata
pub mod fixed_str; // Inline bounded strings
pub mod histogram; // Response time buckets
pub mod key; // Composite entry key
pub mod snapshot; // Owned entry copies for reporting

// Re-export main components for easier access
pub use counters::{
    APPLICATION_NAME_LEN, Blocks, COMMENTS_LEN, CallTime, Calls, CmdType, Counters, ERROR_MESSAGE_LEN, ErrorInfo, JitInfo, MAX_RESPONSE_BUCKET, PLAN_TEXT_LEN, PlanInfo, QueryInfo, QueryState, REL_LEN, REL_LST, SQLCODE_LEN, SysInfo,
    WalUsage,
};
pub use fixed_str::{FixedStr, truncate_utf8};
pub use histogram::{ResponseHistogram, ValueRange};
pub use key::{EntryKey, KeyFields, application_id, client_ip_key};
pub use snapshot::{EntrySnapshot, ErrorSummary, TimingSummary};
