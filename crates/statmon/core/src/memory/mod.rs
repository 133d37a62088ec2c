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

/// Shared memory management for the statistics store
///
/// This module provides the pieces every other subsystem is built on:
/// - The shared region itself, anonymous or file-backed, with create/attach
/// - The layout function that sizes and places every sub-region
/// - Locks that are valid inside memory mapped by many processes
/// - The process-group wide scalar state
pub mod layout; // Region sizing and sub-region placement
pub mod lib; // Alignment helpers
pub mod region; // Mapping, header, attach/detach
pub mod shared_state; // Cross-process scalar state
pub mod sync; // In-region spin locks

// Re-export main components for easier access
pub use layout::{LayoutParams, RegionLayout, required_shared_memory};
pub use lib::{align_to, is_power_of_two, next_power_of_two};
pub use region::{RegionError, RegionHeader, RegionResult, SharedRegion};
pub use shared_state::{BucketState, NO_SLOT, SharedState};
pub use sync::{RwSpinLock, SpinLock};
