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

/// Out-of-line storage for query text
///
/// Each bucket owns one segment of the shared text buffer and allocates from
/// it with a bump pointer. Segments are reset as a whole, either when the
/// bucket is recycled or when the last record in them is released. Handles
/// carry the epoch of the segment they were issued from, so a handle that
/// outlives its segment resolves to `NotFound` instead of foreign bytes.
pub mod overflow; // Per-bucket spill files
pub mod store; // Shared segment allocator and record codec

use thiserror::Error;

pub use overflow::OverflowSink;
pub use store::{QueryTextStore, RECORD_HEADER_LEN};

#[derive(Debug, Error)]
pub enum TextStoreError {
    #[error("Query text not found")]
    NotFound,
    #[error("Text buffer full: need {needed} bytes, {available} available")]
    BufferFull { needed: usize, available: usize },
    #[error("Corrupted text record: {0}")]
    Corrupted(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TextResult<T> = std::result::Result<T, TextStoreError>;

/// Where the bytes behind a handle live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextLocation {
    None,
    Shared,
    Disk,
}

const LOCATION_NONE: u32 = 0;
const LOCATION_SHARED: u32 = 1;
const LOCATION_DISK: u32 = 2;

/// Position of one saved query text
///
/// Stored inline in the entry slot; the zeroed value is the empty handle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextHandle {
    offset: u64,
    epoch: u64,
    len: u32,
    bucket: u32,
    location: u32,
    _reserved: u32,
}

impl TextHandle {
    pub const EMPTY: TextHandle = TextHandle {
        offset: 0,
        epoch: 0,
        len: 0,
        bucket: 0,
        location: LOCATION_NONE,
        _reserved: 0,
    };

    pub(crate) fn shared(bucket: u32, offset: u64, len: u32, epoch: u64) -> Self {
        Self {
            offset,
            epoch,
            len,
            bucket,
            location: LOCATION_SHARED,
            _reserved: 0,
        }
    }

    pub(crate) fn disk(bucket: u32, offset: u64, len: u32, epoch: u64) -> Self {
        Self {
            offset,
            epoch,
            len,
            bucket,
            location: LOCATION_DISK,
            _reserved: 0,
        }
    }

    pub fn location(&self) -> TextLocation {
        match self.location {
            LOCATION_SHARED => TextLocation::Shared,
            LOCATION_DISK => TextLocation::Disk,
            _ => TextLocation::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.location() == TextLocation::None
    }

    /// Length of the text in bytes, excluding the record header
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn bucket(&self) -> u32 {
        self.bucket
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
