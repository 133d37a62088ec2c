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

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use metrics::counter;
use tracing::{debug, warn};

use super::overflow::OverflowSink;
use super::{TextHandle, TextLocation, TextResult, TextStoreError};
use crate::config::{MonitorConfig, OverflowTarget};
use crate::memory::{BucketState, SharedRegion, align_to};
use crate::statistics::truncate_utf8;

/// query_id (u64) | len (u32) | crc32 (u32), little-endian
pub const RECORD_HEADER_LEN: usize = 16;

const RECORD_ALIGN: usize = 8;

fn record_size(text_len: usize) -> usize {
    align_to(RECORD_HEADER_LEN + text_len, RECORD_ALIGN)
}

fn encode_header(query_id: u64, text: &[u8]) -> [u8; RECORD_HEADER_LEN] {
    let mut header = [0u8; RECORD_HEADER_LEN];
    LittleEndian::write_u64(&mut header[0..8], query_id);
    LittleEndian::write_u32(&mut header[8..12], text.len() as u32);
    LittleEndian::write_u32(&mut header[12..16], crc32fast::hash(text));
    header
}

fn decode_record(record: &[u8], expected_len: usize) -> TextResult<String> {
    if record.len() < RECORD_HEADER_LEN {
        return Err(TextStoreError::Corrupted(format!("record of {} bytes is shorter than its header", record.len())));
    }
    let len = LittleEndian::read_u32(&record[8..12]) as usize;
    let crc = LittleEndian::read_u32(&record[12..16]);
    if len != expected_len || RECORD_HEADER_LEN + len > record.len() {
        return Err(TextStoreError::Corrupted(format!("length {} does not match handle length {}", len, expected_len)));
    }

    let text = &record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len];
    if crc32fast::hash(text) != crc {
        return Err(TextStoreError::Corrupted("checksum mismatch".to_string()));
    }
    String::from_utf8(text.to_vec()).map_err(|e| TextStoreError::Corrupted(e.to_string()))
}

/// Process-local view of the shared query text buffer
pub struct QueryTextStore {
    region: Arc<SharedRegion>,
    query_max_len: usize,
    overflow: Option<OverflowSink>,
}

impl QueryTextStore {
    pub fn new(region: Arc<SharedRegion>, config: &MonitorConfig) -> TextResult<Self> {
        let overflow = match config.overflow_target {
            OverflowTarget::None => None,
            OverflowTarget::Disk => Some(OverflowSink::new(&config.overflow_dir)?),
        };
        Ok(Self {
            region,
            query_max_len: config.query_max_len,
            overflow,
        })
    }

    fn segment_size(&self) -> usize {
        self.region.layout().segment_size
    }

    fn bucket_state(&self, bucket: u32) -> TextResult<&BucketState> {
        self.region.buckets().get(bucket as usize).ok_or_else(|| TextStoreError::Corrupted(format!("bucket {} out of range", bucket)))
    }

    fn segment_ptr(&self, bucket: u32, offset: usize) -> *mut u8 {
        // SAFETY: callers keep `bucket` below the bucket count and `offset` inside the segment
        unsafe { self.region.text_base().add(bucket as usize * self.segment_size() + offset) }
    }

    /// Copies `text` into the segment of `bucket`
    ///
    /// Text longer than the configured maximum is cut at a character boundary
    /// first. When the segment is full the text goes to the overflow sink if
    /// one is configured, otherwise the save fails with `BufferFull`.
    pub fn save(&self, bucket: u64, query_id: u64, text: &str) -> TextResult<TextHandle> {
        let bucket = bucket as u32;
        let state = self.bucket_state(bucket)?;
        let text = truncate_utf8(text, self.query_max_len).as_bytes();
        let needed = record_size(text.len());
        let shared = self.region.shared();

        let reserved = {
            let _guard = shared.mutex.lock();
            let used = state.text_used.load(Ordering::Relaxed) as usize;
            if used + needed <= self.segment_size() {
                state.text_used.store((used + needed) as u64, Ordering::Relaxed);
                state.text_live.fetch_add(needed as u64, Ordering::Relaxed);
                shared.n_writers.fetch_add(1, Ordering::Relaxed);
                Some((used, state.text_epoch.load(Ordering::Relaxed)))
            } else {
                None
            }
        };

        let Some((offset, epoch)) = reserved else {
            return self.spill(bucket, query_id, text, needed);
        };

        let header = encode_header(query_id, text);
        // SAFETY: [offset, offset + needed) was reserved above and lies inside the segment
        unsafe {
            let dst = self.segment_ptr(bucket, offset);
            ptr::copy_nonoverlapping(header.as_ptr(), dst, RECORD_HEADER_LEN);
            ptr::copy_nonoverlapping(text.as_ptr(), dst.add(RECORD_HEADER_LEN), text.len());
        }

        {
            let _guard = shared.mutex.lock();
            shared.n_writers.fetch_sub(1, Ordering::Relaxed);
        }

        Ok(TextHandle::shared(bucket, offset as u64, text.len() as u32, epoch))
    }

    fn spill(&self, bucket: u32, query_id: u64, text: &[u8], needed: usize) -> TextResult<TextHandle> {
        counter!("statmon_text_overflow", 1);
        let Some(sink) = &self.overflow else {
            let state = self.bucket_state(bucket)?;
            let available = self.segment_size().saturating_sub(state.text_used() as usize);
            return Err(TextStoreError::BufferFull { needed, available });
        };

        let state = self.bucket_state(bucket)?;
        let shared = self.region.shared();
        let (offset, epoch) = {
            let _guard = shared.mutex.lock();
            let offset = state.overflow_used.fetch_add(needed as u64, Ordering::Relaxed);
            state.overflow_live.fetch_add(needed as u64, Ordering::Relaxed);
            shared.n_writers.fetch_add(1, Ordering::Relaxed);
            (offset, state.overflow_epoch.load(Ordering::Relaxed))
        };

        let mut record = Vec::with_capacity(needed);
        record.extend_from_slice(&encode_header(query_id, text));
        record.extend_from_slice(text);
        record.resize(needed, 0);

        let written = sink.write_at(bucket, offset, &record);
        {
            let _guard = shared.mutex.lock();
            shared.n_writers.fetch_sub(1, Ordering::Relaxed);
        }

        if let Err(e) = written {
            warn!(bucket, query_id, error = %e, "failed to write query text to overflow file");
            self.release_disk(state, needed, epoch);
            return Err(e);
        }
        debug!(bucket, query_id, offset, "query text spilled to disk");
        Ok(TextHandle::disk(bucket, offset, text.len() as u32, epoch))
    }

    /// Resolves a handle back to its text
    ///
    /// Fails with `NotFound` when the segment the handle points into has been
    /// reset since the handle was issued.
    pub fn read(&self, handle: &TextHandle) -> TextResult<String> {
        match handle.location() {
            TextLocation::None => Err(TextStoreError::NotFound),
            TextLocation::Shared => self.read_shared(handle),
            TextLocation::Disk => self.read_disk(handle),
        }
    }

    fn read_shared(&self, handle: &TextHandle) -> TextResult<String> {
        let state = self.bucket_state(handle.bucket())?;
        if state.text_epoch.load(Ordering::Acquire) != handle.epoch() {
            return Err(TextStoreError::NotFound);
        }

        let size = record_size(handle.len());
        let offset = handle.offset() as usize;
        if offset + size > self.segment_size() {
            return Err(TextStoreError::Corrupted(format!("record at {} overruns the segment", offset)));
        }

        let mut record = vec![0u8; size];
        // SAFETY: bounds checked against the segment above
        unsafe { ptr::copy_nonoverlapping(self.segment_ptr(handle.bucket(), offset), record.as_mut_ptr(), size) };

        // The segment may have been recycled while copying
        if state.text_epoch.load(Ordering::Acquire) != handle.epoch() {
            return Err(TextStoreError::NotFound);
        }
        decode_record(&record, handle.len())
    }

    fn read_disk(&self, handle: &TextHandle) -> TextResult<String> {
        let sink = self.overflow.as_ref().ok_or(TextStoreError::NotFound)?;
        let state = self.bucket_state(handle.bucket())?;
        if state.overflow_epoch.load(Ordering::Acquire) != handle.epoch() {
            return Err(TextStoreError::NotFound);
        }

        let record = sink.read_at(handle.bucket(), handle.offset(), record_size(handle.len()))?;
        if state.overflow_epoch.load(Ordering::Acquire) != handle.epoch() {
            return Err(TextStoreError::NotFound);
        }
        decode_record(&record, handle.len())
    }

    /// Returns the span of a deleted entry
    ///
    /// A segment whose live byte count drops to zero is reset, which is the
    /// only compaction the buffer ever gets outside bucket recycling.
    pub fn release(&self, handle: &TextHandle) {
        let Ok(state) = self.bucket_state(handle.bucket()) else {
            return;
        };
        let size = record_size(handle.len()) as u64;

        match handle.location() {
            TextLocation::None => {}
            TextLocation::Shared => {
                let _guard = self.region.shared().mutex.lock();
                if state.text_epoch.load(Ordering::Relaxed) != handle.epoch() {
                    return;
                }
                let live = state.text_live.load(Ordering::Relaxed).saturating_sub(size);
                state.text_live.store(live, Ordering::Relaxed);
                if live == 0 {
                    state.reset_text();
                }
            }
            TextLocation::Disk => self.release_disk(state, size as usize, handle.epoch()),
        }
    }

    fn release_disk(&self, state: &BucketState, size: usize, epoch: u64) {
        let _guard = self.region.shared().mutex.lock();
        if state.overflow_epoch.load(Ordering::Relaxed) != epoch {
            return;
        }
        let live = state.overflow_live.load(Ordering::Relaxed).saturating_sub(size as u64);
        state.overflow_live.store(live, Ordering::Relaxed);
        if live == 0 {
            state.reset_overflow();
        }
    }

    /// Invalidates every handle into `bucket`, shared and on disk
    ///
    /// Waits for in-flight copies to finish, then resets both epochs and
    /// empties the spill file before any new reservation can be handed out,
    /// so text saved after the reset is never lost to it.
    pub fn reset_bucket(&self, bucket: u64) {
        let Ok(state) = self.bucket_state(bucket as u32) else {
            return;
        };
        let _guard = self.region.shared().lock_quiescent();
        state.reset_text();
        state.reset_overflow();
        if let Some(sink) = &self.overflow {
            if let Err(e) = sink.truncate(bucket as u32) {
                warn!(bucket, error = %e, "failed to truncate overflow file");
            }
        }
    }

    /// Bytes currently allocated in the segment of `bucket`
    pub fn used(&self, bucket: u64) -> usize {
        self.bucket_state(bucket as u32).map(|s| s.text_used() as usize).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.segment_size()
    }

    pub fn query_max_len(&self) -> usize {
        self.query_max_len
    }
}
