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

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::layout::{LayoutParams, RegionLayout};
use super::lib::{align_to, get_page_size};
use super::shared_state::{BucketState, SharedState};
use crate::table::EntrySlot;

const REGION_MAGIC: u64 = 0x5354_4154_4d4f_4e31; // "STATMON1"
const REGION_VERSION: u32 = 1;

const STATE_UNINITIALIZED: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

/// Errors raised while creating or attaching a region
///
/// These are the only fatal errors of the subsystem, everything after a
/// successful attach degrades instead of failing.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("mmap of {size} bytes failed: {source}")]
    MappingFailed { size: usize, source: io::Error },

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Region is not initialized")]
    NotInitialized,

    #[error("Bad region header: {0}")]
    BadHeader(String),

    #[error("Layout mismatch: region has {found:?}, configuration needs {expected:?}")]
    LayoutMismatch { expected: LayoutParams, found: LayoutParams },
}

pub type RegionResult<T> = std::result::Result<T, RegionError>;

/// First bytes of every region
#[repr(C)]
#[derive(Debug)]
pub struct RegionHeader {
    magic: u64,
    version: u32,
    state: AtomicU32,
    attached: AtomicU32,
    _reserved: u32,
    params: LayoutParams,
}

impl RegionHeader {
    pub fn attached(&self) -> u32 {
        self.attached.load(Ordering::Relaxed)
    }

    pub fn params(&self) -> LayoutParams {
        self.params
    }
}

enum Backing {
    /// `MAP_SHARED | MAP_ANONYMOUS`, inherited by forked children
    Anonymous { mapped_len: usize },
    /// File mapping that unrelated processes open by path
    File { _map: MmapMut, path: PathBuf },
}

/// A single mapping of the shared statistics region
///
/// The mapping is owned by this process only, the memory behind it is owned by
/// the process group and outlives any single attacher. Dropping the last
/// process-local handle unmaps; it never clears the shared contents.
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    layout: RegionLayout,
    backing: Backing,
}

// SAFETY: all shared mutable state inside the mapping is accessed through
// atomics or while holding one of the in-region locks.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps a fresh zero-filled anonymous region for `layout`
    pub fn create_anonymous(layout: RegionLayout) -> RegionResult<Self> {
        let size = check_size(layout.total_size)?;
        let mapped_len = align_to(size, get_page_size());

        let ptr = unsafe { libc::mmap(ptr::null_mut(), mapped_len, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED | libc::MAP_ANONYMOUS, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(RegionError::MappingFailed {
                size: mapped_len,
                source: io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| RegionError::BadHeader("mmap returned null".to_string()))?;

        let region = Self {
            base,
            len: size,
            layout,
            backing: Backing::Anonymous { mapped_len },
        };
        region.write_header();
        debug!(size, "created anonymous shared region");
        Ok(region)
    }

    /// Creates (or truncates) `path` and maps it as a fresh region for `layout`
    pub fn create_file<P: AsRef<Path>>(path: P, layout: RegionLayout) -> RegionResult<Self> {
        let size = check_size(layout.total_size)?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        // Extending a truncated file yields zero-filled pages
        file.set_len(size as u64)?;

        let region = Self::map_file(&file, path, size, layout)?;
        region.write_header();
        info!(path = %path.display(), size, "created file-backed shared region");
        Ok(region)
    }

    /// Maps an existing region file, checking it was created for `layout`
    pub fn open_file<P: AsRef<Path>>(path: P, layout: RegionLayout) -> RegionResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < layout.total_size {
            return Err(RegionError::InvalidSize(format!("{} is {} bytes, layout needs {}", path.display(), file_len, layout.total_size)));
        }

        let region = Self::map_file(&file, path, layout.total_size, layout)?;
        region.verify()?;
        debug!(path = %path.display(), "attached file-backed shared region");
        Ok(region)
    }

    fn map_file(file: &File, path: &Path, size: usize, layout: RegionLayout) -> RegionResult<Self> {
        let mut map = unsafe { MmapMut::map_mut(file) }.map_err(|source| RegionError::MappingFailed { size, source })?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| RegionError::BadHeader("mmap returned null".to_string()))?;

        Ok(Self {
            base,
            len: size,
            layout,
            backing: Backing::File { _map: map, path: path.to_path_buf() },
        })
    }

    fn write_header(&self) {
        // SAFETY: the mapping is fresh and not yet published to other processes
        unsafe {
            let header = self.base.as_ptr() as *mut RegionHeader;
            (*header).magic = REGION_MAGIC;
            (*header).version = REGION_VERSION;
            (*header).params = self.layout.params();
            (*header).state.store(STATE_INITIALIZING, Ordering::Release);
        }
    }

    /// Publishes the region to attachers once every sub-region is initialized
    pub(crate) fn mark_ready(&self) {
        self.header().state.store(STATE_READY, Ordering::Release);
    }

    /// Checks the initialization flag and the recorded layout
    pub fn verify(&self) -> RegionResult<()> {
        let header = self.header();
        match header.state.load(Ordering::Acquire) {
            STATE_READY => {}
            STATE_UNINITIALIZED | STATE_INITIALIZING => return Err(RegionError::NotInitialized),
            other => return Err(RegionError::BadHeader(format!("unknown state {}", other))),
        }
        if header.magic != REGION_MAGIC {
            return Err(RegionError::BadHeader(format!("magic {:#x}", header.magic)));
        }
        if header.version != REGION_VERSION {
            return Err(RegionError::BadHeader(format!("version {}", header.version)));
        }

        let expected = self.layout.params();
        if header.params != expected {
            warn!(?expected, found = ?header.params, "refusing to attach to region with a different layout");
            return Err(RegionError::LayoutMismatch { expected, found: header.params });
        }
        Ok(())
    }

    pub(crate) fn register_attach(&self) -> u32 {
        self.header().attached.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn register_detach(&self) {
        self.header().attached.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn header(&self) -> &RegionHeader {
        unsafe { &*(self.base.as_ptr() as *const RegionHeader) }
    }

    pub fn shared(&self) -> &SharedState {
        unsafe { &*(self.base.as_ptr().add(self.layout.shared_offset) as *const SharedState) }
    }

    pub fn buckets(&self) -> &[BucketState] {
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(self.layout.buckets_offset) as *const BucketState, self.layout.bucket_count) }
    }

    pub(crate) fn index(&self) -> &[AtomicU32] {
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(self.layout.index_offset) as *const AtomicU32, self.layout.index_len) }
    }

    pub(crate) fn slots(&self) -> &[EntrySlot] {
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(self.layout.slots_offset) as *const EntrySlot, self.layout.max_entries) }
    }

    /// Start of the query text sub-region, `text_capacity()` bytes long
    pub(crate) fn text_base(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.layout.text_offset) }
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Anonymous { .. } => None,
            Backing::File { path, .. } => Some(path),
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Anonymous { mapped_len } = self.backing {
            let result = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, mapped_len) };
            if result != 0 {
                warn!(error = %io::Error::last_os_error(), "failed to unmap shared region");
            }
        }
        // File mappings are unmapped by MmapMut
    }
}

fn check_size(size: usize) -> RegionResult<usize> {
    if size == 0 {
        return Err(RegionError::InvalidSize("region size is zero".to_string()));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use tempfile::tempdir;

    fn small_layout() -> RegionLayout {
        RegionLayout::for_config(&MonitorConfig {
            max_entries: 16,
            max_buckets: 2,
            query_shared_buffer: 8 * 1024,
            ..Default::default()
        })
    }

    #[test]
    fn test_anonymous_region_starts_uninitialized_for_attachers() {
        let region = SharedRegion::create_anonymous(small_layout()).unwrap();
        assert_eq!(region.len(), small_layout().total_size);
        assert!(matches!(region.verify(), Err(RegionError::NotInitialized)));

        region.mark_ready();
        assert!(region.verify().is_ok());
        assert_eq!(region.shared().live_entries(), 0);
        assert_eq!(region.buckets().len(), 2);
        assert_eq!(region.slots().len(), 16);
    }

    #[test]
    fn test_file_region_is_visible_through_second_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.region");

        let creator = SharedRegion::create_file(&path, small_layout()).unwrap();
        assert!(matches!(SharedRegion::open_file(&path, small_layout()), Err(RegionError::NotInitialized)));
        creator.mark_ready();

        let attacher = SharedRegion::open_file(&path, small_layout()).unwrap();
        creator.shared().current_bucket.store(1, Ordering::Release);
        assert_eq!(attacher.shared().current_bucket(), 1);
        assert_eq!(attacher.path(), Some(path.as_path()));
    }

    #[test]
    fn test_attach_rejects_different_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.region");

        let creator = SharedRegion::create_file(&path, small_layout()).unwrap();
        creator.mark_ready();

        let other = RegionLayout::for_config(&MonitorConfig {
            max_entries: 8,
            max_buckets: 2,
            query_shared_buffer: 8 * 1024,
            ..Default::default()
        });
        assert!(SharedRegion::open_file(&path, other).is_err());
    }

    #[test]
    fn test_attach_counting() {
        let region = SharedRegion::create_anonymous(small_layout()).unwrap();
        assert_eq!(region.register_attach(), 1);
        assert_eq!(region.register_attach(), 2);
        region.register_detach();
        assert_eq!(region.header().attached(), 1);
    }
}
