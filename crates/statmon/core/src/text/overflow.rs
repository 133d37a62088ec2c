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

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use super::{TextResult, TextStoreError};

/// Spill files for query text that did not fit its bucket segment
///
/// Offsets inside each file are reserved in shared memory, so any number of
/// processes can write the same file with positional I/O. Descriptors are
/// cached per process.
pub struct OverflowSink {
    dir: PathBuf,
    files: Mutex<HashMap<u32, File>>,
}

impl OverflowSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> TextResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, files: Mutex::new(HashMap::new()) })
    }

    pub fn path_for(&self, bucket: u32) -> PathBuf {
        self.dir.join(format!("bucket_{}.qtext", bucket))
    }

    fn with_file<R>(&self, bucket: u32, op: impl FnOnce(&File) -> std::io::Result<R>) -> TextResult<R> {
        let mut files = self.files.lock();
        if !files.contains_key(&bucket) {
            let path = self.path_for(bucket);
            let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
            debug!(bucket, path = %path.display(), "opened overflow file");
            files.insert(bucket, file);
        }
        match files.get(&bucket) {
            Some(file) => Ok(op(file)?),
            None => Err(TextStoreError::NotFound),
        }
    }

    pub fn write_at(&self, bucket: u32, offset: u64, data: &[u8]) -> TextResult<()> {
        self.with_file(bucket, |file| file.write_all_at(data, offset))
    }

    /// Reads `len` bytes at `offset`; a short file means the record is gone
    pub fn read_at(&self, bucket: u32, offset: u64, len: usize) -> TextResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match self.with_file(bucket, |file| file.read_exact_at(&mut buf, offset)) {
            Ok(()) => Ok(buf),
            Err(TextStoreError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TextStoreError::NotFound),
            Err(e) => Err(e),
        }
    }

    pub fn truncate(&self, bucket: u32) -> TextResult<()> {
        self.with_file(bucket, |file| file.set_len(0))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
