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

//! Monitor configuration
//!
//! The values here are read once when the shared region is sized and created.
//! Every attaching process must present a configuration whose layout-relevant
//! fields match the creator's, see [`crate::memory::RegionLayout`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::statistics::MAX_RESPONSE_BUCKET;

/// Upper bound on the number of time buckets a region can be created with
pub const MAX_BUCKETS: usize = 1024;

/// Smallest text segment a single bucket may own
pub const MIN_SEGMENT_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where query text goes when its bucket segment is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowTarget {
    /// Drop the text, the entry is still recorded
    None,
    /// Spill to a per-bucket file under `overflow_dir`
    Disk,
}

/// Which statements are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackLevel {
    None,
    Top,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum number of live entries across all buckets
    pub max_entries: usize,
    /// Query text longer than this is truncated before it is stored
    pub query_max_len: usize,
    /// Number of time buckets in the ring
    pub max_buckets: usize,
    /// Length of one bucket in seconds
    pub bucket_time_secs: u64,
    /// Lower edge of the first regular histogram bucket, in milliseconds
    pub histogram_min_ms: f64,
    /// Lower edge of the overflow histogram bucket, in milliseconds
    pub histogram_max_ms: f64,
    /// Number of log-spaced buckets between min and max
    pub histogram_buckets: usize,
    /// Total size of the shared query text buffer in bytes
    pub query_shared_buffer: usize,
    pub overflow_target: OverflowTarget,
    pub overflow_dir: PathBuf,
    pub track: TrackLevel,
    pub track_utility: bool,
    pub track_planning: bool,
    pub normalized_query: bool,
    pub enable_query_plan: bool,
    pub extract_comments: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_entries: 5000,
            query_max_len: 2048,
            max_buckets: 10,
            bucket_time_secs: 60,
            histogram_min_ms: 1.0,
            histogram_max_ms: 100_000.0,
            histogram_buckets: 20,
            query_shared_buffer: 20 * 1024 * 1024, // 20 MB
            overflow_target: OverflowTarget::None,
            overflow_dir: std::env::temp_dir().join("statmon"),
            track: TrackLevel::Top,
            track_utility: true,
            track_planning: false,
            normalized_query: false,
            enable_query_plan: false,
            extract_comments: false,
        }
    }
}

impl MonitorConfig {
    /// Loads a configuration from a JSON file, missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let raw = fs::read_to_string(path)?;
        let config: MonitorConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_range("max_entries", self.max_entries, 1, 1_000_000)?;
        check_range("query_max_len", self.query_max_len, 64, 1_048_576)?;
        check_range("max_buckets", self.max_buckets, 1, MAX_BUCKETS)?;
        check_range("bucket_time_secs", self.bucket_time_secs as usize, 1, i32::MAX as usize)?;
        // Two extra slots hold the underflow and overflow ranges
        check_range("histogram_buckets", self.histogram_buckets, 2, MAX_RESPONSE_BUCKET - 2)?;

        if !(self.histogram_min_ms >= 0.0) {
            return Err(invalid("histogram_min_ms", format!("must be non-negative, got {}", self.histogram_min_ms)));
        }
        if !(self.histogram_max_ms > self.histogram_min_ms) {
            return Err(invalid("histogram_max_ms", format!("must exceed histogram_min_ms ({} <= {})", self.histogram_max_ms, self.histogram_min_ms)));
        }

        let per_bucket = self.query_shared_buffer / self.max_buckets;
        if per_bucket < MIN_SEGMENT_SIZE {
            return Err(invalid(
                "query_shared_buffer",
                format!("{} bytes over {} buckets leaves {} bytes per bucket, need at least {}", self.query_shared_buffer, self.max_buckets, per_bucket, MIN_SEGMENT_SIZE),
            ));
        }

        if self.overflow_target == OverflowTarget::Disk && self.overflow_dir.as_os_str().is_empty() {
            return Err(invalid("overflow_dir", "required when overflow_target is disk".to_string()));
        }

        Ok(())
    }

    /// Bytes of text buffer owned by each bucket
    pub fn segment_size(&self) -> usize {
        // Records are 8-byte aligned inside a segment
        (self.query_shared_buffer / self.max_buckets) & !7
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn check_range(field: &'static str, value: usize, min: usize, max: usize) -> ConfigResult<()> {
    if value < min || value > max {
        return Err(invalid(field, format!("{} is outside {}..={}", value, min, max)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.segment_size(), 20 * 1024 * 1024 / 10 & !7);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let config = MonitorConfig { max_entries: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "max_entries", .. })));

        let config = MonitorConfig { histogram_buckets: 49, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "histogram_buckets", .. })));

        let config = MonitorConfig {
            histogram_min_ms: 10.0,
            histogram_max_ms: 10.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "histogram_max_ms", .. })));
    }

    #[test]
    fn test_rejects_tiny_text_segments() {
        let config = MonitorConfig {
            max_buckets: 100,
            query_shared_buffer: 50 * 1024,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "query_shared_buffer", .. })));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_entries": 42, "track": "all", "overflow_target": "disk"}}"#).unwrap();
        file.flush().unwrap();

        let config = MonitorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_entries, 42);
        assert_eq!(config.track, TrackLevel::All);
        assert_eq!(config.overflow_target, OverflowTarget::Disk);
        assert_eq!(config.max_buckets, 10);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        file.flush().unwrap();

        assert!(matches!(MonitorConfig::from_file(file.path()), Err(ConfigError::Parse(_))));
    }
}
