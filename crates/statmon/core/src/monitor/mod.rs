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

/// Ingest and reporting facade
///
/// [`StatMonitor`] is the process-local handle every worker holds. Only its
/// constructors can fail; recording, scanning and resetting absorb every
/// capacity and consistency problem, log it and count it.
pub mod comments; // Comment extraction from query text
pub mod event; // Statement events handed in by the pipeline
pub mod ingest; // Merging events into entries

use std::path::Path;
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

pub use comments::extract_comments;
pub use event::{ErrorReport, ExecutionStats, PlanStats, StatementEvent, StoreKind};

use ingest::PreparedEvent;

use crate::bucket::{BucketInfo, BucketManager, Clock, SystemClock};
use crate::config::{ConfigError, MonitorConfig, TrackLevel};
use crate::memory::{RegionError, RegionLayout, SharedRegion};
use crate::statistics::{CmdType, EntrySnapshot, ResponseHistogram, ValueRange};
use crate::table::{EntryHandle, EntryInit, StatsTable, TableResult};
use crate::text::{QueryTextStore, TextHandle, TextResult, TextStoreError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Shared region error: {0}")]
    Region(#[from] RegionError),
    #[error("Text store error: {0}")]
    Text(#[from] TextStoreError),
}

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// Introspection counters of the shared state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub live_entries: u64,
    pub capacity: u64,
    pub current_bucket: u64,
    pub dealloc_passes: u64,
    pub rotations: u64,
    pub median_usage: f64,
    pub attached: u32,
    pub writers: i64,
    pub region_bytes: u64,
    pub buckets: Vec<BucketInfo>,
}

pub struct StatMonitor {
    config: MonitorConfig,
    region: Arc<SharedRegion>,
    table: Arc<StatsTable>,
    buckets: BucketManager,
    histogram: ResponseHistogram,
    clock: Arc<dyn Clock>,
}

impl StatMonitor {
    /// Creates a region for a process group forked from the caller
    pub fn create_anonymous(config: MonitorConfig) -> MonitorResult<Self> {
        Self::create_anonymous_with_clock(config, Arc::new(SystemClock))
    }

    pub fn create_anonymous_with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> MonitorResult<Self> {
        config.validate()?;
        let region = SharedRegion::create_anonymous(RegionLayout::for_config(&config))?;
        Self::initialize(config, Arc::new(region), clock)
    }

    /// Creates a region file at `path` that unrelated processes can attach to
    pub fn create_file<P: AsRef<Path>>(config: MonitorConfig, path: P) -> MonitorResult<Self> {
        Self::create_file_with_clock(config, path, Arc::new(SystemClock))
    }

    pub fn create_file_with_clock<P: AsRef<Path>>(config: MonitorConfig, path: P, clock: Arc<dyn Clock>) -> MonitorResult<Self> {
        config.validate()?;
        let region = SharedRegion::create_file(path, RegionLayout::for_config(&config))?;
        Self::initialize(config, Arc::new(region), clock)
    }

    /// Attaches to a region file created with the same configuration
    pub fn attach_file<P: AsRef<Path>>(config: MonitorConfig, path: P) -> MonitorResult<Self> {
        Self::attach_file_with_clock(config, path, Arc::new(SystemClock))
    }

    pub fn attach_file_with_clock<P: AsRef<Path>>(config: MonitorConfig, path: P, clock: Arc<dyn Clock>) -> MonitorResult<Self> {
        config.validate()?;
        let region = SharedRegion::open_file(path, RegionLayout::for_config(&config))?;
        Self::assemble(config, Arc::new(region), clock)
    }

    /// Another handle onto the same mapping, as a forked worker would hold
    pub fn attach(&self) -> MonitorResult<Self> {
        self.region.verify()?;
        Self::assemble(self.config.clone(), Arc::clone(&self.region), Arc::clone(&self.clock))
    }

    fn initialize(config: MonitorConfig, region: Arc<SharedRegion>, clock: Arc<dyn Clock>) -> MonitorResult<Self> {
        let monitor = Self::assemble(config, region, clock)?;
        monitor.table.initialize();
        monitor.buckets.initialize();
        monitor.region.mark_ready();
        info!(
            bytes = monitor.region.len(),
            max_entries = monitor.config.max_entries,
            buckets = monitor.config.max_buckets,
            "statistics region created"
        );
        Ok(monitor)
    }

    fn assemble(config: MonitorConfig, region: Arc<SharedRegion>, clock: Arc<dyn Clock>) -> MonitorResult<Self> {
        let text = Arc::new(QueryTextStore::new(Arc::clone(&region), &config)?);
        let table = Arc::new(StatsTable::new(Arc::clone(&region), text));
        let buckets = BucketManager::new(Arc::clone(&table), Arc::clone(&clock), config.bucket_time_secs);
        let histogram = ResponseHistogram::from_config(&config);
        let attached = region.register_attach();
        debug!(attached, "attached to statistics region");

        Ok(Self {
            config,
            region,
            table,
            buckets,
            histogram,
            clock,
        })
    }

    fn should_track(&self, event: &StatementEvent) -> bool {
        let level = match self.config.track {
            TrackLevel::None => false,
            TrackLevel::Top => event.key.top_level,
            TrackLevel::All => true,
        };
        if !level {
            return false;
        }
        if event.cmd_type == CmdType::Utility && !self.config.track_utility {
            return false;
        }
        event.kind != StoreKind::Plan || self.config.track_planning
    }

    /// Records one statement phase
    ///
    /// Never fails: a full table or text buffer, or an entry evicted while
    /// the event was being merged, drops the event (or just its text) and
    /// bumps a counter.
    pub fn record(&self, event: &StatementEvent) {
        if !self.should_track(event) {
            return;
        }

        let bucket = self.buckets.tick();
        let key = event.key.in_bucket(bucket);
        let init = match event.kind {
            StoreKind::Finished | StoreKind::Error => EntryInit::Regular,
            StoreKind::Parse | StoreKind::Plan | StoreKind::Exec => EntryInit::Sticky,
        };

        let (handle, created) = match self.table.find_or_insert_with(&key, init) {
            Ok(found) => found,
            Err(e) => {
                counter!("statmon_records_dropped", 1);
                debug!(query_id = key.query_id, bucket, error = %e, "statement not recorded");
                return;
            }
        };

        if created {
            self.store_text(bucket, event, handle);
        }

        let prepared = PreparedEvent::new(event, &self.config);
        match self.table.lock_entry(handle) {
            Ok(mut entry) => ingest::apply_event(&mut entry, &prepared, &self.config, &self.histogram),
            Err(e) => {
                counter!("statmon_stale_handles", 1);
                counter!("statmon_records_dropped", 1);
                debug!(query_id = key.query_id, bucket, error = %e, "entry vanished before merge");
            }
        }
    }

    fn store_text(&self, bucket: u64, event: &StatementEvent, handle: EntryHandle) {
        let text = match (&event.normalized_text, self.config.normalized_query) {
            (Some(normalized), true) => normalized.as_str(),
            _ => event.query_text.as_str(),
        };
        if !text.is_empty() {
            self.attach_text(bucket, event.key.query_id, text, |saved| self.table.set_text(handle, saved));
        }
        if let Some(parent) = event.parent_text.as_deref().filter(|t| !t.is_empty()) {
            self.attach_text(bucket, event.parent_id, parent, |saved| self.table.set_parent_text(handle, saved));
        }
    }

    fn attach_text(&self, bucket: u64, query_id: u64, text: &str, attach: impl FnOnce(TextHandle) -> TableResult<()>) {
        match self.table.text_store().save(bucket, query_id, text) {
            Ok(saved) => {
                if attach(saved).is_err() {
                    counter!("statmon_stale_handles", 1);
                    trace!(query_id, "entry evicted before its text was attached");
                }
            }
            Err(e) => debug!(query_id, bucket, error = %e, "query text not stored"),
        }
    }

    /// Calls `f` with a snapshot of every live entry in every bucket
    ///
    /// Snapshots are taken under the shared table lock, text is resolved and
    /// `f` is called after it has been released. Text that was reclaimed in
    /// between shows up as `None`.
    pub fn for_each_entry<F: FnMut(&EntrySnapshot)>(&self, mut f: F) {
        let resp_len = self.histogram.len();
        let captured: Vec<(EntrySnapshot, TextHandle, TextHandle)> = {
            let scan = self.table.iter(true);
            scan.filter_map(|handle| {
                let entry = self.table.lock_entry(handle).ok()?;
                let snapshot = EntrySnapshot::new(*entry.key(), entry.pgsm_query_id, entry.encoding, &entry.counters, resp_len);
                Some((snapshot, entry.text, entry.counters.info.parent_text))
            })
            .collect()
        };

        let buckets = self.region.buckets();
        for (mut snapshot, text, parent) in captured {
            if let Some(state) = buckets.get(snapshot.key.bucket_id as usize) {
                snapshot.bucket_start_time = state.start_time();
            }
            snapshot.query = self.table.text_store().read(&text).ok();
            if !parent.is_empty() {
                snapshot.parent_query = self.table.text_store().read(&parent).ok();
            }
            f(&snapshot);
        }
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let mut entries = Vec::with_capacity(self.table.len());
        self.for_each_entry(|snapshot| entries.push(snapshot.clone()));
        entries
    }

    /// Active bucket, rotating first if its time is up
    pub fn tick(&self) -> u64 {
        self.buckets.tick()
    }

    pub fn rotate(&self) -> u64 {
        self.buckets.rotate()
    }

    pub fn reset_all(&self) -> usize {
        self.buckets.reset_all()
    }

    pub fn reset_bucket(&self, bucket: u64) -> usize {
        self.buckets.reset_bucket(bucket)
    }

    /// Forces a dealloc pass, returns the number of entries removed
    pub fn dealloc(&self) -> usize {
        self.table.dealloc()
    }

    pub fn current_bucket(&self) -> u64 {
        self.buckets.current()
    }

    pub fn live_entries(&self) -> usize {
        self.table.len()
    }

    /// Resolves a text handle taken from an entry
    pub fn query_text(&self, handle: &TextHandle) -> TextResult<String> {
        self.table.text_store().read(handle)
    }

    pub fn histogram_ranges(&self) -> Vec<ValueRange> {
        self.histogram.ranges()
    }

    pub fn stats(&self) -> MonitorStats {
        let shared = self.region.shared();
        MonitorStats {
            live_entries: shared.live_entries(),
            capacity: self.table.capacity() as u64,
            current_bucket: shared.current_bucket(),
            dealloc_passes: shared.dealloc_passes(),
            rotations: shared.rotations(),
            median_usage: shared.median_usage(),
            attached: self.region.header().attached(),
            writers: shared.writers(),
            region_bytes: self.region.len() as u64,
            buckets: self.buckets.buckets(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn table(&self) -> &StatsTable {
        &self.table
    }
}

impl Drop for StatMonitor {
    fn drop(&mut self) {
        self.region.register_detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::ManualClock;

    fn frozen() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(600))
    }

    fn monitor_with(config: MonitorConfig) -> StatMonitor {
        StatMonitor::create_anonymous_with_clock(config, frozen()).unwrap()
    }

    fn small_config() -> MonitorConfig {
        MonitorConfig {
            max_entries: 64,
            max_buckets: 4,
            query_shared_buffer: 16 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_record_and_report() {
        let monitor = monitor_with(small_config());
        monitor.record(&StatementEvent::parse(1, "select $1"));
        monitor.record(&StatementEvent::finished(1, "select $1", 3.0, 1));
        monitor.record(&StatementEvent::finished(1, "select $1", 5.0, 1));

        let entries = monitor.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].calls(), 2);
        assert_eq!(entries[0].rows, 2);
        assert_eq!(entries[0].exec.mean, 4.0);
        assert_eq!(entries[0].query.as_deref(), Some("select $1"));
        assert_eq!(entries[0].resp_calls.len(), monitor.histogram_ranges().len());
    }

    #[test]
    fn test_track_levels() {
        let config = MonitorConfig { track: TrackLevel::Top, ..small_config() };
        let monitor = monitor_with(config);
        monitor.record(&StatementEvent::finished(1, "select 1", 1.0, 1).nested(9));
        assert_eq!(monitor.live_entries(), 0);

        let config = MonitorConfig { track: TrackLevel::All, ..small_config() };
        let monitor = monitor_with(config);
        monitor.record(&StatementEvent::finished(1, "select 1", 1.0, 1).nested(9));
        assert_eq!(monitor.live_entries(), 1);

        let config = MonitorConfig { track: TrackLevel::None, ..small_config() };
        let monitor = monitor_with(config);
        monitor.record(&StatementEvent::finished(1, "select 1", 1.0, 1));
        assert_eq!(monitor.live_entries(), 0);
    }

    #[test]
    fn test_nested_entry_keeps_parent_text() {
        let monitor = monitor_with(MonitorConfig { track: TrackLevel::All, ..small_config() });
        let nested = StatementEvent::finished(2, "update stock set n = n - 1", 1.0, 1).nested_in(1, "call place_order($1)");
        monitor.record(&nested);
        monitor.record(&nested);
        monitor.record(&StatementEvent::finished(1, "call place_order($1)", 4.0, 0));

        let entries = monitor.entries();
        let child = entries.iter().find(|e| e.key.query_id == 2).unwrap();
        assert_eq!(child.parent_id, 1);
        assert_eq!(child.parent_query.as_deref(), Some("call place_order($1)"));
        assert_eq!(child.calls(), 2);

        let top = entries.iter().find(|e| e.key.query_id == 1).unwrap();
        assert!(top.parent_query.is_none());
    }

    #[test]
    fn test_utility_filter() {
        let config = MonitorConfig { track_utility: false, ..small_config() };
        let monitor = monitor_with(config);
        monitor.record(&StatementEvent::finished(1, "vacuum", 1.0, 0).with_cmd_type(CmdType::Utility));
        monitor.record(&StatementEvent::finished(2, "select 1", 1.0, 1).with_cmd_type(CmdType::Select));
        assert_eq!(monitor.live_entries(), 1);
    }

    #[test]
    fn test_plan_events_need_track_planning() {
        let monitor = monitor_with(small_config());
        let plan = PlanStats {
            plan_id: 0,
            plan_time_ms: 1.0,
            plan_text: None,
        };
        monitor.record(&StatementEvent::new(StoreKind::Plan, 1, "select 1").with_plan(plan));
        assert_eq!(monitor.live_entries(), 0);
    }

    #[test]
    fn test_records_land_in_current_bucket() {
        let clock = Arc::new(ManualClock::new(600));
        let monitor = StatMonitor::create_anonymous_with_clock(small_config(), clock.clone()).unwrap();

        monitor.record(&StatementEvent::finished(1, "select 1", 1.0, 1));
        clock.advance(60);
        monitor.record(&StatementEvent::finished(1, "select 1", 1.0, 1));

        let mut buckets: Vec<u64> = monitor.entries().iter().map(|e| e.key.bucket_id).collect();
        buckets.sort();
        assert_eq!(buckets, vec![0, 1]);
        assert_eq!(monitor.stats().rotations, 1);
    }

    #[test]
    fn test_attach_counts_handles() {
        let monitor = monitor_with(small_config());
        let worker = monitor.attach().unwrap();
        assert_eq!(monitor.stats().attached, 2);

        worker.record(&StatementEvent::finished(5, "select 5", 1.0, 1));
        assert_eq!(monitor.live_entries(), 1);

        drop(worker);
        assert_eq!(monitor.stats().attached, 1);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = MonitorConfig { max_entries: 0, ..small_config() };
        assert!(matches!(StatMonitor::create_anonymous(config), Err(MonitorError::Config(_))));
    }
}
