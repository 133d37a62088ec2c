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

//! Fixed-size counters stored inline in every entry slot
//!
//! Every type here is `#[repr(C)]`, `Copy`, and valid when all bytes are zero,
//! since slots live in a zero-filled shared mapping.

use serde::{Deserialize, Serialize};

use super::fixed_str::FixedStr;
use crate::text::TextHandle;

pub const MAX_RESPONSE_BUCKET: usize = 50;
pub const APPLICATION_NAME_LEN: usize = 100;
pub const COMMENTS_LEN: usize = 512;
pub const REL_LST: usize = 10;
pub const REL_LEN: usize = 255;
pub const SQLCODE_LEN: usize = 20;
pub const ERROR_MESSAGE_LEN: usize = 100;
pub const PLAN_TEXT_LEN: usize = 1024;

/// Execution count, affected rows and the eviction usage score
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Calls {
    pub calls: i64,
    pub rows: i64,
    pub usage: f64,
}

/// Online timing moments in milliseconds
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallTime {
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum_var: f64,
}

impl CallTime {
    /// Folds in the `n`-th observation (`n` counts this one)
    ///
    /// Welford's update: the mean moves by `(x - mean) / n` and the sum of
    /// squared deviations by `(x - old_mean) * (x - new_mean)`.
    pub fn observe(&mut self, n: i64, value: f64) {
        self.total += value;
        if n <= 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.sum_var = 0.0;
            return;
        }

        let old_mean = self.mean;
        self.mean += (value - old_mean) / n as f64;
        self.sum_var += (value - old_mean) * (value - self.mean);
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Population standard deviation over `n` observations
    pub fn stddev(&self, n: i64) -> f64 {
        if n > 1 { (self.sum_var / n as f64).sqrt() } else { 0.0 }
    }
}

/// Buffer usage counters
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Blocks {
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub shared_blks_dirtied: i64,
    pub shared_blks_written: i64,
    pub local_blks_hit: i64,
    pub local_blks_read: i64,
    pub local_blks_dirtied: i64,
    pub local_blks_written: i64,
    pub temp_blks_read: i64,
    pub temp_blks_written: i64,
    pub blk_read_time: f64,
    pub blk_write_time: f64,
    pub temp_blk_read_time: f64,
    pub temp_blk_write_time: f64,
}

impl Blocks {
    pub fn accumulate(&mut self, other: &Blocks) {
        self.shared_blks_hit += other.shared_blks_hit;
        self.shared_blks_read += other.shared_blks_read;
        self.shared_blks_dirtied += other.shared_blks_dirtied;
        self.shared_blks_written += other.shared_blks_written;
        self.local_blks_hit += other.local_blks_hit;
        self.local_blks_read += other.local_blks_read;
        self.local_blks_dirtied += other.local_blks_dirtied;
        self.local_blks_written += other.local_blks_written;
        self.temp_blks_read += other.temp_blks_read;
        self.temp_blks_written += other.temp_blks_written;
        self.blk_read_time += other.blk_read_time;
        self.blk_write_time += other.blk_write_time;
        self.temp_blk_read_time += other.temp_blk_read_time;
        self.temp_blk_write_time += other.temp_blk_write_time;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JitInfo {
    pub functions: i64,
    pub generation_time: f64,
    pub inlining_count: i64,
    pub inlining_time: f64,
    pub optimization_count: i64,
    pub optimization_time: f64,
    pub emission_count: i64,
    pub emission_time: f64,
}

impl JitInfo {
    /// Adds a delta, the `*_count` fields count observations with nonzero time
    pub fn accumulate(&mut self, other: &JitInfo) {
        self.functions += other.functions;
        self.generation_time += other.generation_time;

        if other.inlining_time > 0.0 {
            self.inlining_count += 1;
        }
        self.inlining_time += other.inlining_time;

        if other.optimization_time > 0.0 {
            self.optimization_count += 1;
        }
        self.optimization_time += other.optimization_time;

        if other.emission_time > 0.0 {
            self.emission_count += 1;
        }
        self.emission_time += other.emission_time;
    }
}

/// CPU time charged to the statement, in milliseconds
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SysInfo {
    pub utime: f64,
    pub stime: f64,
}

impl SysInfo {
    pub fn accumulate(&mut self, other: &SysInfo) {
        self.utime += other.utime;
        self.stime += other.stime;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WalUsage {
    pub records: i64,
    pub fpi: i64,
    pub bytes: u64,
}

impl WalUsage {
    pub fn accumulate(&mut self, other: &WalUsage) {
        self.records += other.records;
        self.fpi += other.fpi;
        self.bytes += other.bytes;
    }
}

/// Last error raised by the statement
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorInfo {
    pub elevel: i64,
    pub sqlcode: FixedStr<SQLCODE_LEN>,
    pub message: FixedStr<ERROR_MESSAGE_LEN>,
}

/// Top-level command type of the statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmdType {
    #[default]
    Unknown,
    Select,
    Update,
    Insert,
    Delete,
    Merge,
    Utility,
    Nothing,
}

impl CmdType {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => CmdType::Select,
            2 => CmdType::Update,
            3 => CmdType::Insert,
            4 => CmdType::Delete,
            5 => CmdType::Merge,
            6 => CmdType::Utility,
            7 => CmdType::Nothing,
            _ => CmdType::Unknown,
        }
    }
}

/// Statement metadata, overwritten by the latest observation
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryInfo {
    pub parent_id: u64,
    pub parent_text: TextHandle, // text of the calling statement, nested entries only
    pub application_name: FixedStr<APPLICATION_NAME_LEN>,
    pub comments: FixedStr<COMMENTS_LEN>,
    pub relations: [FixedStr<REL_LEN>; REL_LST],
    pub num_relations: u32,
    pub cmd_type: u32,
}

impl QueryInfo {
    /// Replaces the relation list, keeping at most `REL_LST` names
    pub fn set_relations<S: AsRef<str>>(&mut self, relations: &[S]) {
        let count = relations.len().min(REL_LST);
        for (slot, name) in self.relations.iter_mut().zip(relations.iter().take(count)) {
            slot.set(name.as_ref());
        }
        self.num_relations = count as u32;
    }

    pub fn relations(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().take((self.num_relations as usize).min(REL_LST)).map(|r| r.as_str())
    }

    pub fn cmd_type(&self) -> CmdType {
        CmdType::from_raw(self.cmd_type)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanInfo {
    pub plan_id: u64,
    pub plan_text: FixedStr<PLAN_TEXT_LEN>,
}

/// Lifecycle state of the last statement that touched the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    #[default]
    Parsing,
    Planning,
    Active,
    Finished,
    FinishedWithError,
}

impl QueryState {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => QueryState::Planning,
            2 => QueryState::Active,
            3 => QueryState::Finished,
            4 => QueryState::FinishedWithError,
            _ => QueryState::Parsing,
        }
    }
}

/// Everything aggregated for one entry
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Counters {
    pub calls: Calls,
    pub time: CallTime,
    pub plan_calls: Calls,
    pub plan_time: CallTime,
    pub plan: PlanInfo,
    pub info: QueryInfo,
    pub blocks: Blocks,
    pub sysinfo: SysInfo,
    pub jit: JitInfo,
    pub error: ErrorInfo,
    pub wal: WalUsage,
    pub resp_calls: [u64; MAX_RESPONSE_BUCKET],
    pub state: u32,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            calls: Calls::default(),
            time: CallTime::default(),
            plan_calls: Calls::default(),
            plan_time: CallTime::default(),
            plan: PlanInfo::default(),
            info: QueryInfo::default(),
            blocks: Blocks::default(),
            sysinfo: SysInfo::default(),
            jit: JitInfo::default(),
            error: ErrorInfo::default(),
            wal: WalUsage::default(),
            resp_calls: [0; MAX_RESPONSE_BUCKET],
            state: QueryState::Parsing.as_raw(),
        }
    }
}

impl Counters {
    pub fn state(&self) -> QueryState {
        QueryState::from_raw(self.state)
    }

    pub fn set_state(&mut self, state: QueryState) {
        self.state = state.as_raw();
    }

    /// An entry that has been seen but never finished executing
    pub fn is_sticky(&self) -> bool {
        self.calls.calls == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_sets_all_moments() {
        let mut time = CallTime::default();
        time.observe(1, 12.5);
        assert_eq!(time.min, 12.5);
        assert_eq!(time.max, 12.5);
        assert_eq!(time.mean, 12.5);
        assert_eq!(time.total, 12.5);
        assert_eq!(time.stddev(1), 0.0);
    }

    #[test]
    fn test_moments_match_direct_computation() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut time = CallTime::default();
        for (i, &x) in samples.iter().enumerate() {
            time.observe(i as i64 + 1, x);
        }

        assert_eq!(time.total, 40.0);
        assert!((time.mean - 5.0).abs() < 1e-12);
        assert!((time.stddev(samples.len() as i64) - 2.0).abs() < 1e-12);
        assert_eq!(time.min, 2.0);
        assert_eq!(time.max, 9.0);
    }

    #[test]
    fn test_jit_counts_only_nonzero_phases() {
        let mut jit = JitInfo::default();
        jit.accumulate(&JitInfo {
            functions: 3,
            inlining_time: 0.5,
            emission_time: 0.0,
            ..Default::default()
        });
        assert_eq!(jit.functions, 3);
        assert_eq!(jit.inlining_count, 1);
        assert_eq!(jit.emission_count, 0);
    }

    #[test]
    fn test_relations_are_capped() {
        let names: Vec<String> = (0..15).map(|i| format!("public.t{}", i)).collect();
        let mut info = QueryInfo::default();
        info.set_relations(&names);
        assert_eq!(info.num_relations as usize, REL_LST);
        assert_eq!(info.relations().next(), Some("public.t0"));
        assert_eq!(info.relations().count(), REL_LST);
    }

    #[test]
    fn test_zeroed_counters_are_default() {
        let zeroed: Counters = unsafe { std::mem::zeroed() };
        assert_eq!(zeroed, Counters::default());
        assert!(zeroed.is_sticky());
        assert_eq!(zeroed.state(), QueryState::Parsing);
        assert_eq!(zeroed.info.cmd_type(), CmdType::Unknown);
    }
}
