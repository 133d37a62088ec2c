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

use serde::{Deserialize, Serialize};

use super::counters::{Blocks, CmdType, Counters, JitInfo, QueryState, SysInfo, WalUsage};
use super::key::EntryKey;

/// Timing aggregate as reported, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub calls: i64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub elevel: i64,
    pub sqlcode: String,
    pub message: String,
}

/// Owned copy of one entry, taken under the entry lock
///
/// This is what the reporting layer projects into rows; nothing in it points
/// back into shared memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: EntryKey,
    pub bucket_start_time: u64,
    pub pgsm_query_id: u64,
    pub encoding: i32,
    pub query: Option<String>, // None when the text was dropped or reclaimed
    pub state: QueryState,
    pub cmd_type: CmdType,
    pub parent_id: u64,
    pub parent_query: Option<String>,
    pub application_name: String,
    pub comments: String,
    pub relations: Vec<String>,
    pub rows: i64,
    pub usage: f64,
    pub exec: TimingSummary,
    pub plan: TimingSummary,
    pub plan_id: u64,
    pub plan_text: String,
    pub blocks: Blocks,
    pub wal: WalUsage,
    pub jit: JitInfo,
    pub sysinfo: SysInfo,
    pub error: ErrorSummary,
    pub resp_calls: Vec<u64>,
}

impl EntrySnapshot {
    pub fn new(key: EntryKey, pgsm_query_id: u64, encoding: i32, counters: &Counters, resp_len: usize) -> Self {
        let calls = counters.calls.calls;
        let plan_calls = counters.plan_calls.calls;

        Self {
            key,
            bucket_start_time: 0,
            pgsm_query_id,
            encoding,
            query: None,
            state: counters.state(),
            cmd_type: counters.info.cmd_type(),
            parent_id: counters.info.parent_id,
            parent_query: None,
            application_name: counters.info.application_name.as_str().to_string(),
            comments: counters.info.comments.as_str().to_string(),
            relations: counters.info.relations().map(str::to_string).collect(),
            rows: counters.calls.rows,
            usage: counters.calls.usage,
            exec: TimingSummary {
                calls,
                total: counters.time.total,
                min: counters.time.min,
                max: counters.time.max,
                mean: counters.time.mean,
                stddev: counters.time.stddev(calls),
            },
            plan: TimingSummary {
                calls: plan_calls,
                total: counters.plan_time.total,
                min: counters.plan_time.min,
                max: counters.plan_time.max,
                mean: counters.plan_time.mean,
                stddev: counters.plan_time.stddev(plan_calls),
            },
            plan_id: counters.plan.plan_id,
            plan_text: counters.plan.plan_text.as_str().to_string(),
            blocks: counters.blocks,
            wal: counters.wal,
            jit: counters.jit,
            sysinfo: counters.sysinfo,
            error: ErrorSummary {
                elevel: counters.error.elevel,
                sqlcode: counters.error.sqlcode.as_str().to_string(),
                message: counters.error.message.as_str().to_string(),
            },
            resp_calls: counters.resp_calls[..resp_len.min(counters.resp_calls.len())].to_vec(),
        }
    }

    pub fn calls(&self) -> i64 {
        self.exec.calls
    }
}
