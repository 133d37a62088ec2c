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

use super::comments::extract_comments;
use super::event::{StatementEvent, StoreKind};
use crate::config::MonitorConfig;
use crate::statistics::{QueryState, ResponseHistogram};
use crate::table::{EntryBody, USAGE_EXEC};

/// An event plus everything derived from it ahead of the entry lock
pub(crate) struct PreparedEvent<'a> {
    event: &'a StatementEvent,
    comments: Option<String>,
}

impl<'a> PreparedEvent<'a> {
    /// Scans the query text, runs before any lock is taken
    pub(crate) fn new(event: &'a StatementEvent, config: &MonitorConfig) -> Self {
        let comments = match event.kind {
            StoreKind::Parse | StoreKind::Finished | StoreKind::Error if config.extract_comments => Some(extract_comments(&event.query_text)).filter(|c| !c.is_empty()),
            _ => None,
        };
        Self { event, comments }
    }
}

/// Merges one event into an entry body
///
/// Called with the entry lock held; only copies into fixed-width fields.
pub(crate) fn apply_event(entry: &mut EntryBody, prepared: &PreparedEvent<'_>, config: &MonitorConfig, histogram: &ResponseHistogram) {
    let event = prepared.event;
    match event.kind {
        StoreKind::Parse => {
            update_metadata(entry, prepared);
            entry.counters.set_state(QueryState::Parsing);
        }
        StoreKind::Plan => {
            if let Some(plan) = &event.plan {
                let plan_calls = &mut entry.counters.plan_calls;
                plan_calls.calls += 1;
                plan_calls.usage += USAGE_EXEC;
                let n = plan_calls.calls;
                entry.counters.plan_time.observe(n, plan.plan_time_ms);
            }
            update_plan(entry, event, config);
            entry.counters.set_state(QueryState::Planning);
        }
        StoreKind::Exec => {
            entry.counters.set_state(QueryState::Active);
        }
        StoreKind::Finished => {
            update_metadata(entry, prepared);
            update_plan(entry, event, config);

            let counters = &mut entry.counters;
            let exec = &event.exec;
            counters.calls.calls += 1;
            counters.calls.rows += exec.rows;
            counters.calls.usage += USAGE_EXEC;
            counters.time.observe(counters.calls.calls, exec.total_time_ms);
            histogram.record(&mut counters.resp_calls, exec.total_time_ms);

            counters.blocks.accumulate(&exec.blocks);
            counters.wal.accumulate(&exec.wal);
            counters.jit.accumulate(&exec.jit);
            counters.sysinfo.accumulate(&exec.sysinfo);
            counters.set_state(QueryState::Finished);
        }
        StoreKind::Error => {
            update_metadata(entry, prepared);
            if let Some(error) = &event.error {
                let info = &mut entry.counters.error;
                info.elevel = error.elevel;
                info.sqlcode.set(&error.sqlcode);
                info.message.set(&error.message);
            }
            entry.counters.set_state(QueryState::FinishedWithError);
        }
    }
}

fn update_metadata(entry: &mut EntryBody, prepared: &PreparedEvent<'_>) {
    let event = prepared.event;
    if event.pgsm_query_id != 0 {
        entry.pgsm_query_id = event.pgsm_query_id;
    }
    entry.encoding = event.encoding;

    let info = &mut entry.counters.info;
    info.parent_id = event.parent_id;
    info.cmd_type = event.cmd_type.as_raw();
    if !event.application_name.is_empty() {
        info.application_name.set(&event.application_name);
    }
    if !event.relations.is_empty() {
        info.set_relations(&event.relations);
    }
    if let Some(comments) = &prepared.comments {
        info.comments.set(comments);
    }
}

fn update_plan(entry: &mut EntryBody, event: &StatementEvent, config: &MonitorConfig) {
    if !config.enable_query_plan {
        return;
    }
    if let Some(plan) = &event.plan {
        entry.counters.plan.plan_id = plan.plan_id;
        if let Some(text) = &plan.plan_text {
            entry.counters.plan.plan_text.set(text);
        }
    }
}
