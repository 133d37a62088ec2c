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

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::statistics::{Blocks, CmdType, JitInfo, KeyFields, SysInfo, WalUsage, application_id, client_ip_key};

/// Phase of statement processing an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Parse,
    Plan,
    Exec,
    Finished,
    Error,
}

/// Resource usage measured by the execution pipeline for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_time_ms: f64,
    pub rows: i64,
    pub blocks: Blocks,
    pub wal: WalUsage,
    pub jit: JitInfo,
    pub sysinfo: SysInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStats {
    pub plan_id: u64,
    pub plan_time_ms: f64,
    pub plan_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub elevel: i64,
    pub sqlcode: String,
    pub message: String,
}

/// Everything the pipeline hands over for one statement phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementEvent {
    pub kind: StoreKind,
    pub key: KeyFields,
    pub pgsm_query_id: u64,
    pub query_text: String,
    pub normalized_text: Option<String>,
    pub encoding: i32,
    pub cmd_type: CmdType,
    pub parent_id: u64,
    pub parent_text: Option<String>,
    pub application_name: String,
    pub relations: Vec<String>,
    pub plan: Option<PlanStats>,
    pub exec: ExecutionStats,
    pub error: Option<ErrorReport>,
}

impl StatementEvent {
    pub fn new(kind: StoreKind, query_id: u64, query_text: impl Into<String>) -> Self {
        Self {
            kind,
            key: KeyFields {
                query_id,
                top_level: true,
                ..Default::default()
            },
            pgsm_query_id: 0,
            query_text: query_text.into(),
            normalized_text: None,
            encoding: 0,
            cmd_type: CmdType::Unknown,
            parent_id: 0,
            parent_text: None,
            application_name: String::new(),
            relations: Vec::new(),
            plan: None,
            exec: ExecutionStats::default(),
            error: None,
        }
    }

    pub fn parse(query_id: u64, query_text: impl Into<String>) -> Self {
        Self::new(StoreKind::Parse, query_id, query_text)
    }

    /// A completed execution taking `total_time_ms` and returning `rows`
    pub fn finished(query_id: u64, query_text: impl Into<String>, total_time_ms: f64, rows: i64) -> Self {
        let mut event = Self::new(StoreKind::Finished, query_id, query_text);
        event.exec.total_time_ms = total_time_ms;
        event.exec.rows = rows;
        event
    }

    pub fn failed(query_id: u64, query_text: impl Into<String>, error: ErrorReport) -> Self {
        Self::new(StoreKind::Error, query_id, query_text).with_error(error)
    }

    pub fn with_user(mut self, user_id: u64) -> Self {
        self.key.user_id = user_id;
        self
    }

    pub fn with_database(mut self, database_id: u64) -> Self {
        self.key.database_id = database_id;
        self
    }

    pub fn with_client(mut self, addr: IpAddr) -> Self {
        self.key.client_ip = client_ip_key(addr);
        self
    }

    pub fn with_application(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self.key.application_id = application_id(&self.application_name);
        self
    }

    /// Marks the statement as nested under `parent_id`
    pub fn nested(mut self, parent_id: u64) -> Self {
        self.key.top_level = false;
        self.parent_id = parent_id;
        self
    }

    /// Nested statement whose caller ran `parent_text`
    pub fn nested_in(self, parent_id: u64, parent_text: impl Into<String>) -> Self {
        let mut event = self.nested(parent_id);
        event.parent_text = Some(parent_text.into());
        event
    }

    pub fn with_cmd_type(mut self, cmd_type: CmdType) -> Self {
        self.cmd_type = cmd_type;
        self
    }

    pub fn with_relations<S: Into<String>>(mut self, relations: impl IntoIterator<Item = S>) -> Self {
        self.relations = relations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_plan(mut self, plan: PlanStats) -> Self {
        self.key.plan_id = plan.plan_id;
        self.plan = Some(plan);
        self
    }

    pub fn with_exec(mut self, exec: ExecutionStats) -> Self {
        self.exec = exec;
        self
    }

    pub fn with_error(mut self, error: ErrorReport) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_normalized_text(mut self, text: impl Into<String>) -> Self {
        self.normalized_text = Some(text.into());
        self
    }

    pub fn with_pgsm_query_id(mut self, id: u64) -> Self {
        self.pgsm_query_id = id;
        self
    }

    pub fn with_encoding(mut self, encoding: i32) -> Self {
        self.encoding = encoding;
        self
    }
}
