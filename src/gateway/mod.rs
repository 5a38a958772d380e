//! Remote task gateway.
//!
//! The gateway is the only suspension point of the task engine: every
//! create, list, stop, retry and delete goes through a [`TaskGateway`].
//! Records coming back are validated into [`RemoteTaskRecord`] here, so the
//! reconciler only ever sees a known schema.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::task::{
    AnalysisConfig, AnalysisKind, BackendId, ConnectionRef, CreateTaskParams, TaskKind, TaskStatus,
};

pub mod http;
pub mod memory;

pub use http::HttpGateway;
pub use memory::MemoryGateway;

/// Backend timestamp layout (UTC, no zone suffix).
const BACKEND_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[async_trait]
pub trait TaskGateway: Send + Sync {
    async fn create_job(&self, request: &CreateJobRequest) -> Result<BackendId>;
    async fn list_jobs(&self, query: &ListQuery) -> Result<JobPage>;
    async fn get_job(&self, id: BackendId) -> Result<RemoteTaskRecord>;
    async fn stop_job(&self, id: BackendId) -> Result<()>;
    async fn retry_job(&self, id: BackendId) -> Result<BackendId>;
    async fn delete_job(&self, id: BackendId) -> Result<()>;
    async fn get_job_logs(&self, id: BackendId, limit: usize) -> Result<Vec<LogEntry>>;
}

/// Gateway operations, used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    Create,
    List,
    Get,
    Stop,
    Retry,
    Delete,
    Logs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub name: String,
    pub connection_id: u64,
    pub connection_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(rename = "selectedVMs")]
    pub selected_vms: Vec<String>,
    pub vm_count: usize,
    #[serde(default)]
    pub config: AnalysisConfig,
}

impl From<&CreateTaskParams> for CreateJobRequest {
    fn from(params: &CreateTaskParams) -> Self {
        Self {
            kind: params.kind,
            name: params.display_name.clone(),
            connection_id: params.connection.id,
            connection_name: params.connection.name.clone(),
            platform: params.connection.platform.clone(),
            selected_vms: params.selection.clone(),
            vm_count: params.selection.len(),
            config: params.config.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl ListQuery {
    pub fn first_page(limit: usize) -> Self {
        Self {
            status: None,
            limit,
            offset: 0,
        }
    }
}

/// One validated listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPage {
    pub records: Vec<RemoteTaskRecord>,
    /// Records the backend returned that failed validation and were dropped.
    pub rejected: usize,
}

impl JobPage {
    /// Validate each wire record on its own; invalid ones are logged and
    /// counted, never fatal to the page.
    pub fn from_wire(wire: Vec<WireTask>) -> Self {
        let mut page = Self::default();
        for raw in wire {
            match RemoteTaskRecord::try_from(raw) {
                Ok(record) => page.records.push(record),
                Err(err) => {
                    warn!(error = %err, "dropping invalid job record");
                    page.rejected += 1;
                }
            }
        }
        page
    }

    /// Number of records the backend sent, valid or not.
    pub fn listed(&self) -> usize {
        self.records.len() + self.rejected
    }

    pub fn is_empty(&self) -> bool {
        self.listed() == 0
    }
}

impl From<Vec<RemoteTaskRecord>> for JobPage {
    fn from(records: Vec<RemoteTaskRecord>) -> Self {
        Self {
            records,
            rejected: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// A validated task record as reported by the backend.
///
/// `None` means the backend did not send the field. Local-only fields
/// (`selection`, `analysis_completion`) are only present when the backend
/// echoes them back.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTaskRecord {
    pub backend_id: BackendId,
    pub kind: TaskKind,
    pub display_name: Option<String>,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub current_step: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub connection: Option<ConnectionRef>,
    pub selection: Option<Vec<String>>,
    pub analysis_completion: Option<BTreeMap<AnalysisKind, bool>>,
    pub vm_count: Option<u32>,
    pub collected_vm_count: Option<u32>,
}

impl RemoteTaskRecord {
    /// Minimal record, mostly useful for tests and in-process gateways.
    pub fn new(backend_id: BackendId, kind: TaskKind, status: TaskStatus) -> Self {
        Self {
            backend_id,
            kind,
            display_name: None,
            status,
            progress: 0,
            error: None,
            current_step: None,
            created_at: None,
            started_at: None,
            completed_at: None,
            connection: None,
            selection: None,
            analysis_completion: None,
            vm_count: None,
            collected_vm_count: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    pub fn with_connection(mut self, connection: ConnectionRef) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn to_wire(&self) -> WireTask {
        WireTask {
            id: self.backend_id.0,
            kind: Some(self.kind.as_str().to_string()),
            name: self.display_name.clone(),
            status: self.status.as_str().to_string(),
            progress: Some(f64::from(self.progress)),
            error: self.error.clone(),
            created_at: self.created_at.map(|ts| ts.to_rfc3339()),
            started_at: self.started_at.map(|ts| ts.to_rfc3339()),
            completed_at: self.completed_at.map(|ts| ts.to_rfc3339()),
            connection_id: self.connection.as_ref().map(|conn| conn.id),
            connection_name: self.connection.as_ref().map(|conn| conn.name.clone()),
            platform: self.connection.as_ref().and_then(|conn| conn.platform.clone()),
            host: self.connection.as_ref().and_then(|conn| conn.host.clone()),
            selected_vms: self.selection.clone(),
            vm_count: self.vm_count,
            collected_vm_count: self.collected_vm_count,
            current_step: self.current_step.clone(),
            analysis_results: self.analysis_completion.as_ref().map(|flags| {
                flags
                    .iter()
                    .map(|(kind, done)| (kind.as_str().to_string(), *done))
                    .collect()
            }),
        }
    }
}

/// Task record exactly as the backend serializes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTask {
    pub id: u64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "selectedVMs", default, skip_serializing_if = "Option::is_none")]
    pub selected_vms: Option<Vec<String>>,
    #[serde(rename = "vmCount", default, skip_serializing_if = "Option::is_none")]
    pub vm_count: Option<u32>,
    #[serde(rename = "collectedVMCount", default, skip_serializing_if = "Option::is_none")]
    pub collected_vm_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_results: Option<BTreeMap<String, bool>>,
}

impl TryFrom<WireTask> for RemoteTaskRecord {
    type Error = Error;

    fn try_from(wire: WireTask) -> Result<Self> {
        let id = wire.id;
        let invalid = |what: String| Error::InvalidRecord(format!("job {id}: {what}"));

        let status = wire_status(&wire.status).map_err(invalid)?;

        let kind = match non_empty(wire.kind) {
            Some(raw) => raw
                .parse::<TaskKind>()
                .map_err(|_| invalid(format!("unknown type '{raw}'")))?,
            None => TaskKind::Collection,
        };

        let progress = match wire.progress {
            Some(value) if value.is_finite() => value.round().clamp(0.0, 100.0) as u8,
            Some(value) => return Err(invalid(format!("invalid progress {value}"))),
            None => 0,
        };

        let connection = wire.connection_id.filter(|id| *id > 0).map(|conn_id| ConnectionRef {
            id: conn_id,
            name: non_empty(wire.connection_name.clone()).unwrap_or_default(),
            platform: non_empty(wire.platform.clone()),
            host: non_empty(wire.host.clone()),
        });

        let analysis_completion = match wire.analysis_results {
            Some(flags) => {
                let mut parsed = BTreeMap::new();
                for (name, done) in flags {
                    let kind = name
                        .parse::<AnalysisKind>()
                        .map_err(|_| invalid(format!("unknown analysis '{name}'")))?;
                    parsed.insert(kind, done);
                }
                Some(parsed)
            }
            None => None,
        };

        Ok(Self {
            backend_id: BackendId(id),
            kind,
            display_name: non_empty(wire.name),
            status,
            progress,
            error: non_empty(wire.error),
            current_step: non_empty(wire.current_step),
            created_at: parse_timestamp(wire.created_at.as_deref())
                .map_err(|err| invalid(format!("createdAt: {err}")))?,
            started_at: parse_timestamp(wire.started_at.as_deref())
                .map_err(|err| invalid(format!("startedAt: {err}")))?,
            completed_at: parse_timestamp(wire.completed_at.as_deref())
                .map_err(|err| invalid(format!("completedAt: {err}")))?,
            connection,
            selection: wire.selected_vms,
            analysis_completion,
            vm_count: wire.vm_count,
            collected_vm_count: wire.collected_vm_count,
        })
    }
}

/// Backend status strings. The collection and analysis phases are both
/// `running` here; `unknown` is reserved for local use.
fn wire_status(raw: &str) -> std::result::Result<TaskStatus, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "collecting" | "analyzing" | "analysing" => Ok(TaskStatus::Running),
        "unknown" => Err("status 'unknown' is reserved for local use".to_string()),
        other => other
            .parse::<TaskStatus>()
            .map_err(|_| format!("unknown status '{raw}'")),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Parse an RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC) timestamp.
pub fn parse_timestamp(raw: Option<&str>) -> std::result::Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(raw, BACKEND_TIMESTAMP_FORMAT)
        .map(|naive| Some(naive.and_utc()))
        .map_err(|_| format!("invalid timestamp '{raw}'"))
}
