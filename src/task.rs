//! Task model for fleet jobs.
//!
//! A [`Task`] is the locally held view of one collection or analysis job.
//! It is known by a [`LocalId`] for the whole session and, once the backend
//! accepts the job, also by a [`BackendId`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

const LOCAL_ID_PREFIX: &str = "t-";

/// Free-form keyed parameters passed through to the backend with a job.
pub type AnalysisConfig = BTreeMap<String, serde_json::Value>;

/// Session-local task identity, assigned at optimistic-creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            LOCAL_ID_PREFIX,
            Ulid::new().to_string().to_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LocalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable identity assigned by the backend when it accepts a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub u64);

impl BackendId {
    /// Parse `42`, `#42` or `backend_42`.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("backend_")
            .or_else(|| trimmed.strip_prefix('#'))
            .unwrap_or(trimmed);
        if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(BackendId)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Zombie,
    Rightsize,
    Tidal,
    Health,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Zombie => "zombie",
            AnalysisKind::Rightsize => "rightsize",
            AnalysisKind::Tidal => "tidal",
            AnalysisKind::Health => "health",
        }
    }
}

impl FromStr for AnalysisKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "zombie" => Ok(AnalysisKind::Zombie),
            "rightsize" => Ok(AnalysisKind::Rightsize),
            "tidal" => Ok(AnalysisKind::Tidal),
            "health" => Ok(AnalysisKind::Health),
            other => Err(Error::InvalidArgument(format!(
                "unknown analysis kind '{other}' (expected zombie|rightsize|tidal|health)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Collection,
    AnalysisZombie,
    AnalysisRightsize,
    AnalysisTidal,
    AnalysisHealth,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Collection => "collection",
            TaskKind::AnalysisZombie => "analysis_zombie",
            TaskKind::AnalysisRightsize => "analysis_rightsize",
            TaskKind::AnalysisTidal => "analysis_tidal",
            TaskKind::AnalysisHealth => "analysis_health",
        }
    }

    pub fn analysis_kind(&self) -> Option<AnalysisKind> {
        match self {
            TaskKind::Collection => None,
            TaskKind::AnalysisZombie => Some(AnalysisKind::Zombie),
            TaskKind::AnalysisRightsize => Some(AnalysisKind::Rightsize),
            TaskKind::AnalysisTidal => Some(AnalysisKind::Tidal),
            TaskKind::AnalysisHealth => Some(AnalysisKind::Health),
        }
    }
}

impl From<AnalysisKind> for TaskKind {
    fn from(kind: AnalysisKind) -> Self {
        match kind {
            AnalysisKind::Zombie => TaskKind::AnalysisZombie,
            AnalysisKind::Rightsize => TaskKind::AnalysisRightsize,
            AnalysisKind::Tidal => TaskKind::AnalysisTidal,
            AnalysisKind::Health => TaskKind::AnalysisHealth,
        }
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    /// Accepts the client names plus the backend's generic `assessment`
    /// type and bare analysis names.
    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "collection" | "assessment" => Ok(TaskKind::Collection),
            other => {
                let bare = other.strip_prefix("analysis_").unwrap_or(other);
                bare.parse::<AnalysisKind>()
                    .map(TaskKind::from)
                    .map_err(|_| Error::InvalidArgument(format!("unknown task kind '{value}'")))
            }
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// Bound task that disappeared from the remote listing.
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Pending, running or paused.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused
        )
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            "unknown" => Ok(TaskStatus::Unknown),
            other => Err(Error::InvalidArgument(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The hypervisor connection a job targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl ConnectionRef {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            platform: None,
            host: None,
        }
    }

    /// Parse `7` or `7:dc1`.
    pub fn parse(input: &str) -> Result<Self> {
        let (id, name) = match input.split_once(':') {
            Some((id, name)) => (id, name.trim()),
            None => (input, ""),
        };
        let id: u64 = id.trim().parse().map_err(|_| {
            Error::InvalidArgument(format!("invalid connection '{input}' (expected <id>[:<name>])"))
        })?;
        Ok(Self::new(id, name))
    }
}

/// How the task entered the local collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Created optimistically through this client.
    Local,
    /// Synthesized from a remote record nobody here created.
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: LocalId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<BackendId>,
    pub kind: TaskKind,
    pub display_name: String,
    pub status: TaskStatus,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionRef>,
    #[serde(default)]
    pub selection: Vec<String>,
    #[serde(default)]
    pub analysis_completion: BTreeMap<AnalysisKind, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collected_vm_count: Option<u32>,
    pub origin: TaskOrigin,
    /// Set when the bounded polling window failed this task locally.
    #[serde(default)]
    pub timed_out: bool,
}

impl Task {
    pub fn is_bound(&self) -> bool {
        self.backend_id.is_some()
    }

    pub fn params(&self) -> CreateTaskParams {
        CreateTaskParams {
            kind: self.kind,
            display_name: self.display_name.clone(),
            connection: self
                .connection
                .clone()
                .unwrap_or_else(|| ConnectionRef::new(0, "")),
            selection: self.selection.clone(),
            config: AnalysisConfig::new(),
        }
    }
}

/// Caller-supplied parameters for a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskParams {
    pub kind: TaskKind,
    pub display_name: String,
    pub connection: ConnectionRef,
    #[serde(default)]
    pub selection: Vec<String>,
    #[serde(default)]
    pub config: AnalysisConfig,
}

impl CreateTaskParams {
    pub fn new(kind: TaskKind, connection: ConnectionRef) -> Self {
        let display_name = if connection.name.is_empty() {
            kind.as_str().to_string()
        } else {
            format!("{} {}", connection.name, kind.as_str())
        };
        Self {
            kind,
            display_name,
            connection,
            selection: Vec::new(),
            config: AnalysisConfig::new(),
        }
    }

    pub fn with_selection<I, S>(mut self, selection: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = selection.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// User-initiated change to local-only fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub display_name: Option<String>,
    pub selection: Option<Vec<String>>,
    pub analysis_completion: BTreeMap<AnalysisKind, bool>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.selection.is_none()
            && self.analysis_completion.is_empty()
    }

    pub(crate) fn apply(&self, task: &mut Task) {
        if let Some(name) = &self.display_name {
            task.display_name = name.clone();
        }
        if let Some(selection) = &self.selection {
            task.selection = selection.clone();
        }
        for (kind, done) in &self.analysis_completion {
            task.analysis_completion.insert(*kind, *done);
        }
    }
}
