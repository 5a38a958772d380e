//! Configuration loading and management
//!
//! Handles parsing of `.fleetjobs.toml` configuration files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".fleetjobs.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Poll scheduler configuration
    #[serde(default)]
    pub poll: PollConfig,

    /// Session persistence configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Remote gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Backend base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Page size of the periodic list poll
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_list_limit() -> usize {
    100
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            list_limit: default_list_limit(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration(&self.request_timeout)
    }
}

/// Poll scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Baseline poll interval
    #[serde(default = "default_poll_interval")]
    pub interval: String,

    /// Bounded polling window for a newly submitted job
    #[serde(default = "default_task_window")]
    pub task_window: String,

    /// Poll interval inside the bounded window
    #[serde(default = "default_task_interval")]
    pub task_interval: String,

    /// Polls a bound task may be missing from the listing before it is
    /// marked unknown
    #[serde(default = "default_absence_grace_polls")]
    pub absence_grace_polls: u32,
}

fn default_poll_interval() -> String {
    "2s".to_string()
}

fn default_task_window() -> String {
    "5m".to_string()
}

fn default_task_interval() -> String {
    "500ms".to_string()
}

fn default_absence_grace_polls() -> u32 {
    1
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            task_window: default_task_window(),
            task_interval: default_task_interval(),
            absence_grace_polls: default_absence_grace_polls(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Result<Duration> {
        parse_duration(&self.interval)
    }

    pub fn task_window(&self) -> Result<Duration> {
        parse_duration(&self.task_window)
    }

    pub fn task_interval(&self) -> Result<Duration> {
        parse_duration(&self.task_interval)
    }
}

/// Session persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Persist the task collection between runs
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Snapshot file; defaults to the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist: true,
            snapshot: None,
        }
    }
}

impl SessionConfig {
    /// Resolved snapshot path, if persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if !self.persist {
            return None;
        }
        if let Some(path) = &self.snapshot {
            return Some(path.clone());
        }
        directories::ProjectDirs::from("", "", "fleetjobs")
            .map(|dirs| dirs.data_dir().join("session.json"))
    }
}

impl Config {
    /// Load configuration from a `.fleetjobs.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit config file, or `.fleetjobs.toml` from `dir` if it
    /// exists, or defaults.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = dir.join(CONFIG_FILE);
        if candidate.exists() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let base_url = self.gateway.base_url.trim();
        if base_url.is_empty() {
            return Err(Error::InvalidConfig(
                "gateway.base_url cannot be empty".to_string(),
            ));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "gateway.base_url must be an http(s) URL, got '{base_url}'"
            )));
        }
        if self.gateway.list_limit == 0 {
            return Err(Error::InvalidConfig(
                "gateway.list_limit must be > 0".to_string(),
            ));
        }
        non_zero(&self.gateway.request_timeout, "gateway.request_timeout")?;

        let interval = non_zero(&self.poll.interval, "poll.interval")?;
        let window = non_zero(&self.poll.task_window, "poll.task_window")?;
        let task_interval = non_zero(&self.poll.task_interval, "poll.task_interval")?;
        if window < task_interval {
            return Err(Error::InvalidConfig(
                "poll.task_window must be at least poll.task_interval".to_string(),
            ));
        }
        if task_interval > interval {
            tracing::warn!(
                "poll.task_interval is slower than poll.interval; per-task polling adds nothing"
            );
        }
        Ok(())
    }
}

fn non_zero(raw: &str, field: &str) -> Result<Duration> {
    let duration = parse_duration(raw)
        .map_err(|err| Error::InvalidConfig(format!("{field}: {err}")))?;
    if duration.is_zero() {
        return Err(Error::InvalidConfig(format!("{field} must be > 0")));
    }
    Ok(duration)
}

/// Parse a compact duration such as `500ms`, `2s`, `5m`, `1h` or `1d`.
/// A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::InvalidArgument("duration cannot be empty".to_string()));
    }

    let (num_str, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => (&s[..pos], s[pos..].trim()),
        None => (s, "s"),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid duration number in '{s}'")))?;

    let duration = match unit.to_lowercase().as_str() {
        "ms" | "msec" | "millis" => Duration::from_millis(num),
        "s" | "sec" | "second" | "seconds" => Duration::from_secs(num),
        "m" | "min" | "minute" | "minutes" => Duration::from_secs(num.saturating_mul(60)),
        "h" | "hr" | "hour" | "hours" => Duration::from_secs(num.saturating_mul(3600)),
        "d" | "day" | "days" => Duration::from_secs(num.saturating_mul(86_400)),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "invalid duration unit '{unit}'. Expected: ms, s, m, h, d"
            )));
        }
    };

    Ok(duration)
}

/// Render a duration in the largest unit that divides it evenly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    for (unit, size) in [("d", 86_400), ("h", 3600), ("m", 60)] {
        if secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}
