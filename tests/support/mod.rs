#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleetjobs::gateway::MemoryGateway;
use fleetjobs::task::{BackendId, ConnectionRef, CreateTaskParams, TaskKind, TaskStatus};
use fleetjobs::{PollSettings, RemoteTaskRecord, TaskService, TaskStore};
use tempfile::TempDir;

/// A service wired to an in-memory backend.
pub struct Harness {
    pub gateway: Arc<MemoryGateway>,
    pub service: Arc<TaskService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(PollSettings::default(), 1)
    }

    pub fn with_settings(settings: PollSettings, grace_polls: u32) -> Self {
        let gateway = Arc::new(MemoryGateway::new());
        let service = Arc::new(TaskService::new(gateway.clone(), settings, grace_polls));
        Self { gateway, service }
    }

    pub fn store(&self) -> &TaskStore {
        self.service.store()
    }
}

pub fn dc1() -> ConnectionRef {
    ConnectionRef::new(7, "dc1")
}

pub fn collection_params() -> CreateTaskParams {
    CreateTaskParams::new(TaskKind::Collection, dc1()).with_selection(["vm-1", "vm-2"])
}

pub fn record(id: u64, status: TaskStatus, progress: u8) -> RemoteTaskRecord {
    RemoteTaskRecord::new(BackendId(id), TaskKind::Collection, status)
        .with_progress(progress)
        .with_connection(dc1())
}

pub fn selection(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Yield until `condition` holds, for work spawned on the test runtime.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Temp directory with a config pointing at an unreachable backend.
pub struct CliEnv {
    dir: TempDir,
}

impl CliEnv {
    pub fn new() -> Self {
        let env = Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
        };
        let config = format!(
            "[gateway]\nbase_url = \"http://127.0.0.1:9\"\nrequest_timeout = \"500ms\"\n\n[session]\nsnapshot = \"{}\"\n",
            env.session_path().display()
        );
        env.write_file(".fleetjobs.toml", &config)
            .expect("write config");
        env
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.path().join("session.json")
    }

    pub fn write_file(&self, rel_path: &str, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("fleetjobs").expect("binary");
        cmd.current_dir(self.path())
            .env_remove("FLEETJOBS_CONFIG")
            .env_remove("RUST_LOG");
        cmd
    }
}
