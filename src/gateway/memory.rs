//! In-process gateway.
//!
//! Holds jobs in memory and lets the caller drive their execution state.
//! Used to embed the engine without a backend and as the test double for
//! the store, scheduler and service.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use super::{
    CreateJobRequest, GatewayOp, JobPage, ListQuery, LogEntry, RemoteTaskRecord, TaskGateway,
};
use crate::error::{Error, Result};
use crate::task::{BackendId, ConnectionRef, TaskStatus};

#[derive(Default)]
struct MemoryState {
    jobs: BTreeMap<BackendId, RemoteTaskRecord>,
    logs: HashMap<BackendId, Vec<LogEntry>>,
    next_id: u64,
    failures: HashMap<GatewayOp, VecDeque<Error>>,
    holds: HashMap<GatewayOp, Arc<Semaphore>>,
    calls: HashMap<GatewayOp, usize>,
    echo_selection: bool,
    malformed: usize,
}

#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `count` records per listing that failed validation.
    pub fn malformed_records(&self, count: usize) {
        self.state().malformed = count;
    }

    /// Echo `selectedVMs` back in listings, like a backend that persists it.
    pub fn echo_selection(&self, enabled: bool) {
        self.state().echo_selection = enabled;
    }

    /// Insert a job that was created elsewhere.
    pub fn insert_job(&self, record: RemoteTaskRecord) {
        let mut state = self.state();
        state.next_id = state.next_id.max(record.backend_id.0);
        state.jobs.insert(record.backend_id, record);
    }

    /// Mutate a job in place. Returns false if the job does not exist.
    pub fn update_job(&self, id: BackendId, update: impl FnOnce(&mut RemoteTaskRecord)) -> bool {
        match self.state().jobs.get_mut(&id) {
            Some(job) => {
                update(job);
                true
            }
            None => false,
        }
    }

    /// Drive a job's execution state.
    pub fn set_status(&self, id: BackendId, status: TaskStatus, progress: u8) -> bool {
        let now = Utc::now();
        self.update_job(id, |job| {
            job.status = status;
            job.progress = progress.min(100);
            if status == TaskStatus::Running && job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if status.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(now);
            }
        })
    }

    /// Drop a job without going through the client.
    pub fn forget_job(&self, id: BackendId) -> Option<RemoteTaskRecord> {
        self.state().jobs.remove(&id)
    }

    pub fn job(&self, id: BackendId) -> Option<RemoteTaskRecord> {
        self.state().jobs.get(&id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn push_log(&self, id: BackendId, level: &str, message: &str) {
        self.state().logs.entry(id).or_default().push(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.to_string(),
        });
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: GatewayOp, error: Error) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    /// Suspend every call of `op` until [`MemoryGateway::release`].
    pub fn hold(&self, op: GatewayOp) {
        self.state()
            .holds
            .entry(op)
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: GatewayOp) {
        if let Some(gate) = self.state().holds.remove(&op) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self, op: GatewayOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, op: GatewayOp) -> Result<()> {
        let gate = {
            let mut state = self.state();
            *state.calls.entry(op).or_insert(0) += 1;
            state.holds.get(&op).cloned()
        };
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Transport("gateway closed".to_string()))?;
            permit.forget();
        }
        match self.state().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn visible(&self, record: &RemoteTaskRecord, echo_selection: bool) -> RemoteTaskRecord {
        let mut record = record.clone();
        if !echo_selection {
            record.selection = None;
        }
        record
    }

    fn allocate(&self, state: &mut MemoryState, template: RemoteTaskRecord) -> BackendId {
        state.next_id += 1;
        let id = BackendId(state.next_id);
        let mut record = template;
        record.backend_id = id;
        state.jobs.insert(id, record);
        id
    }
}

fn not_found(id: BackendId) -> Error {
    Error::Remote(format!("job {id} not found"))
}

#[async_trait]
impl TaskGateway for MemoryGateway {
    async fn create_job(&self, request: &CreateJobRequest) -> Result<BackendId> {
        self.enter(GatewayOp::Create).await?;
        let mut state = self.state();
        let mut record = RemoteTaskRecord::new(BackendId(0), request.kind, TaskStatus::Pending);
        record.display_name = Some(request.name.clone());
        record.created_at = Some(Utc::now());
        record.connection = Some(ConnectionRef {
            id: request.connection_id,
            name: request.connection_name.clone(),
            platform: request.platform.clone(),
            host: None,
        });
        record.selection = Some(request.selected_vms.clone());
        record.vm_count = u32::try_from(request.vm_count).ok();
        Ok(self.allocate(&mut state, record))
    }

    async fn list_jobs(&self, query: &ListQuery) -> Result<JobPage> {
        self.enter(GatewayOp::List).await?;
        let state = self.state();
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let records = state
            .jobs
            .values()
            .rev()
            .filter(|job| query.status.map_or(true, |status| job.status == status))
            .skip(query.offset)
            .take(limit)
            .map(|job| self.visible(job, state.echo_selection))
            .collect();
        Ok(JobPage {
            records,
            rejected: state.malformed,
        })
    }

    async fn get_job(&self, id: BackendId) -> Result<RemoteTaskRecord> {
        self.enter(GatewayOp::Get).await?;
        let state = self.state();
        state
            .jobs
            .get(&id)
            .map(|job| self.visible(job, state.echo_selection))
            .ok_or_else(|| not_found(id))
    }

    async fn stop_job(&self, id: BackendId) -> Result<()> {
        self.enter(GatewayOp::Stop).await?;
        let mut state = self.state();
        let job = state.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        if !job.status.is_terminal() {
            job.status = TaskStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn retry_job(&self, id: BackendId) -> Result<BackendId> {
        self.enter(GatewayOp::Retry).await?;
        let mut state = self.state();
        let original = state.jobs.get(&id).cloned().ok_or_else(|| not_found(id))?;
        let mut record = RemoteTaskRecord::new(BackendId(0), original.kind, TaskStatus::Pending);
        record.display_name = original
            .display_name
            .as_ref()
            .map(|name| format!("{name} (retry)"));
        record.created_at = Some(Utc::now());
        record.connection = original.connection.clone();
        record.selection = original.selection.clone();
        record.vm_count = original.vm_count;
        Ok(self.allocate(&mut state, record))
    }

    async fn delete_job(&self, id: BackendId) -> Result<()> {
        self.enter(GatewayOp::Delete).await?;
        let mut state = self.state();
        state.logs.remove(&id);
        state.jobs.remove(&id).map(|_| ()).ok_or_else(|| not_found(id))
    }

    async fn get_job_logs(&self, id: BackendId, limit: usize) -> Result<Vec<LogEntry>> {
        self.enter(GatewayOp::Logs).await?;
        let state = self.state();
        if !state.jobs.contains_key(&id) {
            return Err(not_found(id));
        }
        let logs = state.logs.get(&id).cloned().unwrap_or_default();
        let skip = logs.len().saturating_sub(limit);
        Ok(logs.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CreateTaskParams, TaskKind};

    fn request() -> CreateJobRequest {
        CreateJobRequest::from(
            &CreateTaskParams::new(TaskKind::Collection, ConnectionRef::new(7, "dc1"))
                .with_selection(["vm-1", "vm-2"]),
        )
    }

    #[tokio::test]
    async fn listing_hides_selection_unless_echoed() {
        let gateway = MemoryGateway::new();
        let id = gateway.create_job(&request()).await.expect("create");

        let listed = gateway.list_jobs(&ListQuery::first_page(10)).await.expect("list").records;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].backend_id, id);
        assert!(listed[0].selection.is_none());

        gateway.echo_selection(true);
        let listed = gateway.list_jobs(&ListQuery::first_page(10)).await.expect("list").records;
        assert_eq!(
            listed[0].selection.as_deref(),
            Some(&["vm-1".to_string(), "vm-2".to_string()][..])
        );
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_paged() {
        let gateway = MemoryGateway::new();
        let first = gateway.create_job(&request()).await.expect("create");
        let second = gateway.create_job(&request()).await.expect("create");

        let page = gateway.list_jobs(&ListQuery::first_page(1)).await.expect("list");
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].backend_id, second);

        let mut query = ListQuery::first_page(1);
        query.offset = 1;
        let page = gateway.list_jobs(&query).await.expect("list");
        assert_eq!(page.records[0].backend_id, first);
        assert_eq!(page.rejected, 0);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(GatewayOp::List, Error::Transport("timeout".to_string()));
        assert!(gateway.list_jobs(&ListQuery::first_page(10)).await.is_err());
        assert!(gateway.list_jobs(&ListQuery::first_page(10)).await.is_ok());
        assert_eq!(gateway.calls(GatewayOp::List), 2);
    }

    #[tokio::test]
    async fn retry_creates_a_new_pending_job() {
        let gateway = MemoryGateway::new();
        let id = gateway.create_job(&request()).await.expect("create");
        gateway.set_status(id, TaskStatus::Failed, 30);

        let retried = gateway.retry_job(id).await.expect("retry");
        assert_ne!(retried, id);
        let job = gateway.job(retried).expect("job");
        assert_eq!(job.status, TaskStatus::Pending);
        assert_eq!(job.display_name.as_deref(), Some("dc1 collection (retry)"));
        assert_eq!(gateway.job(id).expect("original").status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn logs_return_the_most_recent_entries() {
        let gateway = MemoryGateway::new();
        let id = gateway.create_job(&request()).await.expect("create");
        for n in 0..5 {
            gateway.push_log(id, "info", &format!("step {n}"));
        }
        let logs = gateway.get_job_logs(id, 2).await.expect("logs");
        let messages: Vec<_> = logs.iter().map(|entry| entry.message.as_str()).collect();
        assert_eq!(messages, vec!["step 3", "step 4"]);
    }
}
