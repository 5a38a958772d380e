//! Task service: the operations exposed to the UI layer.
//!
//! Wires the store, the gateway and the poll scheduler together. Mutating
//! operations surface gateway failures to the caller and never retry on
//! their own; background polling never surfaces anything.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::StoreEvent;
use crate::gateway::{CreateJobRequest, HttpGateway, LogEntry, TaskGateway};
use crate::scheduler::{PollScheduler, PollSettings};
use crate::store::{ops, SnapshotReport, StoreSettings, TaskStore};
use crate::task::{BackendId, CreateTaskParams, LocalId, Task, TaskStatus};

const RETRY_SUFFIX: &str = " (retry)";

pub struct TaskService {
    store: Arc<TaskStore>,
    scheduler: PollScheduler,
}

impl TaskService {
    pub fn new(gateway: Arc<dyn TaskGateway>, settings: PollSettings, grace_polls: u32) -> Self {
        let store = Arc::new(TaskStore::new(
            gateway,
            StoreSettings::for_polling(settings.interval, grace_polls),
        ));
        let scheduler = PollScheduler::new(Arc::clone(&store), settings);
        Self { store, scheduler }
    }

    /// Service talking to the backend configured in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let gateway = HttpGateway::from_config(&config.gateway)?;
        Self::with_gateway(config, Arc::new(gateway))
    }

    pub fn with_gateway(config: &Config, gateway: Arc<dyn TaskGateway>) -> Result<Self> {
        let settings = PollSettings::from_config(config)?;
        Ok(Self::new(gateway, settings, config.poll.absence_grace_polls))
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    /// Start background polling. Returns false if it already runs.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }

    /// Poll the backend once, outside the timer.
    pub async fn sync(&self) -> Option<SnapshotReport> {
        self.scheduler.poll_once().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn resolve(&self, input: &str) -> Result<LocalId> {
        self.store.resolve(input)
    }

    pub fn list(&self) -> Vec<Task> {
        self.store.list()
    }

    pub fn get(&self, id: &LocalId) -> Result<Task> {
        self.store
            .get(id)
            .ok_or_else(|| Error::UnknownLocalId(id.to_string()))
    }

    /// Submit a new job. The task shows up as `pending` immediately and is
    /// dropped again if the backend rejects it.
    pub async fn create(&self, params: CreateTaskParams) -> Result<Task> {
        if params.connection.id == 0 {
            return Err(Error::InvalidArgument(
                "a connection id is required".to_string(),
            ));
        }

        let request = CreateJobRequest::from(&params);
        let (task, guard) = self.store.create_optimistic_in_flight(params, ops::CREATE);

        let backend = match self.store.gateway().create_job(&request).await {
            Ok(backend) => backend,
            Err(err) => {
                drop(guard);
                self.store.discard_optimistic(&task.id);
                warn!(task = %task.id, error = %err, "create rejected");
                return Err(err);
            }
        };

        let bound = self.store.bind_backend_id(&task.id, backend);
        drop(guard);
        if let Err(err) = bound {
            warn!(
                task = %task.id,
                backend_id = %backend,
                error = %err,
                "could not bind created job"
            );
            return Err(err);
        }
        info!(task = %task.id, backend_id = %backend, "job submitted");
        self.scheduler.watch_task(task.id.clone());
        self.get(&task.id)
    }

    /// Stop a running job. Stopping a finished task does nothing.
    pub async fn stop(&self, id: &LocalId) -> Result<Task> {
        let _guard = self.store.begin(id, ops::STOP)?;
        let task = self.get(id)?;
        if task.status.is_terminal() {
            debug!(task = %id, status = %task.status, "stop on finished task");
            return Ok(task);
        }
        let backend = submitted(&task)?;
        self.store.gateway().stop_job(backend).await?;
        self.store.mark_cancelled(id)
    }

    /// Re-run a finished job as a brand-new task.
    pub async fn retry(&self, id: &LocalId) -> Result<Task> {
        let _guard = self.store.begin(id, ops::RETRY)?;
        let original = self.get(id)?;
        if !original.status.is_terminal() {
            return Err(Error::InvalidArgument(format!(
                "task {id} is {}; only finished tasks can be retried",
                original.status
            )));
        }
        let backend = submitted(&original)?;
        let new_backend = self.store.gateway().retry_job(backend).await?;

        let mut params = original.params();
        params.display_name = retry_name(&original.display_name);
        let task = self.store.create_optimistic(params);
        self.store.bind_backend_id(&task.id, new_backend)?;
        info!(task = %task.id, retry_of = %id, backend_id = %new_backend, "job retried");
        self.scheduler.watch_task(task.id.clone());
        self.get(&task.id)
    }

    /// Delete a task locally and remotely; restored if the backend refuses.
    pub async fn delete(&self, id: &LocalId) -> Result<Task> {
        self.store.remove(id).await
    }

    pub async fn logs(&self, id: &LocalId, limit: usize) -> Result<Vec<LogEntry>> {
        let task = self.get(id)?;
        let backend = submitted(&task)?;
        self.store.gateway().get_job_logs(backend, limit).await
    }

    pub fn pause(&self, id: &LocalId) -> Result<Task> {
        self.store.pause(id)
    }

    pub fn resume(&self, id: &LocalId) -> Result<Task> {
        self.store.resume(id)
    }

    /// Drop finished tasks from the local collection.
    pub fn clear_finished(&self) -> Vec<LocalId> {
        self.store.clear_finished()
    }

    /// True while any task is pending, running or paused.
    pub fn is_busy(&self) -> bool {
        self.store.has_active_tasks()
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_tasks(&self.store.list())
    }
}

fn submitted(task: &Task) -> Result<BackendId> {
    task.backend_id
        .ok_or_else(|| Error::NotSubmitted(task.id.to_string()))
}

fn retry_name(name: &str) -> String {
    format!("{name}{RETRY_SUFFIX}")
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            let slot = match task.status {
                TaskStatus::Pending => &mut counts.pending,
                TaskStatus::Running => &mut counts.running,
                TaskStatus::Paused => &mut counts.paused,
                TaskStatus::Completed => &mut counts.completed,
                TaskStatus::Failed => &mut counts.failed,
                TaskStatus::Cancelled => &mut counts.cancelled,
                TaskStatus::Unknown => &mut counts.unknown,
            };
            *slot += 1;
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.running
            + self.paused
            + self.completed
            + self.failed
            + self.cancelled
            + self.unknown
    }
}
