//! Poll scheduler.
//!
//! One baseline loop lists remote jobs on a fixed interval and feeds the
//! result to the store for the whole session. Newly submitted jobs also get
//! a bounded polling window with a faster interval and an absolute
//! deadline; a job still `running` when the deadline passes is failed
//! locally.
//!
//! Every loop is driven by a [`CancellationToken`], so stop is always
//! paired with start and repeated start/stop cycles never leave a second
//! timer behind.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::gateway::ListQuery;
use crate::store::{SnapshotReport, TaskStore};
use crate::task::{LocalId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub task_window: Duration,
    pub task_interval: Duration,
    pub list_limit: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            task_window: Duration::from_secs(300),
            task_interval: Duration::from_millis(500),
            list_limit: 100,
        }
    }
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            interval: config.poll.interval()?,
            task_window: config.poll.task_window()?,
            task_interval: config.poll.task_interval()?,
            list_limit: config.gateway.list_limit,
        })
    }
}

/// How a bounded polling window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum WindowOutcome {
    /// The task reached a terminal status.
    Settled(TaskStatus),
    /// The deadline passed while the task was running; it was failed.
    TimedOut,
    /// The deadline passed while the task was not running.
    Expired(TaskStatus),
    /// The task left the store.
    Removed,
    /// The scheduler was stopped.
    Cancelled,
}

struct Baseline {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SchedulerState {
    baseline: Option<Baseline>,
    windows: CancellationToken,
}

pub struct PollScheduler {
    store: Arc<TaskStore>,
    settings: PollSettings,
    state: Mutex<SchedulerState>,
}

impl PollScheduler {
    pub fn new(store: Arc<TaskStore>, settings: PollSettings) -> Self {
        Self {
            store,
            settings,
            state: Mutex::new(SchedulerState {
                baseline: None,
                windows: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Start the baseline loop. Returns false if it is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut state = self.state();
        if let Some(baseline) = &state.baseline {
            if !baseline.handle.is_finished() {
                return false;
            }
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_baseline(
            Arc::clone(&self.store),
            self.settings,
            token.clone(),
        ));
        state.baseline = Some(Baseline { token, handle });
        info!(interval = ?self.settings.interval, "poll scheduler started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.state()
            .baseline
            .as_ref()
            .is_some_and(|baseline| !baseline.handle.is_finished())
    }

    /// Stop the baseline loop and every open polling window, and wait for
    /// the loop to exit. Returns false if nothing was running.
    pub async fn stop(&self) -> bool {
        let baseline = {
            let mut state = self.state();
            state.windows.cancel();
            state.windows = CancellationToken::new();
            state.baseline.take()
        };
        let Some(baseline) = baseline else {
            return false;
        };
        baseline.token.cancel();
        if let Err(err) = baseline.handle.await {
            warn!(error = %err, "poll loop ended abnormally");
        }
        info!("poll scheduler stopped");
        true
    }

    /// One list poll. Failures are logged and leave the store untouched.
    pub async fn poll_once(&self) -> Option<SnapshotReport> {
        poll(&self.store, &self.settings).await
    }

    /// Open a bounded polling window for a newly submitted task.
    pub fn watch_task(&self, id: LocalId) -> JoinHandle<WindowOutcome> {
        let token = self.state().windows.child_token();
        debug!(task = %id, window = ?self.settings.task_window, "opened polling window");
        tokio::spawn(run_window(
            Arc::clone(&self.store),
            self.settings,
            id,
            token,
        ))
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.windows.cancel();
        if let Some(baseline) = state.baseline.take() {
            baseline.token.cancel();
        }
    }
}

async fn poll(store: &TaskStore, settings: &PollSettings) -> Option<SnapshotReport> {
    let query = ListQuery::first_page(settings.list_limit);
    match store.gateway().list_jobs(&query).await {
        Ok(page) => {
            if page.rejected > 0 {
                debug!(
                    rejected = page.rejected,
                    "listing had invalid records; skipping absence check"
                );
                Some(store.apply_remote_records(page.records))
            } else if page.listed() >= settings.list_limit {
                debug!(
                    records = page.records.len(),
                    "listing may be truncated; skipping absence check"
                );
                Some(store.apply_remote_records(page.records))
            } else {
                Some(store.apply_remote_snapshot(page.records))
            }
        }
        Err(err) => {
            warn!(error = %err, "poll failed; keeping last known state");
            None
        }
    }
}

async fn run_baseline(store: Arc<TaskStore>, settings: PollSettings, token: CancellationToken) {
    let mut ticker = time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = poll(&store, &settings) => {}
        }
    }
    debug!("poll loop exited");
}

async fn run_window(
    store: Arc<TaskStore>,
    settings: PollSettings,
    id: LocalId,
    token: CancellationToken,
) -> WindowOutcome {
    let deadline = Instant::now() + settings.task_window;
    let mut ticker = time::interval(settings.task_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return WindowOutcome::Cancelled,
            _ = time::sleep_until(deadline) => return expire(&store, &id, settings.task_window),
            _ = ticker.tick() => {}
        }

        let Some(task) = store.get(&id) else {
            return WindowOutcome::Removed;
        };
        if task.status.is_terminal() {
            debug!(task = %id, status = %task.status, "polling window settled");
            return WindowOutcome::Settled(task.status);
        }
        // Still waiting for the create response.
        let Some(backend) = task.backend_id else {
            continue;
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return WindowOutcome::Cancelled,
            _ = time::sleep_until(deadline) => return expire(&store, &id, settings.task_window),
            result = store.gateway().get_job(backend) => match result {
                Ok(record) => {
                    store.apply_remote_records(vec![record]);
                }
                Err(err) => debug!(task = %id, error = %err, "window poll failed"),
            }
        }
    }
}

fn expire(store: &TaskStore, id: &LocalId, window: Duration) -> WindowOutcome {
    match store.fail_timed_out(id, window) {
        Ok(true) => WindowOutcome::TimedOut,
        Ok(false) => match store.get(id) {
            Some(task) if task.status.is_terminal() => WindowOutcome::Settled(task.status),
            Some(task) => WindowOutcome::Expired(task.status),
            None => WindowOutcome::Removed,
        },
        Err(_) => WindowOutcome::Removed,
    }
}
