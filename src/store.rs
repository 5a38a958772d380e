//! Task state store.
//!
//! The single source of truth for the locally held task collection. All
//! mutation goes through [`TaskStore`]; the state lives behind one mutex
//! that is never held across an `.await`, so every operation runs to
//! completion before the next one observes the collection.
//!
//! The only suspension point inside the store is the gateway delete issued
//! by [`TaskStore::remove`], which is guarded so the removal is rolled back
//! if the call fails or is abandoned.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::format_duration;
use crate::error::{Error, Result};
use crate::events::StoreEvent;
use crate::gateway::{RemoteTaskRecord, TaskGateway};
use crate::identity::{self, BindOutcome, IdentityMap};
use crate::reconcile;
use crate::task::{BackendId, CreateTaskParams, LocalId, Task, TaskOrigin, TaskPatch, TaskStatus};

const EVENT_CAPACITY: usize = 256;

/// Operation names used for in-flight tracking.
pub mod ops {
    pub const CREATE: &str = "create";
    pub const STOP: &str = "stop";
    pub const RETRY: &str = "retry";
    pub const DELETE: &str = "delete";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// How long a bound task may be missing from complete snapshots before
    /// it is marked `unknown`.
    pub absence_grace: Duration,
}

impl StoreSettings {
    /// Grace of `grace_polls` poll cycles. Half an interval of slack keeps a
    /// slightly early tick from counting as a full cycle.
    pub fn for_polling(interval: Duration, grace_polls: u32) -> Self {
        let absence_grace = interval
            .saturating_mul(grace_polls)
            .saturating_sub(interval / 2);
        Self { absence_grace }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::for_polling(Duration::from_secs(2), 1)
    }
}

/// Outcome of applying one batch of remote records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub records: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub discovered: usize,
    pub bound_by_heuristic: usize,
    pub marked_unknown: usize,
    /// Records ignored because their task is being deleted.
    pub skipped: usize,
}

impl SnapshotReport {
    pub fn changed(&self) -> usize {
        self.updated + self.discovered + self.bound_by_heuristic + self.marked_unknown
    }
}

#[derive(Default)]
struct StoreState {
    /// Most recent first.
    tasks: Vec<Task>,
    identity: IdentityMap,
    in_flight: HashMap<LocalId, &'static str>,
    absent_since: HashMap<LocalId, Instant>,
    pending_delete: HashMap<BackendId, LocalId>,
    /// Bumped whenever the collection is replaced wholesale.
    generation: u64,
}

impl StoreState {
    fn position(&self, id: &LocalId) -> Option<usize> {
        self.tasks.iter().position(|task| &task.id == id)
    }

    fn task(&self, id: &LocalId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    fn task_mut(&mut self, id: &LocalId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| &task.id == id)
    }

    /// Insert keeping most-recent-first order.
    fn insert_by_created(&mut self, task: Task) {
        let at = self
            .tasks
            .iter()
            .position(|existing| existing.created_at < task.created_at)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(at, task);
    }

    fn in_flight_creates(&self) -> HashSet<LocalId> {
        self.in_flight
            .iter()
            .filter(|(_, op)| **op == ops::CREATE)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

pub struct TaskStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
    gateway: Arc<dyn TaskGateway>,
    settings: StoreSettings,
}

impl TaskStore {
    pub fn new(gateway: Arc<dyn TaskGateway>, settings: StoreSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            events,
            gateway,
            settings,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn TaskGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings
    }

    /// Observe every change to the collection.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Insert a pending task at the head of the collection. Does not
    /// contact the gateway.
    pub fn create_optimistic(&self, params: CreateTaskParams) -> Task {
        self.insert_optimistic(params, None)
    }

    /// Insert a pending task with `op` already marked in flight, under the
    /// same lock, so no listing can bind it before the guard exists.
    pub fn create_optimistic_in_flight(
        &self,
        params: CreateTaskParams,
        op: &'static str,
    ) -> (Task, InFlightGuard<'_>) {
        let task = self.insert_optimistic(params, Some(op));
        let guard = InFlightGuard {
            store: self,
            id: task.id.clone(),
        };
        (task, guard)
    }

    fn insert_optimistic(&self, params: CreateTaskParams, op: Option<&'static str>) -> Task {
        let task = Task {
            id: LocalId::generate(),
            backend_id: None,
            kind: params.kind,
            display_name: params.display_name,
            status: TaskStatus::Pending,
            progress_percent: 0,
            current_step: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            connection: Some(params.connection),
            selection: params.selection,
            analysis_completion: Default::default(),
            vm_count: None,
            collected_vm_count: None,
            origin: TaskOrigin::Local,
            timed_out: false,
        };

        let mut state = self.state();
        state.tasks.insert(0, task.clone());
        if let Some(op) = op {
            state.in_flight.insert(task.id.clone(), op);
        }
        info!(task = %task.id, kind = %task.kind, "created optimistic task");
        self.publish(StoreEvent::TaskInserted {
            task: Box::new(task.clone()),
        });
        task
    }

    /// Record that the backend accepted `local` as `backend`.
    ///
    /// If a poll already synthesized a task for `backend`, that entry is
    /// folded into `local`.
    pub fn bind_backend_id(&self, local: &LocalId, backend: BackendId) -> Result<()> {
        let mut state = self.state();
        if state.position(local).is_none() {
            return Err(Error::UnknownLocalId(local.to_string()));
        }

        if let Some(owner) = state.identity.local_for(backend).cloned() {
            if &owner != local {
                self.absorb_discovered(&mut state, local, &owner, backend)?;
            }
        }

        if state.identity.bind(local, backend)? == BindOutcome::AlreadyBound {
            return Ok(());
        }
        state.absent_since.remove(local);
        let task = match state.task_mut(local) {
            Some(task) => {
                task.backend_id = Some(backend);
                task.clone()
            }
            None => return Err(Error::UnknownLocalId(local.to_string())),
        };
        info!(task = %local, backend_id = %backend, "bound backend id");
        self.publish(StoreEvent::TaskBound {
            id: local.clone(),
            backend_id: backend,
        });
        self.publish(StoreEvent::TaskUpdated {
            task: Box::new(task),
        });
        Ok(())
    }

    fn absorb_discovered(
        &self,
        state: &mut StoreState,
        local: &LocalId,
        owner: &LocalId,
        backend: BackendId,
    ) -> Result<()> {
        let conflict = || Error::BackendIdConflict {
            backend_id: backend.to_string(),
            bound_to: owner.to_string(),
        };
        let local_unbound = state.task(local).is_some_and(|task| !task.is_bound());
        let discovered = state
            .task(owner)
            .is_some_and(|task| task.origin == TaskOrigin::Discovered);
        if !local_unbound || !discovered || state.in_flight.contains_key(owner) {
            return Err(conflict());
        }

        let Some(index) = state.position(owner) else {
            return Err(conflict());
        };
        let synthesized = state.tasks.remove(index);
        state.identity.unbind(owner);
        state.absent_since.remove(owner);
        if let Some(task) = state.task_mut(local) {
            adopt_execution_state(task, &synthesized);
        }
        debug!(task = %local, absorbed = %owner, "absorbed discovered duplicate");
        self.publish(StoreEvent::TaskRemoved { id: owner.clone() });
        Ok(())
    }

    /// Apply a complete listing: merge every record, then mark bound tasks
    /// missing from it as `unknown` once their grace period ran out.
    pub fn apply_remote_snapshot(&self, records: Vec<RemoteTaskRecord>) -> SnapshotReport {
        self.apply(records, true)
    }

    /// Apply records that may not cover every remote job (a truncated page,
    /// a single fetched job). No absence tracking.
    pub fn apply_remote_records(&self, records: Vec<RemoteTaskRecord>) -> SnapshotReport {
        self.apply(records, false)
    }

    fn apply(&self, records: Vec<RemoteTaskRecord>, complete: bool) -> SnapshotReport {
        let now = Utc::now();
        let mut report = SnapshotReport {
            records: records.len(),
            ..SnapshotReport::default()
        };

        let mut state = self.state();
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            seen.insert(record.backend_id);
            if state.pending_delete.contains_key(&record.backend_id) {
                report.skipped += 1;
                continue;
            }
            self.apply_record(&mut state, record, now, &mut report);
        }

        if complete {
            self.sweep_absent(&mut state, &seen, &mut report);
        }

        if report.changed() > 0 {
            debug!(?report, "applied remote records");
            self.publish(StoreEvent::SnapshotApplied {
                records: report.records,
                changed: report.changed(),
            });
        }
        report
    }

    fn apply_record(
        &self,
        state: &mut StoreState,
        record: &RemoteTaskRecord,
        now: chrono::DateTime<Utc>,
        report: &mut SnapshotReport,
    ) {
        if let Some(local) = state.identity.local_for(record.backend_id).cloned() {
            state.absent_since.remove(&local);
            let Some(index) = state.position(&local) else {
                warn!(
                    task = %local,
                    backend_id = %record.backend_id,
                    "binding without task; dropping"
                );
                state.identity.unbind(&local);
                return;
            };
            let merged = reconcile::merge(Some(&state.tasks[index]), record, now);
            if merged == state.tasks[index] {
                report.unchanged += 1;
                return;
            }
            if merged.status != state.tasks[index].status {
                info!(
                    task = %local,
                    from = %state.tasks[index].status,
                    to = %merged.status,
                    "task status changed"
                );
            }
            state.tasks[index] = merged.clone();
            report.updated += 1;
            self.publish(StoreEvent::TaskUpdated {
                task: Box::new(merged),
            });
            return;
        }

        let excluded = state.in_flight_creates();
        if let Some(local) = identity::match_unbound(&state.tasks, record, &excluded) {
            if let Err(err) = state.identity.bind(&local, record.backend_id) {
                warn!(task = %local, error = %err, "heuristic binding rejected");
                return;
            }
            let Some(index) = state.position(&local) else {
                return;
            };
            let merged = reconcile::merge(Some(&state.tasks[index]), record, now);
            state.tasks[index] = merged.clone();
            report.bound_by_heuristic += 1;
            warn!(
                task = %local,
                backend_id = %record.backend_id,
                "bound unconfirmed task to remote job by kind and connection"
            );
            self.publish(StoreEvent::TaskBound {
                id: local,
                backend_id: record.backend_id,
            });
            self.publish(StoreEvent::TaskUpdated {
                task: Box::new(merged),
            });
            return;
        }

        let task = reconcile::synthesize(record, now);
        if let Err(err) = state.identity.bind(&task.id, record.backend_id) {
            warn!(backend_id = %record.backend_id, error = %err, "cannot track remote job");
            return;
        }
        info!(task = %task.id, backend_id = %record.backend_id, "discovered remote job");
        state.insert_by_created(task.clone());
        report.discovered += 1;
        self.publish(StoreEvent::TaskInserted {
            task: Box::new(task),
        });
    }

    fn sweep_absent(
        &self,
        state: &mut StoreState,
        seen: &HashSet<BackendId>,
        report: &mut SnapshotReport,
    ) {
        let now = Instant::now();
        let grace = self.settings.absence_grace;
        let mut still_absent = HashSet::new();
        let mut expired = Vec::new();

        for task in &state.tasks {
            let Some(backend) = task.backend_id else {
                continue;
            };
            if seen.contains(&backend)
                || task.status.is_terminal()
                || task.status == TaskStatus::Unknown
                || state.pending_delete.contains_key(&backend)
            {
                continue;
            }
            still_absent.insert(task.id.clone());
            let since = state.absent_since.get(&task.id).copied().unwrap_or(now);
            if now.saturating_duration_since(since) >= grace {
                expired.push(task.id.clone());
            }
        }

        for id in &still_absent {
            state.absent_since.entry(id.clone()).or_insert(now);
        }
        for id in expired {
            state.absent_since.remove(&id);
            still_absent.remove(&id);
            let Some(task) = state.task_mut(&id) else {
                continue;
            };
            let previous = task.status;
            task.status = TaskStatus::Unknown;
            let task = task.clone();
            report.marked_unknown += 1;
            warn!(task = %id, %previous, "task missing from remote listing; marked unknown");
            self.publish(StoreEvent::TaskMarkedUnknown {
                id: id.clone(),
                previous,
            });
            self.publish(StoreEvent::TaskUpdated {
                task: Box::new(task),
            });
        }
        state.absent_since.retain(|id, _| still_absent.contains(id));
    }

    /// Apply a user-initiated change to local-only fields.
    pub fn mutate_local(&self, id: &LocalId, patch: TaskPatch) -> Result<Task> {
        let mut state = self.state();
        let task = state
            .task_mut(id)
            .ok_or_else(|| Error::UnknownLocalId(id.to_string()))?;
        let before = task.clone();
        patch.apply(task);
        let after = task.clone();
        if after != before {
            self.publish(StoreEvent::TaskUpdated {
                task: Box::new(after.clone()),
            });
        }
        Ok(after)
    }

    /// Remove a task locally and delete its job remotely. If the remote
    /// delete fails the task is put back in creation order.
    pub async fn remove(&self, id: &LocalId) -> Result<Task> {
        let removal = self.take_for_removal(id)?;
        let Some(backend) = removal.backend else {
            info!(task = %id, "removed unsubmitted task");
            return Ok(removal.commit());
        };

        match self.gateway.delete_job(backend).await {
            Ok(()) => {
                info!(task = %id, backend_id = %backend, "deleted task");
                Ok(removal.commit())
            }
            Err(err) => {
                warn!(
                    task = %id,
                    backend_id = %backend,
                    error = %err,
                    "remote delete failed; restoring task"
                );
                drop(removal);
                Err(err)
            }
        }
    }

    fn take_for_removal(&self, id: &LocalId) -> Result<Removal<'_>> {
        let mut state = self.state();
        if let Some(op) = state.in_flight.get(id).copied() {
            return Err(Error::AlreadyInFlight {
                id: id.to_string(),
                op,
            });
        }
        let index = state
            .position(id)
            .ok_or_else(|| Error::UnknownLocalId(id.to_string()))?;
        let generation = state.generation;
        let task = state.tasks.remove(index);
        let backend = state.identity.unbind(id);
        if let Some(backend) = backend {
            state.pending_delete.insert(backend, id.clone());
        }
        state.absent_since.remove(id);
        state.in_flight.insert(id.clone(), ops::DELETE);
        self.publish(StoreEvent::TaskRemoved { id: id.clone() });
        Ok(Removal {
            store: self,
            generation,
            backend,
            task,
            committed: false,
        })
    }

    /// Mark a mutating operation as in flight for `id` until the returned
    /// guard is dropped.
    pub fn begin(&self, id: &LocalId, op: &'static str) -> Result<InFlightGuard<'_>> {
        let mut state = self.state();
        if state.position(id).is_none() {
            return Err(Error::UnknownLocalId(id.to_string()));
        }
        if let Some(current) = state.in_flight.get(id).copied() {
            return Err(Error::AlreadyInFlight {
                id: id.to_string(),
                op: current,
            });
        }
        state.in_flight.insert(id.clone(), op);
        Ok(InFlightGuard {
            store: self,
            id: id.clone(),
        })
    }

    pub fn in_flight(&self, id: &LocalId) -> Option<&'static str> {
        self.state().in_flight.get(id).copied()
    }

    /// Drop an optimistic task whose submission failed. Bound tasks are
    /// left alone.
    pub fn discard_optimistic(&self, id: &LocalId) -> Option<Task> {
        let mut state = self.state();
        let index = state.position(id)?;
        if state.tasks[index].is_bound() {
            return None;
        }
        let task = state.tasks.remove(index);
        debug!(task = %id, "discarded optimistic task");
        self.publish(StoreEvent::TaskRemoved { id: id.clone() });
        Some(task)
    }

    /// Record a stop the backend accepted.
    pub fn mark_cancelled(&self, id: &LocalId) -> Result<Task> {
        let mut state = self.state();
        let task = state
            .task_mut(id)
            .ok_or_else(|| Error::UnknownLocalId(id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(task.clone());
        }
        task.status = TaskStatus::Cancelled;
        task.ended_at.get_or_insert_with(Utc::now);
        let task = task.clone();
        info!(task = %id, "task cancelled");
        self.publish(StoreEvent::TaskUpdated {
            task: Box::new(task.clone()),
        });
        Ok(task)
    }

    /// Fail a task whose polling window ran out while it was still running.
    /// Returns false when the task is not running.
    pub fn fail_timed_out(&self, id: &LocalId, window: Duration) -> Result<bool> {
        let mut state = self.state();
        let task = state
            .task_mut(id)
            .ok_or_else(|| Error::UnknownLocalId(id.to_string()))?;
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        task.status = TaskStatus::Failed;
        let timeout = Error::RemoteTaskTimeout(format_duration(window));
        task.error_message = Some(timeout.to_string());
        task.ended_at = Some(Utc::now());
        task.timed_out = true;
        let task = task.clone();
        warn!(task = %id, "polling window elapsed; task failed locally");
        self.publish(StoreEvent::TaskTimedOut { id: id.clone() });
        self.publish(StoreEvent::TaskUpdated {
            task: Box::new(task),
        });
        Ok(true)
    }

    /// Pause a task. The backend cannot pause jobs, so for a submitted task
    /// this only logs.
    pub fn pause(&self, id: &LocalId) -> Result<Task> {
        self.toggle_pause(id, TaskStatus::Running, TaskStatus::Paused, "pause")
    }

    pub fn resume(&self, id: &LocalId) -> Result<Task> {
        self.toggle_pause(id, TaskStatus::Paused, TaskStatus::Running, "resume")
    }

    fn toggle_pause(
        &self,
        id: &LocalId,
        from: TaskStatus,
        to: TaskStatus,
        action: &str,
    ) -> Result<Task> {
        let mut state = self.state();
        let task = state
            .task_mut(id)
            .ok_or_else(|| Error::UnknownLocalId(id.to_string()))?;
        if task.is_bound() {
            warn!(task = %id, "{action} is not supported by the backend; ignoring");
            return Ok(task.clone());
        }
        if task.status != from {
            debug!(task = %id, status = %task.status, "{action} does not apply");
            return Ok(task.clone());
        }
        task.status = to;
        let task = task.clone();
        self.publish(StoreEvent::TaskUpdated {
            task: Box::new(task.clone()),
        });
        Ok(task)
    }

    pub fn get(&self, id: &LocalId) -> Option<Task> {
        self.state().task(id).cloned()
    }

    /// All tasks, most recent first.
    pub fn list(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    pub fn len(&self) -> usize {
        self.state().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().tasks.is_empty()
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.state()
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Running)
            .cloned()
            .collect()
    }

    pub fn has_running_tasks(&self) -> bool {
        self.state()
            .tasks
            .iter()
            .any(|task| task.status == TaskStatus::Running)
    }

    /// Any task pending, running or paused.
    pub fn has_active_tasks(&self) -> bool {
        self.state().tasks.iter().any(|task| task.status.is_active())
    }

    pub fn find_by_backend_id(&self, backend: BackendId) -> Option<Task> {
        let state = self.state();
        let local = state.identity.local_for(backend)?;
        state.task(local).cloned()
    }

    pub fn backend_id(&self, id: &LocalId) -> Option<BackendId> {
        self.state().identity.backend_for(id)
    }

    /// Resolve user input (local id, prefix or backend id) to a local id.
    pub fn resolve(&self, input: &str) -> Result<LocalId> {
        let state = self.state();
        identity::resolve(input, &state.tasks, &state.identity)
    }

    /// Drop finished (terminal or vanished) tasks locally. Returns the
    /// removed ids.
    pub fn clear_finished(&self) -> Vec<LocalId> {
        let mut state = self.state();
        let finished: Vec<LocalId> = state
            .tasks
            .iter()
            .filter(|task| task.status.is_terminal() || task.status == TaskStatus::Unknown)
            .filter(|task| !state.in_flight.contains_key(&task.id))
            .map(|task| task.id.clone())
            .collect();
        for id in &finished {
            if let Some(index) = state.position(id) {
                state.tasks.remove(index);
            }
            state.identity.unbind(id);
            state.absent_since.remove(id);
            self.publish(StoreEvent::TaskRemoved { id: id.clone() });
        }
        finished
    }

    /// Drop every task and binding. Operations still in flight lose their
    /// claim on the store: a delete failing afterwards restores nothing.
    pub fn reset(&self) {
        let mut state = self.state();
        state.tasks.clear();
        state.identity.clear();
        state.absent_since.clear();
        state.in_flight.clear();
        state.pending_delete.clear();
        state.generation += 1;
        info!("task store reset");
        self.publish(StoreEvent::StoreReset);
    }

    /// Replace the collection with previously saved tasks.
    pub fn restore(&self, tasks: Vec<Task>) -> Result<usize> {
        let identity = IdentityMap::from_tasks(&tasks)?;
        let mut seen = HashSet::new();
        if let Some(dup) = tasks.iter().find(|task| !seen.insert(task.id.clone())) {
            return Err(Error::InvalidArgument(format!(
                "duplicate task id {} in saved session",
                dup.id
            )));
        }

        let mut state = self.state();
        state.tasks = tasks;
        state.identity = identity;
        state.absent_since.clear();
        state.in_flight.clear();
        state.pending_delete.clear();
        state.generation += 1;
        for task in &state.tasks {
            self.publish(StoreEvent::TaskInserted {
                task: Box::new(task.clone()),
            });
        }
        debug!(count = state.tasks.len(), "restored tasks");
        Ok(state.tasks.len())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// Execution state of a synthesized task carried over when its job turns
/// out to belong to an optimistic task.
fn adopt_execution_state(task: &mut Task, source: &Task) {
    task.status = source.status;
    task.progress_percent = source.progress_percent;
    task.current_step = source.current_step.clone();
    task.error_message = source.error_message.clone();
    task.started_at = source.started_at;
    task.ended_at = source.ended_at;
    if source.vm_count.is_some() {
        task.vm_count = source.vm_count;
    }
    if source.collected_vm_count.is_some() {
        task.collected_vm_count = source.collected_vm_count;
    }
    for (kind, done) in &source.analysis_completion {
        task.analysis_completion.entry(*kind).or_insert(*done);
    }
}

/// Clears the in-flight mark of a task on drop.
pub struct InFlightGuard<'a> {
    store: &'a TaskStore,
    id: LocalId,
}

impl InFlightGuard<'_> {
    pub fn id(&self) -> &LocalId {
        &self.id
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.store.state().in_flight.remove(&self.id);
    }
}

/// A task taken out of the collection while its remote delete runs.
/// Restored on drop unless committed.
struct Removal<'a> {
    store: &'a TaskStore,
    generation: u64,
    backend: Option<BackendId>,
    task: Task,
    committed: bool,
}

impl Removal<'_> {
    fn commit(mut self) -> Task {
        self.committed = true;
        self.task.clone()
    }
}

impl Drop for Removal<'_> {
    fn drop(&mut self) {
        let mut state = self.store.state();
        if state.generation != self.generation {
            debug!(task = %self.task.id, "store replaced during delete; not restoring");
            return;
        }
        state.in_flight.remove(&self.task.id);
        if let Some(backend) = self.backend {
            state.pending_delete.remove(&backend);
        }
        if self.committed {
            return;
        }
        if let Some(backend) = self.backend {
            if let Err(err) = state.identity.bind(&self.task.id, backend) {
                warn!(task = %self.task.id, error = %err, "could not restore binding");
            }
        }
        state.insert_by_created(self.task.clone());
        self.store.publish(StoreEvent::TaskInserted {
            task: Box::new(self.task.clone()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::task::{ConnectionRef, TaskKind};

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(MemoryGateway::new()), StoreSettings::default())
    }

    fn params() -> CreateTaskParams {
        CreateTaskParams::new(TaskKind::Collection, ConnectionRef::new(7, "dc1"))
            .with_selection(["vm-1", "vm-2"])
    }

    fn record(id: u64, status: TaskStatus, progress: u8) -> RemoteTaskRecord {
        RemoteTaskRecord::new(BackendId(id), TaskKind::Collection, status)
            .with_progress(progress)
            .with_connection(ConnectionRef::new(7, "dc1"))
    }

    #[test]
    fn optimistic_tasks_are_inserted_at_the_head() {
        let store = store();
        let first = store.create_optimistic(params());
        let second = store.create_optimistic(params());
        let ids: Vec<_> = store.list().into_iter().map(|task| task.id).collect();
        assert_eq!(ids, vec![second.id, first.id.clone()]);
        assert_eq!(first.status, TaskStatus::Pending);
        assert_eq!(first.progress_percent, 0);
        assert_eq!(first.origin, TaskOrigin::Local);
    }

    #[test]
    fn binding_unknown_local_id_fails() {
        let store = store();
        let err = store
            .bind_backend_id(&LocalId::from("t-missing"), BackendId(1))
            .expect_err("unknown");
        assert!(matches!(err, Error::UnknownLocalId(_)));
    }

    #[test]
    fn backend_id_never_changes_once_bound() {
        let store = store();
        let task = store.create_optimistic(params());
        store.bind_backend_id(&task.id, BackendId(5)).expect("bind");
        store.bind_backend_id(&task.id, BackendId(5)).expect("rebind same");
        assert!(matches!(
            store.bind_backend_id(&task.id, BackendId(6)),
            Err(Error::BackendIdConflict { .. })
        ));
        assert_eq!(store.backend_id(&task.id), Some(BackendId(5)));
    }

    #[test]
    fn bind_absorbs_task_discovered_before_create_returned() {
        let store = store();
        let (task, _guard) = store.create_optimistic_in_flight(params(), ops::CREATE);
        assert_eq!(store.in_flight(&task.id), Some(ops::CREATE));

        let report = store.apply_remote_snapshot(vec![record(9, TaskStatus::Running, 10)]);
        assert_eq!(report.discovered, 1);
        assert_eq!(store.len(), 2);

        store.bind_backend_id(&task.id, BackendId(9)).expect("bind");
        assert_eq!(store.len(), 1);
        let merged = store.get(&task.id).expect("task");
        assert_eq!(merged.backend_id, Some(BackendId(9)));
        assert_eq!(merged.status, TaskStatus::Running);
        assert_eq!(merged.selection, vec!["vm-1".to_string(), "vm-2".to_string()]);
        assert_eq!(store.find_by_backend_id(BackendId(9)).map(|t| t.id), Some(task.id));
    }

    #[test]
    fn heuristic_binds_unconfirmed_task_when_no_create_is_in_flight() {
        let store = store();
        let task = store.create_optimistic(params());
        let report = store.apply_remote_snapshot(vec![record(3, TaskStatus::Pending, 0)]);
        assert_eq!(report.bound_by_heuristic, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.backend_id(&task.id), Some(BackendId(3)));
    }

    #[test]
    fn in_flight_guard_rejects_reentry_until_dropped() {
        let store = store();
        let task = store.create_optimistic(params());
        let guard = store.begin(&task.id, ops::STOP).expect("guard");
        match store.begin(&task.id, ops::STOP) {
            Err(Error::AlreadyInFlight { op, .. }) => assert_eq!(op, ops::STOP),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("re-entry accepted"),
        }
        assert_eq!(store.in_flight(&task.id), Some(ops::STOP));
        drop(guard);
        assert!(store.begin(&task.id, ops::STOP).is_ok());
    }

    #[test]
    fn mutate_local_leaves_remote_fields_alone() {
        let store = store();
        let task = store.create_optimistic(params());
        store.bind_backend_id(&task.id, BackendId(1)).expect("bind");
        store.apply_remote_snapshot(vec![record(1, TaskStatus::Running, 30)]);

        let patch = TaskPatch {
            selection: Some(vec!["vm-3".to_string()]),
            ..TaskPatch::default()
        };
        let updated = store.mutate_local(&task.id, patch).expect("mutate");
        assert_eq!(updated.selection, vec!["vm-3".to_string()]);
        assert_eq!(updated.status, TaskStatus::Running);
        assert_eq!(updated.progress_percent, 30);
    }

    #[test]
    fn pause_on_submitted_task_is_a_no_op() {
        let store = store();
        let task = store.create_optimistic(params());
        store.bind_backend_id(&task.id, BackendId(1)).expect("bind");
        store.apply_remote_snapshot(vec![record(1, TaskStatus::Running, 30)]);
        let before = store.get(&task.id).expect("task");
        let after = store.pause(&task.id).expect("pause");
        assert_eq!(before, after);
        assert_eq!(store.resume(&task.id).expect("resume"), before);
    }

    #[test]
    fn unbound_running_task_pauses_locally() {
        let store = store();
        let mut task = store.create_optimistic(params());
        task.status = TaskStatus::Running;
        store.restore(vec![task.clone()]).expect("restore");
        assert_eq!(store.pause(&task.id).expect("pause").status, TaskStatus::Paused);
        assert_eq!(store.resume(&task.id).expect("resume").status, TaskStatus::Running);
    }

    #[test]
    fn only_running_tasks_time_out() {
        let store = store();
        let task = store.create_optimistic(params());
        assert!(!store.fail_timed_out(&task.id, Duration::from_secs(300)).expect("pending"));

        store.bind_backend_id(&task.id, BackendId(1)).expect("bind");
        store.apply_remote_snapshot(vec![record(1, TaskStatus::Running, 50)]);
        assert!(store.fail_timed_out(&task.id, Duration::from_secs(300)).expect("running"));
        let failed = store.get(&task.id).expect("task");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.timed_out);
        assert!(failed.ended_at.is_some());
        assert!(failed.error_message.expect("message").contains("5m"));
    }

    #[test]
    fn clear_finished_drops_terminal_tasks_only() {
        let store = store();
        let done = store.create_optimistic(params());
        let live = store.create_optimistic(params());
        store.bind_backend_id(&done.id, BackendId(1)).expect("bind");
        store.bind_backend_id(&live.id, BackendId(2)).expect("bind");
        store.apply_remote_snapshot(vec![
            record(1, TaskStatus::Completed, 100),
            record(2, TaskStatus::Running, 5),
        ]);

        assert_eq!(store.clear_finished(), vec![done.id]);
        assert_eq!(store.len(), 1);
        assert!(store.find_by_backend_id(BackendId(1)).is_none());
        assert!(store.has_running_tasks());
        assert_eq!(store.running_tasks().len(), 1);
    }

    #[test]
    fn reset_drops_everything() {
        let store = store();
        let mut events = store.subscribe();
        let task = store.create_optimistic(params());
        store.bind_backend_id(&task.id, BackendId(1)).expect("bind");
        store.reset();
        assert!(store.is_empty());
        assert!(store.find_by_backend_id(BackendId(1)).is_none());

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(StoreEvent::StoreReset));
    }

    #[test]
    fn reset_releases_in_flight_operations() {
        let store = store();
        let task = store.create_optimistic(params());
        let guard = store.begin(&task.id, ops::STOP).expect("guard");
        store.reset();
        assert_eq!(store.in_flight(&task.id), None);
        drop(guard);
        assert!(store.is_empty());
    }

    #[test]
    fn failed_removal_after_reset_restores_nothing() {
        let store = store();
        let task = store.create_optimistic(params());
        store.bind_backend_id(&task.id, BackendId(4)).expect("bind");
        let removal = store.take_for_removal(&task.id).expect("take");
        store.reset();
        drop(removal);
        assert!(store.is_empty());
        assert!(store.find_by_backend_id(BackendId(4)).is_none());
    }

    #[test]
    fn failed_removal_restores_in_creation_order() {
        let store = store();
        let older = store.create_optimistic(params());
        let removal = store.take_for_removal(&older.id).expect("take");
        let newer = store.create_optimistic(params());
        drop(removal);
        let ids: Vec<_> = store.list().into_iter().map(|task| task.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[test]
    fn unchanged_snapshot_publishes_nothing() {
        let store = store();
        store.apply_remote_snapshot(vec![record(1, TaskStatus::Running, 20)]);
        let mut events = store.subscribe();
        let report = store.apply_remote_snapshot(vec![record(1, TaskStatus::Running, 20)]);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.changed(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn restore_rejects_conflicting_bindings() {
        let store = store();
        let mut a = store.create_optimistic(params());
        let mut b = store.create_optimistic(params());
        a.backend_id = Some(BackendId(4));
        b.backend_id = Some(BackendId(4));
        assert!(store.restore(vec![a, b]).is_err());
    }

    #[test]
    fn grace_scales_with_poll_interval() {
        let settings = StoreSettings::for_polling(Duration::from_secs(2), 1);
        assert_eq!(settings.absence_grace, Duration::from_secs(1));
        let settings = StoreSettings::for_polling(Duration::from_secs(2), 3);
        assert_eq!(settings.absence_grace, Duration::from_secs(5));
        let settings = StoreSettings::for_polling(Duration::from_secs(2), 0);
        assert_eq!(settings.absence_grace, Duration::ZERO);
    }
}
