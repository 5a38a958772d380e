//! Merge policy between locally held tasks and remote task records.
//!
//! The backend is authoritative for execution state (status, progress,
//! error, timestamps, current step). It does not reliably echo the fields
//! only this client knows about (VM selection, analysis completion flags),
//! so those are kept unless the remote record explicitly carries a
//! non-empty value. Never replace a local task wholesale from a poll.

use chrono::{DateTime, Utc};

use crate::gateway::RemoteTaskRecord;
use crate::task::{LocalId, Task, TaskOrigin, TaskStatus};

/// Ordering used to reject stale (out-of-order) records.
fn status_rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Running | TaskStatus::Paused => 1,
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 2,
        TaskStatus::Unknown => 0,
    }
}

/// Whether `remote` may overwrite the execution state of `existing`.
pub fn accepts_remote_state(existing: &Task, remote: &RemoteTaskRecord) -> bool {
    if existing.status.is_terminal() {
        // A local timeout yields to the real outcome once the backend has one.
        return existing.timed_out && remote.status.is_terminal();
    }
    if existing.status == TaskStatus::Unknown {
        return true;
    }
    status_rank(remote.status) >= status_rank(existing.status)
}

/// Merge a remote record into the existing local task, or synthesize a new
/// local task for a record nobody here created.
pub fn merge(existing: Option<&Task>, remote: &RemoteTaskRecord, now: DateTime<Utc>) -> Task {
    let Some(existing) = existing else {
        return synthesize(remote, now);
    };

    let mut task = existing.clone();
    if task.backend_id.is_none() {
        task.backend_id = Some(remote.backend_id);
    }
    merge_local_fields(&mut task, remote);

    if accepts_remote_state(existing, remote) {
        apply_execution_state(&mut task, existing.status, remote, now);
    }
    task
}

/// Build a local task for a remote-only record.
pub fn synthesize(remote: &RemoteTaskRecord, now: DateTime<Utc>) -> Task {
    let mut task = Task {
        id: LocalId::generate(),
        backend_id: Some(remote.backend_id),
        kind: remote.kind,
        display_name: format!("{} #{}", remote.kind, remote.backend_id),
        status: TaskStatus::Pending,
        progress_percent: 0,
        current_step: None,
        error_message: None,
        created_at: remote.created_at.unwrap_or(now),
        started_at: None,
        ended_at: None,
        connection: None,
        selection: Vec::new(),
        analysis_completion: Default::default(),
        vm_count: None,
        collected_vm_count: None,
        origin: TaskOrigin::Discovered,
        timed_out: false,
    };
    merge_local_fields(&mut task, remote);
    apply_execution_state(&mut task, TaskStatus::Pending, remote, now);
    task
}

/// Fields the remote side may or may not echo back.
fn merge_local_fields(task: &mut Task, remote: &RemoteTaskRecord) {
    if let Some(selection) = remote.selection.as_ref().filter(|vms| !vms.is_empty()) {
        task.selection = selection.clone();
    }
    if let Some(flags) = remote
        .analysis_completion
        .as_ref()
        .filter(|flags| !flags.is_empty())
    {
        task.analysis_completion = flags.clone();
    }
    if let Some(name) = remote.display_name.as_deref().filter(|name| !name.is_empty()) {
        task.display_name = name.to_string();
    }
    if let Some(remote_conn) = &remote.connection {
        let merged = match task.connection.take() {
            Some(mut local) if local.id == remote_conn.id => {
                if !remote_conn.name.is_empty() {
                    local.name = remote_conn.name.clone();
                }
                if remote_conn.platform.is_some() {
                    local.platform = remote_conn.platform.clone();
                }
                if remote_conn.host.is_some() {
                    local.host = remote_conn.host.clone();
                }
                local
            }
            _ => remote_conn.clone(),
        };
        task.connection = Some(merged);
    }
    if remote.vm_count.is_some() {
        task.vm_count = remote.vm_count;
    }
    if remote.collected_vm_count.is_some() {
        task.collected_vm_count = remote.collected_vm_count;
    }
}

/// Remote-authoritative execution fields plus transition stamps.
fn apply_execution_state(
    task: &mut Task,
    previous: TaskStatus,
    remote: &RemoteTaskRecord,
    now: DateTime<Utc>,
) {
    let next = remote.status;

    // Non-decreasing while running; restarts from the remote value on entry.
    task.progress_percent = if previous == TaskStatus::Running && next == TaskStatus::Running {
        task.progress_percent.max(remote.progress)
    } else {
        remote.progress
    };

    task.error_message = remote.error.clone();
    task.current_step = remote.current_step.clone();

    task.started_at = remote.started_at.or(task.started_at);
    if next == TaskStatus::Running && task.started_at.is_none() {
        task.started_at = Some(now);
    }

    task.ended_at = if next.is_terminal() {
        remote.completed_at.or(task.ended_at).or(Some(now))
    } else {
        remote.completed_at
    };

    if next == TaskStatus::Completed {
        if let Some(kind) = task.kind.analysis_kind() {
            task.analysis_completion.insert(kind, true);
        }
    }

    task.status = next;
    task.timed_out = false;
}
