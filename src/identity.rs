//! Task identity resolution.
//!
//! Tasks live in two identity spaces: the session-local [`LocalId`] handed
//! out at optimistic creation, and the durable [`BackendId`] assigned once
//! the backend accepts the job. Local creation usually precedes remote
//! confirmation, but remote state can also arrive first (another client,
//! an interrupted session), so the two spaces are bound explicitly here.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::gateway::RemoteTaskRecord;
use crate::task::{BackendId, LocalId, Task, TaskOrigin};

/// Bidirectional `LocalId <-> BackendId` mapping.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    by_local: HashMap<LocalId, BackendId>,
    by_backend: HashMap<BackendId, LocalId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the mapping from tasks that already carry a backend id.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Result<Self> {
        let mut map = Self::new();
        for task in tasks {
            if let Some(backend_id) = task.backend_id {
                map.bind(&task.id, backend_id)?;
            }
        }
        Ok(map)
    }

    /// Record `local <-> backend`. A binding never changes once made.
    pub fn bind(&mut self, local: &LocalId, backend: BackendId) -> Result<BindOutcome> {
        if let Some(existing) = self.by_local.get(local) {
            if *existing == backend {
                return Ok(BindOutcome::AlreadyBound);
            }
            return Err(Error::BackendIdConflict {
                backend_id: backend.to_string(),
                bound_to: format!("{local} (already bound to {existing})"),
            });
        }
        if let Some(owner) = self.by_backend.get(&backend) {
            return Err(Error::BackendIdConflict {
                backend_id: backend.to_string(),
                bound_to: owner.to_string(),
            });
        }
        self.by_local.insert(local.clone(), backend);
        self.by_backend.insert(backend, local.clone());
        Ok(BindOutcome::Bound)
    }

    pub fn backend_for(&self, local: &LocalId) -> Option<BackendId> {
        self.by_local.get(local).copied()
    }

    pub fn local_for(&self, backend: BackendId) -> Option<&LocalId> {
        self.by_backend.get(&backend)
    }

    /// Drop the binding of `local`, returning the backend id it had.
    pub fn unbind(&mut self, local: &LocalId) -> Option<BackendId> {
        let backend = self.by_local.remove(local)?;
        self.by_backend.remove(&backend);
        Some(backend)
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_local.clear();
        self.by_backend.clear();
    }
}

/// Best-effort match of an unmapped remote record against unbound local
/// tasks: the most recently created unbound task of the same kind on the
/// same connection. Tasks listed in `excluded` (create call in flight) are
/// skipped, since their create response is the authoritative binding.
pub fn match_unbound<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
    record: &RemoteTaskRecord,
    excluded: &HashSet<LocalId>,
) -> Option<LocalId> {
    tasks
        .into_iter()
        .filter(|task| task.backend_id.is_none())
        .filter(|task| task.origin == TaskOrigin::Local)
        .filter(|task| !excluded.contains(&task.id))
        .filter(|task| task.kind == record.kind)
        .filter(|task| match (&task.connection, &record.connection) {
            (Some(local), Some(remote)) => local.id == remote.id,
            _ => false,
        })
        .max_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        })
        .map(|task| task.id.clone())
}

/// Resolve user input to a local task id.
///
/// Accepts a full local id, a unique prefix of one (with or without the
/// `t-` prefix), or a backend id (`42`, `#42`, `backend_42`).
pub fn resolve<'a>(
    input: &str,
    tasks: impl IntoIterator<Item = &'a Task>,
    identity: &IdentityMap,
) -> Result<LocalId> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument("task id cannot be empty".to_string()));
    }

    if let Some(backend) = BackendId::parse(trimmed) {
        return identity
            .local_for(backend)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(trimmed.to_string()));
    }

    let needle = trimmed.to_lowercase();
    let bare = needle.strip_prefix("t-").unwrap_or(&needle);
    let mut exact = None;
    let mut matches: Vec<LocalId> = Vec::new();
    for task in tasks {
        let id = task.id.as_str();
        let suffix = id.strip_prefix("t-").unwrap_or(id);
        if id == needle {
            exact = Some(task.id.clone());
            break;
        }
        if suffix.starts_with(bare) {
            matches.push(task.id.clone());
        }
    }

    if let Some(id) = exact {
        return Ok(id);
    }

    matches.sort();
    matches.dedup();
    match matches.len() {
        0 => Err(Error::UnknownTask(trimmed.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::AmbiguousId {
            input: trimmed.to_string(),
            candidates: matches
                .iter()
                .map(LocalId::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ConnectionRef, TaskKind, TaskStatus};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn task(id: &str, kind: TaskKind, connection: u64, age_secs: i64) -> Task {
        Task {
            id: LocalId::from(id),
            backend_id: None,
            kind,
            display_name: id.to_string(),
            status: TaskStatus::Pending,
            progress_percent: 0,
            current_step: None,
            error_message: None,
            created_at: Utc::now() - Duration::seconds(age_secs),
            started_at: None,
            ended_at: None,
            connection: Some(ConnectionRef::new(connection, "dc")),
            selection: Vec::new(),
            analysis_completion: BTreeMap::new(),
            vm_count: None,
            collected_vm_count: None,
            origin: TaskOrigin::Local,
            timed_out: false,
        }
    }

    fn record(id: u64, kind: TaskKind, connection: u64) -> RemoteTaskRecord {
        RemoteTaskRecord::new(BackendId(id), kind, TaskStatus::Pending)
            .with_connection(ConnectionRef::new(connection, "dc"))
    }

    #[test]
    fn bind_is_idempotent_and_never_rebinds() {
        let mut map = IdentityMap::new();
        let local = LocalId::from("t-a");
        assert_eq!(map.bind(&local, BackendId(1)).unwrap(), BindOutcome::Bound);
        assert_eq!(map.bind(&local, BackendId(1)).unwrap(), BindOutcome::AlreadyBound);
        assert!(matches!(
            map.bind(&local, BackendId(2)),
            Err(Error::BackendIdConflict { .. })
        ));
        assert!(matches!(
            map.bind(&LocalId::from("t-b"), BackendId(1)),
            Err(Error::BackendIdConflict { .. })
        ));
        assert_eq!(map.backend_for(&local), Some(BackendId(1)));
        assert_eq!(map.local_for(BackendId(1)), Some(&local));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn unbind_clears_both_directions() {
        let mut map = IdentityMap::new();
        let local = LocalId::from("t-a");
        map.bind(&local, BackendId(1)).unwrap();
        assert_eq!(map.unbind(&local), Some(BackendId(1)));
        assert!(map.local_for(BackendId(1)).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn heuristic_prefers_most_recent_matching_task() {
        let tasks = vec![
            task("t-old", TaskKind::Collection, 7, 60),
            task("t-new", TaskKind::Collection, 7, 5),
            task("t-other-conn", TaskKind::Collection, 8, 1),
            task("t-other-kind", TaskKind::AnalysisZombie, 7, 1),
        ];
        let matched = match_unbound(&tasks, &record(10, TaskKind::Collection, 7), &HashSet::new());
        assert_eq!(matched, Some(LocalId::from("t-new")));
    }

    #[test]
    fn heuristic_skips_bound_discovered_and_in_flight_tasks() {
        let mut bound = task("t-bound", TaskKind::Collection, 7, 1);
        bound.backend_id = Some(BackendId(3));
        let mut discovered = task("t-disc", TaskKind::Collection, 7, 2);
        discovered.origin = TaskOrigin::Discovered;
        let in_flight = task("t-flight", TaskKind::Collection, 7, 3);
        let tasks = vec![bound, discovered, in_flight];

        let mut excluded = HashSet::new();
        excluded.insert(LocalId::from("t-flight"));
        assert!(match_unbound(&tasks, &record(10, TaskKind::Collection, 7), &excluded).is_none());
    }

    #[test]
    fn heuristic_needs_a_connection_on_both_sides() {
        let tasks = vec![task("t-a", TaskKind::Collection, 7, 1)];
        let bare = RemoteTaskRecord::new(BackendId(10), TaskKind::Collection, TaskStatus::Pending);
        assert!(match_unbound(&tasks, &bare, &HashSet::new()).is_none());
    }

    #[test]
    fn resolve_accepts_backend_ids_and_prefixes() {
        let mut tasks = vec![
            task("t-01abc", TaskKind::Collection, 7, 1),
            task("t-01abd", TaskKind::Collection, 7, 2),
            task("t-9zz", TaskKind::Collection, 7, 3),
        ];
        tasks[2].backend_id = Some(BackendId(42));
        let identity = IdentityMap::from_tasks(&tasks).expect("identity");

        assert_eq!(resolve("42", &tasks, &identity).unwrap(), LocalId::from("t-9zz"));
        assert_eq!(resolve("#42", &tasks, &identity).unwrap(), LocalId::from("t-9zz"));
        assert_eq!(
            resolve("backend_42", &tasks, &identity).unwrap(),
            LocalId::from("t-9zz")
        );
        assert_eq!(resolve("T-01ABC", &tasks, &identity).unwrap(), LocalId::from("t-01abc"));
        assert_eq!(resolve("01abd", &tasks, &identity).unwrap(), LocalId::from("t-01abd"));
        assert_eq!(resolve("9z", &tasks, &identity).unwrap(), LocalId::from("t-9zz"));

        assert!(matches!(
            resolve("01ab", &tasks, &identity),
            Err(Error::AmbiguousId { .. })
        ));
        assert!(matches!(
            resolve("77", &tasks, &identity),
            Err(Error::UnknownTask(_))
        ));
        assert!(matches!(
            resolve("nope", &tasks, &identity),
            Err(Error::UnknownTask(_))
        ));
    }
}
