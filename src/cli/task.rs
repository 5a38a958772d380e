//! fleetjobs task command implementations.

use std::str::FromStr;

use tokio::sync::broadcast::error::RecvError;

use super::context::Context;
use crate::error::{Error, Result};
use crate::events::StoreEvent;
use crate::gateway::LogEntry;
use crate::output::{emit_success, HumanOutput};
use crate::service::StatusCounts;
use crate::task::{
    AnalysisConfig, ConnectionRef, CreateTaskParams, LocalId, Task, TaskKind, TaskStatus,
};

/// Options for the list command
pub struct ListOptions {
    pub status: Option<String>,
    pub kind: Option<String>,
}

/// Options for the create command
pub struct CreateOptions {
    pub kind: String,
    pub connection: String,
    pub platform: Option<String>,
    pub vms: Vec<String>,
    pub name: Option<String>,
    pub params: Vec<String>,
}

#[derive(serde::Serialize)]
struct ListReport {
    tasks: Vec<Task>,
    counts: StatusCounts,
}

#[derive(serde::Serialize)]
struct LogsReport<'a> {
    task: &'a LocalId,
    entries: Vec<LogEntry>,
}

#[derive(serde::Serialize)]
struct ClearReport {
    removed: usize,
    remaining: usize,
}

#[derive(serde::Serialize)]
struct WatchReport {
    changes: usize,
    counts: StatusCounts,
    idle: bool,
}

pub fn run_list(ctx: &Context, options: ListOptions) -> Result<()> {
    let status = options
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .transpose()?;
    let kind = options.kind.as_deref().map(TaskKind::from_str).transpose()?;

    let tasks: Vec<Task> = ctx
        .service
        .list()
        .into_iter()
        .filter(|task| status.map_or(true, |status| task.status == status))
        .filter(|task| kind.map_or(true, |kind| task.kind == kind))
        .collect();
    let counts = StatusCounts::from_tasks(&tasks);

    let mut human = HumanOutput::new("fleetjobs list");
    push_counts(&mut human, &counts);
    for task in &tasks {
        human.push_detail(format_task_line(task));
        if task.status == TaskStatus::Unknown {
            human.push_warning(format!(
                "{} is no longer listed by the backend",
                task.id
            ));
        }
    }
    if tasks.is_empty() && status.is_none() && kind.is_none() {
        human.push_next_step("fleetjobs create --connection <id>:<name>");
    }

    emit_success(
        ctx.output,
        "list",
        &ListReport { tasks, counts },
        Some(&human),
    )
}

pub fn run_show(ctx: &Context, input: &str) -> Result<()> {
    let id = ctx.service.resolve(input)?;
    let task = ctx.service.get(&id)?;

    let mut human = HumanOutput::new(format!("fleetjobs show: {}", task.display_name));
    human.push_summary("id", task.id.to_string());
    human.push_summary("backend id", backend_label(&task));
    human.push_summary("kind", task.kind.as_str());
    human.push_summary("status", task.status.as_str());
    human.push_summary("progress", format!("{}%", task.progress_percent));
    if let Some(step) = &task.current_step {
        human.push_summary("step", step.clone());
    }
    if let Some(conn) = &task.connection {
        human.push_summary("connection", format!("{} ({})", conn.name, conn.id));
    }
    human.push_summary("created", task.created_at.to_rfc3339());
    if let Some(started) = task.started_at {
        human.push_summary("started", started.to_rfc3339());
    }
    if let Some(ended) = task.ended_at {
        human.push_summary("ended", ended.to_rfc3339());
    }
    if let (Some(collected), Some(total)) = (task.collected_vm_count, task.vm_count) {
        human.push_summary("vms collected", format!("{collected}/{total}"));
    }
    for vm in &task.selection {
        human.push_detail(format!("vm {vm}"));
    }
    for (kind, done) in &task.analysis_completion {
        human.push_detail(format!(
            "analysis {} {}",
            kind.as_str(),
            if *done { "done" } else { "pending" }
        ));
    }
    if let Some(error) = &task.error_message {
        human.push_warning(error.clone());
    }
    if task.status.is_terminal() && task.is_bound() {
        human.push_next_step(format!("fleetjobs logs {}", task.id));
    }

    emit_success(ctx.output, "show", &task, Some(&human))
}

pub async fn run_create(ctx: &Context, options: CreateOptions) -> Result<()> {
    let kind = TaskKind::from_str(&options.kind)?;
    let mut connection = ConnectionRef::parse(&options.connection)?;
    connection.platform = options.platform;

    let mut params = CreateTaskParams::new(kind, connection).with_selection(options.vms);
    if let Some(name) = options.name {
        params = params.with_name(name);
    }
    params.config = parse_params(&options.params)?;

    let task = ctx.service.create(params).await?;

    let mut human = HumanOutput::new(format!("fleetjobs create: {}", task.display_name));
    human.push_summary("id", task.id.to_string());
    human.push_summary("backend id", backend_label(&task));
    human.push_summary("status", task.status.as_str());
    human.push_next_step("fleetjobs watch --until-idle");

    emit_success(ctx.output, "create", &task, Some(&human))
}

pub async fn run_stop(ctx: &Context, input: &str) -> Result<()> {
    let id = ctx.service.resolve(input)?;
    let task = ctx.service.stop(&id).await?;

    let mut human = HumanOutput::new(format!("fleetjobs stop: {}", task.display_name));
    human.push_summary("id", task.id.to_string());
    human.push_summary("status", task.status.as_str());

    emit_success(ctx.output, "stop", &task, Some(&human))
}

pub async fn run_retry(ctx: &Context, input: &str) -> Result<()> {
    let id = ctx.service.resolve(input)?;
    let task = ctx.service.retry(&id).await?;

    let mut human = HumanOutput::new(format!("fleetjobs retry: {}", task.display_name));
    human.push_summary("id", task.id.to_string());
    human.push_summary("backend id", backend_label(&task));
    human.push_summary("retry of", id.to_string());
    human.push_next_step("fleetjobs watch --until-idle");

    emit_success(ctx.output, "retry", &task, Some(&human))
}

pub async fn run_delete(ctx: &Context, input: &str) -> Result<()> {
    let id = ctx.service.resolve(input)?;
    let task = ctx.service.delete(&id).await?;

    let mut human = HumanOutput::new(format!("fleetjobs delete: {}", task.display_name));
    human.push_summary("id", task.id.to_string());
    human.push_summary("backend id", backend_label(&task));

    emit_success(ctx.output, "delete", &task, Some(&human))
}

pub async fn run_logs(ctx: &Context, input: &str, limit: usize) -> Result<()> {
    let id = ctx.service.resolve(input)?;
    let entries = ctx.service.logs(&id, limit).await?;

    let mut human = HumanOutput::new(format!("fleetjobs logs: {id}"));
    human.push_summary("entries", entries.len().to_string());
    for entry in &entries {
        human.push_detail(format!(
            "{} [{}] {}",
            entry.timestamp, entry.level, entry.message
        ));
    }

    emit_success(
        ctx.output,
        "logs",
        &LogsReport { task: &id, entries },
        Some(&human),
    )
}

pub async fn run_watch(ctx: &Context, until_idle: bool) -> Result<()> {
    let service = &ctx.service;
    let live = !ctx.output.json && !ctx.output.quiet;
    let mut events = service.subscribe();
    service.start();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut changes = 0usize;
    while !(until_idle && !service.is_busy()) {
        tokio::select! {
            _ = &mut ctrl_c => break,
            received = events.recv() => match received {
                Ok(StoreEvent::TaskInserted { task } | StoreEvent::TaskUpdated { task }) => {
                    changes += 1;
                    if live {
                        println!("{}", format_task_line(&task));
                    }
                }
                Ok(StoreEvent::TaskRemoved { id }) if live => println!("{id} removed"),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    service.shutdown().await;

    let counts = service.counts();
    let idle = !service.is_busy();
    let mut human = HumanOutput::new("fleetjobs watch");
    human.push_summary("changes", changes.to_string());
    push_counts(&mut human, &counts);

    emit_success(
        ctx.output,
        "watch",
        &WatchReport {
            changes,
            counts,
            idle,
        },
        Some(&human),
    )
}

pub fn run_clear(ctx: &Context, all: bool) -> Result<()> {
    let store = ctx.service.store();
    let removed = if all {
        let count = store.len();
        store.reset();
        count
    } else {
        store.clear_finished().len()
    };
    let remaining = store.len();

    let mut human = HumanOutput::new("fleetjobs clear");
    human.push_summary("removed", removed.to_string());
    human.push_summary("remaining", remaining.to_string());

    emit_success(
        ctx.output,
        "clear",
        &ClearReport { removed, remaining },
        Some(&human),
    )
}

fn push_counts(human: &mut HumanOutput, counts: &StatusCounts) {
    human.push_summary("tasks", counts.total().to_string());
    for (label, count) in [
        ("pending", counts.pending),
        ("running", counts.running),
        ("paused", counts.paused),
        ("completed", counts.completed),
        ("failed", counts.failed),
        ("cancelled", counts.cancelled),
        ("unknown", counts.unknown),
    ] {
        if count > 0 {
            human.push_summary(label, count.to_string());
        }
    }
}

fn backend_label(task: &Task) -> String {
    task.backend_id
        .map(|id| format!("#{id}"))
        .unwrap_or_else(|| "-".to_string())
}

fn format_task_line(task: &Task) -> String {
    let mut line = format!(
        "{}  {:>6}  {:<9} {:>3}%  {:<18} {}",
        task.id,
        backend_label(task),
        task.status.as_str(),
        task.progress_percent,
        task.kind.as_str(),
        task.display_name
    );
    if let Some(error) = &task.error_message {
        line.push_str(&format!("  ({error})"));
    }
    line
}

/// Parse `key=value` analysis parameters. Values that are valid JSON keep
/// their type; anything else is a string.
fn parse_params(raw: &[String]) -> Result<AnalysisConfig> {
    let mut config = AnalysisConfig::new();
    for item in raw {
        let (key, value) = item.split_once('=').ok_or_else(|| {
            Error::InvalidArgument(format!("invalid parameter '{item}' (expected key=value)"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "invalid parameter '{item}' (empty key)"
            )));
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        config.insert(key.to_string(), value);
    }
    Ok(config)
}
