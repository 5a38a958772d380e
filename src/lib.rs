//! fleetjobs - task lifecycle and reconciliation for fleet analysis jobs
//!
//! This library launches long-running collection and analysis jobs on a
//! remote backend and keeps a locally held task collection consistent with
//! the backend's periodically observed state.
//!
//! # Core Concepts
//!
//! - **Optimistic tasks**: created locally before the backend confirms them
//! - **Identity binding**: local ids are bound to backend ids once known
//! - **Reconciliation**: remote execution state is merged field by field,
//!   never replacing local-only data such as VM selections
//! - **Polling**: a baseline poll loop plus bounded per-task windows
//!
//! # Module Organization
//!
//! - `task`: task data model
//! - `gateway`: remote task gateway trait, wire validation, HTTP and
//!   in-memory implementations
//! - `identity`: local/backend id mapping and user id resolution
//! - `reconcile`: merge policy for remote records
//! - `store`: the task state store
//! - `scheduler`: poll scheduler and bounded polling windows
//! - `service`: create/stop/retry/delete and friends
//! - `events`: store change events and JSONL sink
//! - `session`: persistence of the task collection between runs
//! - `config`: configuration loading from `.fleetjobs.toml`
//! - `error`: error types and result aliases
//! - `output`: CLI output envelopes
//! - `cli`: command-line interface using clap

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod output;
pub mod reconcile;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod store;
pub mod task;

pub use error::{Error, Result};
pub use gateway::{MemoryGateway, RemoteTaskRecord, TaskGateway};
pub use scheduler::{PollScheduler, PollSettings, WindowOutcome};
pub use service::TaskService;
pub use store::{SnapshotReport, StoreSettings, TaskStore};
pub use task::{BackendId, CreateTaskParams, LocalId, Task, TaskKind, TaskStatus};
