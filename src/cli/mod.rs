//! Command-line interface for fleetjobs
//!
//! This module defines the CLI structure using clap derive macros.
//! Command implementations live in [`task`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;

mod context;
mod task;

/// fleetjobs - fleet collection and analysis jobs
///
/// Launches collection and analysis jobs against the analysis backend and
/// tracks them until they finish.
#[derive(Parser, Debug)]
#[command(name = "fleetjobs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to ./.fleetjobs.toml when present)
    #[arg(long, global = true, env = "FLEETJOBS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write store events as JSONL to a file, or `-` for stdout
    #[arg(long, global = true, value_name = "PATH")]
    pub events: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List tasks, most recent first
    List {
        /// Only tasks with this status
        #[arg(long)]
        status: Option<String>,

        /// Only tasks of this kind (collection, zombie, rightsize, tidal, health)
        #[arg(long)]
        kind: Option<String>,
    },

    /// Show one task
    Show {
        /// Local id, unique prefix, or backend id (42, #42, backend_42)
        id: String,
    },

    /// Submit a new collection or analysis job
    Create {
        /// Job kind: collection, zombie, rightsize, tidal, health
        #[arg(long, default_value = "collection")]
        kind: String,

        /// Target connection as <id>[:<name>]
        #[arg(long)]
        connection: String,

        /// Connection platform (e.g. vcenter)
        #[arg(long)]
        platform: Option<String>,

        /// VM to include (repeatable)
        #[arg(long = "vm", value_name = "VM")]
        vms: Vec<String>,

        /// Display name (defaults to "<connection> <kind>")
        #[arg(long)]
        name: Option<String>,

        /// Analysis parameter as key=value (repeatable; value parsed as JSON when possible)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Stop a running job
    Stop {
        id: String,
    },

    /// Re-run a finished job as a new task
    Retry {
        id: String,
    },

    /// Delete a task locally and on the backend
    Delete {
        id: String,
    },

    /// Show backend logs of a job
    Logs {
        id: String,

        /// Number of most recent entries
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Poll the backend and report changes until interrupted
    Watch {
        /// Exit once no task is pending, running or paused
        #[arg(long)]
        until_idle: bool,
    },

    /// Drop finished tasks from the local session
    Clear {
        /// Drop every task and binding, not only finished ones
        #[arg(long)]
        all: bool,
    },
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let global = context::GlobalOptions {
            config: self.config,
            events: self.events,
            json: self.json,
            quiet: self.quiet,
        };
        runtime.block_on(run_command(global, self.command))
    }
}

async fn run_command(global: context::GlobalOptions, command: Commands) -> Result<()> {
    let ctx = context::Context::open(global).await?;
    let result = match command {
        Commands::List { status, kind } => task::run_list(&ctx, task::ListOptions { status, kind }),
        Commands::Show { id } => task::run_show(&ctx, &id),
        Commands::Create {
            kind,
            connection,
            platform,
            vms,
            name,
            params,
        } => {
            task::run_create(
                &ctx,
                task::CreateOptions {
                    kind,
                    connection,
                    platform,
                    vms,
                    name,
                    params,
                },
            )
            .await
        }
        Commands::Stop { id } => task::run_stop(&ctx, &id).await,
        Commands::Retry { id } => task::run_retry(&ctx, &id).await,
        Commands::Delete { id } => task::run_delete(&ctx, &id).await,
        Commands::Logs { id, limit } => task::run_logs(&ctx, &id, limit).await,
        Commands::Watch { until_idle } => task::run_watch(&ctx, until_idle).await,
        Commands::Clear { all } => task::run_clear(&ctx, all),
    };
    let closed = ctx.close().await;
    result.and(closed)
}
