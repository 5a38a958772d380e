//! Per-invocation setup shared by every command: config, service, session
//! restore/save and the optional event stream.

use std::path::PathBuf;

use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::events::{EventDestination, EventSink, StoreEvent};
use crate::output::OutputOptions;
use crate::service::TaskService;
use crate::session::{Baseline, Session};

pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub events: Option<String>,
    pub json: bool,
    pub quiet: bool,
}

pub struct Context {
    pub service: TaskService,
    pub output: OutputOptions,
    session: Option<(Session, Baseline)>,
    events: Option<EventForwarder>,
}

impl Context {
    /// Load config, restore the saved session and sync once with the
    /// backend. A failed sync is not an error; the saved state is used.
    pub async fn open(global: GlobalOptions) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let config = Config::discover(global.config.as_deref(), &cwd)?;
        let service = TaskService::from_config(&config)?;

        let session = match config.session.snapshot_path().map(Session::new) {
            Some(session) => {
                let baseline = session.restore_into(service.store())?;
                debug!(
                    path = %session.path().display(),
                    restored = baseline.len(),
                    "session restored"
                );
                Some((session, baseline))
            }
            None => None,
        };

        let destination = EventDestination::parse(global.events.as_deref());
        let events_to_stdout = matches!(destination, Some(EventDestination::Stdout));
        let events = match destination {
            Some(destination) => Some(EventForwarder::spawn(
                destination.open()?,
                service.subscribe(),
            )),
            None => None,
        };

        if service.sync().await.is_none() {
            debug!("initial sync failed; showing saved state");
        }

        Ok(Self {
            service,
            output: OutputOptions {
                json: global.json && !events_to_stdout,
                quiet: global.quiet || events_to_stdout,
            },
            session,
            events,
        })
    }

    /// Stop polling, save the session and flush the event stream.
    pub async fn close(self) -> Result<()> {
        self.service.shutdown().await;
        let saved = match &self.session {
            Some((session, baseline)) => session
                .save_from(self.service.store(), baseline)
                .map(|_| ()),
            None => Ok(()),
        };
        if let Some(events) = self.events {
            events.finish().await;
        }
        saved
    }
}

/// Copies store events into an [`EventSink`] until finished.
struct EventForwarder {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl EventForwarder {
    fn spawn(mut sink: EventSink, mut events: Receiver<StoreEvent>) -> Self {
        let token = CancellationToken::new();
        let done = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = events.recv() => match received {
                        Ok(event) => write_event(&mut sink, &event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event stream fell behind; events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = done.cancelled() => {
                        while let Ok(event) = events.try_recv() {
                            write_event(&mut sink, &event);
                        }
                        break;
                    }
                }
            }
        });
        Self { token, handle }
    }

    async fn finish(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "event forwarder ended abnormally");
        }
    }
}

fn write_event(sink: &mut EventSink, event: &StoreEvent) {
    if let Err(err) = sink.emit(event) {
        warn!(
            error = %err,
            event = event.kind(),
            task = ?event.task_id(),
            "failed to write event"
        );
    }
}
