//! Application wiring: event handler, signal handling, PID file.
//!
//! The application owns the synchronizer registry (one per tracked source
//! repository) and the compiled mappings, installs its handler on the
//! worker, and runs the consume loop. Each per-destination sync is wrapped
//! in an outer bounded retry; a sync that still fails after that bubbles
//! up so the dispatcher requeues the message.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use hgsync_retry::retry_with_classification;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use crate::consumer::PulseWorker;
use crate::events::Event;
use crate::mapping::{Matcher, operations_by_destination};
use crate::sync::{RepoSynchronizer, SyncError};

/// Outer retry budget around one per-destination sync; the synchronizer
/// retries individual steps on its own, this covers whole-batch replays.
const SYNC_TRIES: u32 = 3;
const SYNC_DELAY: Duration = Duration::from_secs(5);

/// The assembled service.
pub struct Application {
    worker: PulseWorker,
    synchronizers: HashMap<String, RepoSynchronizer>,
    matchers: Vec<Matcher>,
    pidfile: Option<PathBuf>,
}

impl Application {
    pub fn new(
        worker: PulseWorker,
        synchronizers: HashMap<String, RepoSynchronizer>,
        matchers: Vec<Matcher>,
        pidfile: Option<PathBuf>,
    ) -> Self {
        Self {
            worker,
            synchronizers,
            matchers,
            pidfile,
        }
    }

    /// Install signal handlers and block on the consume loop.
    ///
    /// The first SIGINT/SIGTERM flips the worker's stop flag and lets the
    /// in-flight message finish; a second one exits immediately with code
    /// 1 after removing the PID file best-effort.
    pub fn run(self) -> Result<()> {
        let Application {
            worker,
            synchronizers,
            matchers,
            pidfile,
        } = self;

        install_signal_handlers(worker.stop_flag(), pidfile)?;

        let mut handler =
            move |event: Event| handle_event(&synchronizers, &matchers, event);
        worker.run(&mut handler)
    }
}

/// Handle one decoded event: expand it against the mappings and sync each
/// destination in turn.
///
/// Events for untracked repositories are dropped with a warning (and the
/// message acked); an event that matches no mapping is not a failure.
pub fn handle_event(
    synchronizers: &HashMap<String, RepoSynchronizer>,
    matchers: &[Matcher],
    event: Event,
) -> Result<()> {
    let Event::Push(push) = event;

    let Some(synchronizer) = synchronizers.get(&push.repo_url) else {
        warn!(repo_url = %push.repo_url, "ignoring event for untracked repository");
        return Ok(());
    };

    info!(repo_url = %push.repo_url, push_id = push.push_id, "handling push event");

    let by_destination = operations_by_destination(matchers, &push);
    if by_destination.is_empty() {
        info!("no operation matched this event");
        return Ok(());
    }

    for (destination, operations) in &by_destination {
        retry_with_classification(
            &format!("syncing to {destination}"),
            SYNC_TRIES,
            SYNC_DELAY,
            is_permanent_sync_failure,
            || {
                synchronizer
                    .sync(destination, operations, &push.user)
                    .map_err(anyhow::Error::from)
            },
        )
        .map_err(|err| {
            let dump = serde_json::to_string(operations)
                .unwrap_or_else(|_| "<unserializable>".to_string());
            error!(destination, operations = %dump, "sync failed after retries");
            err
        })?;
    }

    Ok(())
}

/// Missing mercurial metadata is a configuration or ordering bug: replaying
/// the batch cannot fix it, so the outer retry returns it immediately.
fn is_permanent_sync_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::MercurialMetadataNotFound { .. })
    )
}

fn install_signal_handlers(stop: Arc<AtomicBool>, pidfile: Option<PathBuf>) -> Result<()> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;

    thread::spawn(move || {
        for signal in signals.forever() {
            if stop.swap(true, Ordering::SeqCst) {
                // Second request: do not wait for the in-flight message.
                info!(signal, "second stop request, exiting now");
                if let Some(path) = &pidfile {
                    let _ = std::fs::remove_file(path);
                }
                process::exit(1);
            }
            info!(signal, "stop requested, finishing current message before exiting");
        }
    });

    Ok(())
}

/// Write this process id to `path`, creating parent directories.
pub fn write_pidfile(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create PID file directory {}", parent.display()))?;
    }
    std::fs::write(path, format!("{}\n", process::id()))
        .with_context(|| format!("failed to write PID file {}", path.display()))
}

/// Remove the PID file, tolerating it being gone already.
pub fn remove_pidfile(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove PID file");
        }
    }
}
