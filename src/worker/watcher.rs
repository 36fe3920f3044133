//! Completion watcher: periodically probes one channel and resolves finished jobs.
//!
//! Ticks for a channel never overlap: `run_tick` holds a per-watcher lock
//! for the whole probe-and-resolve cycle, so a second caller waits for the
//! first to finish. The spawned loop also skips timer ticks it missed
//! while a slow cycle was running.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::channels::{Channel, ChannelKind};
use crate::store::{JobStore, Transition};

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Waiting jobs handed to the channel.
    pub pending: usize,
    /// Jobs moved to Done this tick.
    pub resolved: usize,
    /// Completions for jobs that were not pending on this channel.
    pub ignored: usize,
    /// Whether the channel reported a failed cycle.
    pub probe_failed: bool,
}

/// Watches one channel for completions.
pub struct CompletionWatcher {
    channel: Arc<dyn Channel>,
    store: Arc<JobStore>,
    tick_lock: Mutex<()>,
}

impl CompletionWatcher {
    pub fn new(channel: Arc<dyn Channel>, store: Arc<JobStore>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            store,
            tick_lock: Mutex::new(()),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    /// Run one probe cycle: collect this channel's Waiting jobs, probe, resolve matches.
    pub async fn run_tick(&self) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        let kind = self.channel.kind();

        let pending = self.store.pending(kind).await;
        let mut report = TickReport {
            pending: pending.len(),
            ..TickReport::default()
        };
        if pending.is_empty() {
            return report;
        }

        let completions = match self.channel.probe(&pending).await {
            Ok(completions) => completions,
            Err(e) => {
                warn!(channel = %kind, error = %e, "Probe cycle failed; retrying next tick");
                report.probe_failed = true;
                return report;
            }
        };

        // Batch channels report whatever they find; only this channel's own
        // Waiting jobs may be resolved from it.
        let pending: HashSet<_> = pending.into_iter().collect();
        for completion in completions {
            if !pending.contains(&completion.job_id) {
                debug!(
                    channel = %kind,
                    job_id = %completion.job_id,
                    "Completion for a job not pending on this channel ignored"
                );
                report.ignored += 1;
                continue;
            }
            match self.store.resolve(&completion.job_id, completion.result).await {
                Transition::Applied => report.resolved += 1,
                Transition::Stale | Transition::NotFound => report.ignored += 1,
            }
        }

        debug!(
            channel = %kind,
            pending = report.pending,
            resolved = report.resolved,
            ignored = report.ignored,
            "Watcher tick complete"
        );
        report
    }
}

/// Spawn the polling loop for a watcher.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_watcher(
    watcher: Arc<CompletionWatcher>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let kind = watcher.kind();
        info!(channel = %kind, interval_secs = interval.as_secs_f64(), "Completion watcher started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!(channel = %kind, "Completion watcher shutting down");
                return;
            }

            // Run the cycle in its own task so a panic in a channel only costs one tick.
            let w = Arc::clone(&watcher);
            if let Err(e) = tokio::spawn(async move { w.run_tick().await }).await {
                error!(channel = %kind, error = %e, "Watcher tick panicked");
            }
        }
    });

    (handle, shutdown_flag)
}

/// Raise every watcher's shutdown flag, then wait for each loop to exit.
///
/// A loop notices the flag on its next timer tick, so this can take up to
/// one poll interval plus any cycle already in flight.
pub async fn stop_watchers(watchers: Vec<(JoinHandle<()>, Arc<AtomicBool>)>) {
    for (_, shutdown) in &watchers {
        shutdown.store(true, Ordering::Relaxed);
    }
    for (handle, _) in watchers {
        if let Err(e) = handle.await {
            error!(error = %e, "Watcher task ended abnormally");
        }
    }
}
