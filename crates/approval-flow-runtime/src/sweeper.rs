use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use approval_flow_core::{ApprovalStore, EngineError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ApprovalRuntime, LOG_TARGET};

/// Outcome counts of one sweeper pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Lost the race to another action, or the deadline moved.
    pub skipped: usize,
    pub failed: usize,
}

impl<S: ApprovalStore> ApprovalRuntime<S> {
    /// Expires every in-progress instance whose deadline is at or before
    /// `now`, up to `sweep_batch_limit` per pass.
    ///
    /// # Errors
    /// Fails only when the candidate scan itself fails; per-instance errors
    /// are counted in the report.
    pub fn sweep_expired(&self, now: OffsetDateTime) -> Result<SweepReport, EngineError> {
        let candidates = self
            .store
            .list_expired(now, self.config.sweep_batch_limit)?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in candidates {
            match self.expire_as_of(candidate.id, now) {
                Ok(_) => report.expired += 1,
                Err(EngineError::NotInProgress { .. } | EngineError::NotExpired { .. }) => {
                    report.skipped += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        target: LOG_TARGET,
                        instance_id = %candidate.id,
                        code = err.code(),
                        error = %err,
                        "Sweeper could not expire instance"
                    );
                }
            }
        }

        tracing::info!(
            target: LOG_TARGET,
            scanned = report.scanned,
            expired = report.expired,
            skipped = report.skipped,
            failed = report.failed,
            "Expiry sweep finished"
        );
        Ok(report)
    }
}

/// Periodic driver for [`ApprovalRuntime::sweep_expired`].
pub struct ExpirySweeper<S> {
    runtime: Arc<ApprovalRuntime<S>>,
}

impl<S> Clone for ExpirySweeper<S> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
        }
    }
}

impl<S> ExpirySweeper<S>
where
    S: ApprovalStore + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(runtime: Arc<ApprovalRuntime<S>>) -> Self {
        Self { runtime }
    }

    /// # Errors
    /// See [`ApprovalRuntime::sweep_expired`].
    pub fn run_once(&self, now: OffsetDateTime) -> Result<SweepReport, EngineError> {
        self.runtime.sweep_expired(now)
    }

    /// Sweeps on a dedicated thread every `sweep_interval_secs`, judged by
    /// the runtime clock, until the handle is stopped or dropped.
    #[must_use]
    pub fn spawn(self) -> SweeperHandle {
        let interval = Duration::from_secs(self.runtime.config().sweep_interval_secs);
        self.spawn_every(interval)
    }

    #[must_use]
    pub fn spawn_every(self, interval: Duration) -> SweeperHandle {
        let (stop, stopped) = mpsc::channel::<()>();
        let join = thread::spawn(move || loop {
            if let Err(err) = self.run_once(self.runtime.now()) {
                tracing::warn!(
                    target: LOG_TARGET,
                    code = err.code(),
                    error = %err,
                    "Expiry sweep failed"
                );
            }
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        SweeperHandle {
            stop: Some(stop),
            join: Some(join),
        }
    }
}

/// Stops the sweeper thread when `stop` is called or the handle is dropped.
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signals the thread and waits for the current pass to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!(target: LOG_TARGET, "Expiry sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
