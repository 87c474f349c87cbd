//! Per-run context handed to automation scripts.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::{CancelListener, Cancellable, ListenerGuard};
use crate::error::{CancelReason, SchedulerError};
use crate::scheduler::Scheduler;

/// Where and under what name a run writes its logs
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunInfo {
    /// Used as the log file name, so it must be a valid file name
    pub run_name: String,
    pub run_dir: PathBuf,
}

impl Default for RunInfo {
    fn default() -> Self {
        // Current time to the second, without characters that are invalid
        // in Windows file names
        let run_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(':', "");
        Self {
            run_name,
            run_dir: std::fs::canonicalize("./").unwrap_or_default(),
        }
    }
}

/// Releases the controller when the run's scope is cancelled
struct ReleaseOnCancel {
    scheduler: Weak<Scheduler>,
}

impl CancelListener for ReleaseOnCancel {
    fn on_cancel(&self, reason: &CancelReason) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            warn!(
                "Run on `{}` cancelled ({reason}), returning controller to neutral",
                scheduler.name()
            );
            scheduler.cancel_all_commands();
        }
    }
}

/// A scheduler paired with the cancellation scope of one automation run.
///
/// The scope is a child of the caller's scope. Cancelling either one wakes
/// every command blocked in the scheduler and drops whatever the run has
/// queued, so the relay goes back to neutral immediately.
pub struct ControllerContext {
    scheduler: Arc<Scheduler>,
    scope: Cancellable,
    _release: ListenerGuard,
    _hook: Arc<ReleaseOnCancel>,
}

impl ControllerContext {
    pub fn new(scheduler: Arc<Scheduler>, parent: &Cancellable) -> Self {
        let scope = parent.child();
        let hook = Arc::new(ReleaseOnCancel {
            scheduler: Arc::downgrade(&scheduler),
        });
        let release = scope.attach(&hook);
        Self {
            scheduler,
            scope,
            _release: release,
            _hook: hook,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Pass this to every command issued for the run
    pub fn scope(&self) -> &Cancellable {
        &self.scope
    }

    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Block until everything the run issued has been executed.
    pub fn wait_for_all(&self) -> Result<(), SchedulerError> {
        self.scheduler.wait_for_all(&self.scope)
    }
}
