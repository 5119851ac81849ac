//! Progress callbacks
//!
//! These let a front end (progress bars, logs) follow an apply without the
//! engine depending on any particular UI.

use crate::plan::PlanAction;
use crate::scheduler::{ActionReport, ApplyReport};

/// Progress callback for apply operations.
///
/// All methods are called from the thread that drives the scheduler, never
/// from worker threads.
pub trait ProgressCallback {
    /// Called once before any action is dispatched
    fn on_apply_start(&mut self, total: usize);

    /// Called when an action is handed to a worker
    fn on_action_start(&mut self, action: &PlanAction);

    /// Called when an action reaches a terminal state (including skips)
    fn on_action_complete(&mut self, report: &ActionReport);

    /// Called once after the last action
    fn on_apply_complete(&mut self, report: &ApplyReport);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_apply_start(&mut self, _total: usize) {}
    fn on_action_start(&mut self, _action: &PlanAction) {}
    fn on_action_complete(&mut self, _report: &ActionReport) {}
    fn on_apply_complete(&mut self, _report: &ApplyReport) {}
}
