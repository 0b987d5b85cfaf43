use crate::backend::Flow;
use crate::path::PathKey;
use crate::plan::Action;

/// Which half of a file copy a transfer update belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Source replica to a local temporary file.
    Download,
    /// Local temporary file to the destination replica.
    Upload,
}

/// Handles progress updates for the propagation step.
pub trait ProgressCallback {
    /// Asked before every action. Returning false skips everything not yet started.
    fn should_continue(&self) -> bool {
        true
    }

    fn action_started(&self, _action: &Action, _index: usize, _total: usize) {}

    /// Byte progress of a file transfer. `Flow::Cancel` abandons the current path only.
    fn transfer_progress(&self, _path: &PathKey, _phase: Phase, _done: u64, _total: u64) -> Flow {
        Flow::Continue
    }
}

/// A zero-sized struct with an empty implementation of ProgressCallback
pub struct EmptyProgressCallback;

impl ProgressCallback for EmptyProgressCallback {}
