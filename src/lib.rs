//! Two-way synchronization of a pair of directory trees, local or reached over SSH.
//!
//! A run walks both replicas, reconciles them against the baseline (the last state both
//! sides agreed on), plans actions for the changes the caller gave a direction for and
//! executes them, advancing the baseline one path at a time.

#[macro_use]
extern crate log;

pub mod backend;
pub mod baseline;
pub mod config;
pub mod error;
pub mod path;
pub mod plan;
pub mod propagate;
pub mod reconcile;
pub mod snapshot;
pub mod state;

mod compare_files;
mod util;

pub use crate::backend::{Backend, Replicas};
pub use crate::baseline::Baseline;
pub use crate::compare_files::Digest;
pub use crate::config::{Ignore, RemoteOptions, Root, SyncConfig, TrackAll, Tracking};
pub use crate::error::{BackendError, BackendErrorKind, Result, SyncError};
pub use crate::path::PathKey;
pub use crate::plan::{plan, Action, ActionKind, Direction};
pub use crate::propagate::{ExecutionReport, Executor, ExecutorOptions, Outcome};
pub use crate::reconcile::{reconcile, reconcile_replicas, Reconciliation};
pub use crate::snapshot::Snapshot;
pub use crate::state::{DiffType, Entry, Side};
