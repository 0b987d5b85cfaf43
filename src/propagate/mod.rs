//! Applies planned actions to the replicas, one path at a time, and advances the baseline
//! for every path that made it.

use tempfile::NamedTempFile;

use crate::backend::{Backend, Replicas};
use crate::baseline::Baseline;
use crate::config::SyncConfig;
use crate::error::{BackendError, BackendErrorKind, Result};
use crate::path::PathKey;
use crate::plan::{Action, ActionKind};
use crate::state::{DiffType, Entry, Side};

mod progress;
pub use crate::propagate::progress::{EmptyProgressCallback, Phase, ProgressCallback};
pub use crate::util::temp_key_for;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Hash both sides of a file whose content seems to have changed (equal size and mode,
    /// different mtime) and only copy the mtime when the digests match.
    pub compare_file_contents: bool,
}

impl<'a> From<&'a SyncConfig> for ExecutorOptions {
    fn from(config: &'a SyncConfig) -> Self {
        ExecutorOptions {
            compare_file_contents: config.compare_file_contents,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    Backend(BackendError),
    /// The replica no longer matched the state the plan was made from, so it was left alone.
    PathModified(Side),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Cancelled,
    /// An earlier action lost a replica.
    BatchAborted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Failed(Failure),
    Skipped(SkipReason),
}

/// What happened to every planned path, in execution order.
#[derive(Clone, Debug, Default)]
pub struct ExecutionReport {
    outcomes: Vec<(PathKey, Outcome)>,
    aborted: Option<(Side, BackendError)>,
}

impl ExecutionReport {
    pub fn outcomes(&self) -> &[(PathKey, Outcome)] {
        &self.outcomes
    }

    pub fn outcome(&self, path: &PathKey) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|&&(ref p, _)| p == path)
            .map(|&(_, ref outcome)| outcome)
    }

    pub fn applied(&self) -> Vec<&PathKey> {
        self.outcomes
            .iter()
            .filter(|&&(_, ref outcome)| *outcome == Outcome::Applied)
            .map(|&(ref path, _)| path)
            .collect()
    }

    pub fn failed(&self) -> Vec<(&PathKey, &Failure)> {
        self.outcomes
            .iter()
            .filter_map(|&(ref path, ref outcome)| match *outcome {
                Outcome::Failed(ref failure) => Some((path, failure)),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<(&PathKey, SkipReason)> {
        self.outcomes
            .iter()
            .filter_map(|&(ref path, ref outcome)| match *outcome {
                Outcome::Skipped(reason) => Some((path, reason)),
                _ => None,
            })
            .collect()
    }

    /// The error that stopped the batch early, if any.
    pub fn aborted(&self) -> Option<&(Side, BackendError)> {
        self.aborted.as_ref()
    }
}

/// Why a single action did not complete.
enum Interrupt {
    Modified(Side),
    Backend(Side, BackendError),
}

fn on(side: Side) -> impl Fn(BackendError) -> Interrupt {
    move |err| Interrupt::Backend(side, err)
}

pub struct Executor<'r> {
    replicas: &'r mut Replicas,
    baseline: &'r mut Baseline,
    options: ExecutorOptions,
}

impl<'r> Executor<'r> {
    pub fn new(replicas: &'r mut Replicas, baseline: &'r mut Baseline, options: ExecutorOptions) -> Self {
        Executor {
            replicas,
            baseline,
            options,
        }
    }

    /// Runs `actions` in order. Per-path failures end up in the report; only a failure to
    /// persist the baseline is returned as an error.
    pub fn execute<P: ProgressCallback + ?Sized>(
        &mut self,
        actions: &[Action],
        progress: &P,
    ) -> Result<ExecutionReport> {
        let total = actions.len();
        let mut report = ExecutionReport::default();
        let mut stop: Option<SkipReason> = None;

        for (index, action) in actions.iter().enumerate() {
            if stop.is_none() && !progress.should_continue() {
                info!("Cancelled with {} actions left", total - index);
                stop = Some(SkipReason::Cancelled);
            }
            if let Some(reason) = stop {
                report.outcomes.push((action.path.clone(), Outcome::Skipped(reason)));
                continue;
            }

            progress.action_started(action, index, total);
            let outcome = match self.apply(action, progress) {
                Ok(()) => {
                    self.commit(action)?;
                    info!("{} {:?} on replica {}", action.path, action.diff, action.destination());
                    Outcome::Applied
                }
                Err(Interrupt::Modified(side)) => {
                    warn!("{} changed on replica {} since it was scanned, skipping", action.path, side);
                    Outcome::Failed(Failure::PathModified(side))
                }
                Err(Interrupt::Backend(_, ref err)) if err.kind == BackendErrorKind::Cancelled => {
                    info!("Transfer of {} cancelled", action.path);
                    Outcome::Skipped(SkipReason::Cancelled)
                }
                Err(Interrupt::Backend(side, err)) => {
                    warn!("Could not sync {} on replica {}: {}", action.path, side, err);
                    if err.is_batch_fatal() {
                        warn!("Replica {} is gone, abandoning the remaining actions", side);
                        report.aborted = Some((side, err.clone()));
                        stop = Some(SkipReason::BatchAborted);
                    }
                    Outcome::Failed(Failure::Backend(err))
                }
            };
            report.outcomes.push((action.path.clone(), outcome));
        }
        Ok(report)
    }

    fn apply<P: ProgressCallback + ?Sized>(
        &mut self,
        action: &Action,
        progress: &P,
    ) -> std::result::Result<(), Interrupt> {
        match action.kind {
            ActionKind::Copy { from, to } => {
                self.check_unchanged(to, &action.path, action.target)?;
                self.check_unchanged(from, &action.path, action.source)?;
                self.copy(action, from, to, action.diff, progress)
            }
            ActionKind::Replace {
                from,
                to,
                ref displaced,
                displaced_entry,
            } => {
                // both keys name the same entry on disk
                self.check_unchanged(to, displaced, displaced_entry)?;
                self.check_unchanged(from, &action.path, action.source)?;
                remove_entry(self.replicas.get_mut(to), displaced, displaced_entry).map_err(on(to))?;
                self.copy(action, from, to, DiffType::New, progress)
            }
            ActionKind::Remove { on: side } => {
                self.check_unchanged(side, &action.path, action.target)?;
                remove_entry(self.replicas.get_mut(side), &action.path, action.target)
                    .map_err(on(side))
            }
        }
    }

    fn check_unchanged(
        &mut self,
        side: Side,
        path: &PathKey,
        expected: Entry,
    ) -> std::result::Result<(), Interrupt> {
        let current = self.replicas.get_mut(side).metadata(path).map_err(on(side))?;
        if current != expected {
            debug!("{} on replica {}: expected {}, found {}", path, side, expected, current);
            return Err(Interrupt::Modified(side));
        }
        Ok(())
    }

    /// Makes `to` look like `from` at `action.path`.
    fn copy<P: ProgressCallback + ?Sized>(
        &mut self,
        action: &Action,
        from: Side,
        to: Side,
        diff: DiffType,
        progress: &P,
    ) -> std::result::Result<(), Interrupt> {
        let path = &action.path;
        match action.source {
            Entry::Absent => remove_entry(self.replicas.get_mut(to), path, action.target).map_err(on(to)),
            Entry::Folder { mode } => {
                let dest = self.replicas.get_mut(to);
                if diff == DiffType::New {
                    dest.mkdir(path, mode).map_err(on(to))?;
                }
                // mkdir is subject to the umask
                dest.chmod(path, mode).map_err(on(to))
            }
            Entry::File { mode, mtime, .. } => {
                let mut diff = diff;
                if diff == DiffType::ContentChanged
                    && self.options.compare_file_contents
                    && self.same_content(action, from, to)?
                {
                    debug!("{} has the same content on both replicas, copying the mtime only", path);
                    diff = DiffType::MtimeChanged;
                }
                match diff {
                    DiffType::New | DiffType::ContentChanged | DiffType::TypeMismatch => {
                        self.transfer(path, from, to, progress)?;
                        let dest = self.replicas.get_mut(to);
                        dest.chmod(path, mode).map_err(on(to))?;
                        dest.set_times(path, mtime).map_err(on(to))
                    }
                    DiffType::ModeChanged => {
                        let dest = self.replicas.get_mut(to);
                        dest.chmod(path, mode).map_err(on(to))?;
                        dest.set_times(path, mtime).map_err(on(to))
                    }
                    DiffType::MtimeChanged => self.replicas.get_mut(to).set_times(path, mtime).map_err(on(to)),
                    DiffType::None | DiffType::Removed => Ok(()),
                }
            }
        }
    }

    fn same_content(&mut self, action: &Action, from: Side, to: Side) -> std::result::Result<bool, Interrupt> {
        match (action.source, action.target) {
            (
                Entry::File { mode: s_mode, size: s_size, .. },
                Entry::File { mode: t_mode, size: t_size, .. },
            ) if s_mode == t_mode && s_size == t_size => {
                let source = self.replicas.get_mut(from).digest(&action.path).map_err(on(from))?;
                let target = self.replicas.get_mut(to).digest(&action.path).map_err(on(to))?;
                Ok(source == target)
            }
            _ => Ok(false),
        }
    }

    /// Copies the content of a file through a local temporary file, writes it next to the
    /// destination under a temporary name and renames it into place.
    fn transfer<P: ProgressCallback + ?Sized>(
        &mut self,
        path: &PathKey,
        from: Side,
        to: Side,
        progress: &P,
    ) -> std::result::Result<(), Interrupt> {
        let local = NamedTempFile::new()
            .map_err(|e| Interrupt::Backend(from, BackendError::from_io(e, "creating temporary file")))?;
        let temp = temp_key_for(path);
        let (source, dest) = self.replicas.pair_mut(from);

        source
            .read_into(path, local.path(), &mut |done, total| {
                progress.transfer_progress(path, Phase::Download, done, total)
            })
            .map_err(on(from))?;

        let written = dest
            .write_from(local.path(), &temp, &mut |done, total| {
                progress.transfer_progress(path, Phase::Upload, done, total)
            })
            .and_then(|()| dest.rename(&temp, path));
        if let Err(err) = written {
            if !err.is_batch_fatal() {
                if let Err(cleanup) = dest.remove(&temp) {
                    debug!("Could not remove {} on replica {}: {}", temp, to, cleanup);
                }
            }
            return Err(Interrupt::Backend(to, err));
        }
        Ok(())
    }

    fn commit(&mut self, action: &Action) -> Result<()> {
        if let ActionKind::Replace { ref displaced, .. } = action.kind {
            self.baseline.record(displaced, Entry::Absent)?;
        }
        self.baseline.record(&action.path, action.source)
    }
}

fn remove_entry(backend: &mut dyn Backend, path: &PathKey, entry: Entry) -> std::result::Result<(), BackendError> {
    match entry {
        Entry::Absent => Ok(()),
        Entry::File { .. } => backend.remove(path),
        Entry::Folder { .. } => backend.rmdir(path),
    }
}
