//! Three-way comparison of two live snapshots against the baseline.

use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

use crate::backend::Replicas;
use crate::baseline::Baseline;
use crate::compare_files::Digest;
use crate::config::Tracking;
use crate::error::{BackendError, Result, SyncError};
use crate::path::PathKey;
use crate::plan::Direction;
use crate::snapshot::Snapshot;
use crate::state::{DiffType, Entry, Side};

/// Supplies content digests when two files with identical metadata must be told apart.
pub trait ContentHasher {
    fn digest(&mut self, side: Side, path: &PathKey) -> std::result::Result<Digest, BackendError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangedOn {
    A,
    B,
    Both,
}

/// A path whose live state differs from the baseline on at least one side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub path: PathKey,
    pub baseline: Entry,
    pub a: Entry,
    pub b: Entry,
    pub changed_on: ChangedOn,
}

impl Change {
    pub fn live(&self, side: Side) -> Entry {
        match side {
            Side::A => self.a,
            Side::B => self.b,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.changed_on == ChangedOn::Both
    }

    /// What happened on `side` since the last synchronization.
    pub fn state_on(&self, side: Side) -> DiffType {
        self.baseline.diff(&self.live(side))
    }

    /// The replica that changed is taken to be correct. Conflicts have no suggestion.
    pub fn suggested_direction(&self) -> Option<Direction> {
        match self.changed_on {
            ChangedOn::A => Some(Direction::AToB),
            ChangedOn::B => Some(Direction::BToA),
            ChangedOn::Both => None,
        }
    }
}

/// Everything that needs a decision, plus the conflicts that settled themselves.
#[derive(Clone, Debug, Default)]
pub struct Reconciliation {
    changes: BTreeMap<PathKey, Change>,
    auto_resolved: Vec<PathKey>,
}

impl Reconciliation {
    pub fn changes(&self) -> BTreeSet<PathKey> {
        self.changes.keys().cloned().collect()
    }

    /// Paths changed on both sides. Always a subset of `changes()`.
    pub fn conflicts(&self) -> BTreeSet<PathKey> {
        self.changes
            .values()
            .filter(|change| change.is_conflict())
            .map(|change| change.path.clone())
            .collect()
    }

    pub fn change(&self, path: &PathKey) -> Option<&Change> {
        self.changes.get(path)
    }

    pub fn iter(&self) -> btree_map::Values<PathKey, Change> {
        self.changes.values()
    }

    /// Conflicts recorded straight into the baseline because both sides ended up equal.
    pub fn auto_resolved(&self) -> &[PathKey] {
        &self.auto_resolved
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Propagates every one-sided change away from the side that made it.
    pub fn suggested_directions(&self) -> BTreeMap<PathKey, Direction> {
        self.changes
            .values()
            .filter_map(|change| {
                change
                    .suggested_direction()
                    .map(|direction| (change.path.clone(), direction))
            })
            .collect()
    }
}

/// Compares both live snapshots with the baseline and settles the conflicts that need no
/// decision, recording them in the baseline.
pub fn reconcile<H: ContentHasher + ?Sized>(
    baseline: &mut Baseline,
    live_a: &Snapshot,
    live_b: &Snapshot,
    hasher: &mut H,
) -> Result<Reconciliation> {
    let mut candidates: BTreeSet<PathKey> = baseline.snapshot().paths().cloned().collect();
    candidates.extend(live_a.paths().cloned());
    candidates.extend(live_b.paths().cloned());

    let mut result = Reconciliation::default();
    for path in candidates {
        let before = baseline.get(&path);
        let a = live_a.get(&path);
        let b = live_b.get(&path);
        let changed_on = match (a != before, b != before) {
            (false, false) => continue,
            (true, false) => ChangedOn::A,
            (false, true) => ChangedOn::B,
            (true, true) => ChangedOn::Both,
        };

        if changed_on == ChangedOn::Both && a == b {
            if resolves(&path, &a, hasher)? {
                debug!("{} changed identically on both replicas", path);
                baseline.record(&path, a)?;
                result.auto_resolved.push(path);
                continue;
            }
        }

        trace!("{} changed on {:?}: was {}, A {}, B {}", path, changed_on, before, a, b);
        result.changes.insert(
            path.clone(),
            Change {
                path,
                baseline: before,
                a,
                b,
                changed_on,
            },
        );
    }

    if !result.changes.is_empty() {
        info!(
            "{} changed paths, {} conflicts, {} settled automatically",
            result.changes.len(),
            result.conflicts().len(),
            result.auto_resolved.len()
        );
    }
    Ok(result)
}

/// Whether a conflict whose two live entries are equal can be recorded without asking.
fn resolves<H: ContentHasher + ?Sized>(path: &PathKey, entry: &Entry, hasher: &mut H) -> Result<bool> {
    match *entry {
        Entry::Absent | Entry::Folder { .. } => Ok(true),
        Entry::File { .. } => {
            let a = match hasher.digest(Side::A, path) {
                Ok(digest) => digest,
                Err(e) => return hashing_failed(Side::A, path, e),
            };
            let b = match hasher.digest(Side::B, path) {
                Ok(digest) => digest,
                Err(e) => return hashing_failed(Side::B, path, e),
            };
            if a != b {
                warn!("{} has identical metadata but different content ({} vs {})", path, a, b);
            }
            Ok(a == b)
        }
    }
}

fn hashing_failed(side: Side, path: &PathKey, err: BackendError) -> Result<bool> {
    if err.is_batch_fatal() {
        return Err(SyncError::backend(side, err));
    }
    warn!("Could not hash {} on replica {}: {}", path, side, err);
    Ok(false)
}

/// Walks both replicas and reconciles them against the baseline.
pub fn reconcile_replicas<T: Tracking + ?Sized>(
    baseline: &mut Baseline,
    replicas: &mut Replicas,
    tracking: &T,
) -> Result<Reconciliation> {
    let live_a = Snapshot::walk(replicas.get_mut(Side::A), tracking)
        .map_err(|e| SyncError::backend(Side::A, e))?;
    let live_b = Snapshot::walk(replicas.get_mut(Side::B), tracking)
        .map_err(|e| SyncError::backend(Side::B, e))?;
    reconcile(baseline, &live_a, &live_b, replicas)
}
