//! Turns reconciled changes and the caller's directions into an ordered list of actions.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use crate::error::{Result, SyncError};
use crate::path::PathKey;
use crate::reconcile::Reconciliation;
use crate::state::{DiffType, Entry, Side};
use crate::util::FnvHashMap;

/// Which way a changed path should be propagated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    AToB,
    BToA,
    Skip,
}

impl Direction {
    /// The replica whose state wins, if any.
    pub fn source(self) -> Option<Side> {
        match self {
            Direction::AToB => Some(Side::A),
            Direction::BToA => Some(Side::B),
            Direction::Skip => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Make `to` look like `from` at this path: create, update content or fix metadata.
    Copy { from: Side, to: Side },
    /// The path changed kind. `displaced` (the same name with the other kind) is removed
    /// from `to` before the new entry is created there.
    Replace {
        from: Side,
        to: Side,
        displaced: PathKey,
        displaced_entry: Entry,
    },
    Remove { on: Side },
}

/// One step of a synchronization run. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub path: PathKey,
    pub kind: ActionKind,
    pub diff: DiffType,
    /// What the destination should end up as at `path`.
    pub source: Entry,
    /// What the destination held at `path` when the plan was made.
    pub target: Entry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Wave {
    Create,
    Update,
    Remove,
}

impl Action {
    pub fn destination(&self) -> Side {
        match self.kind {
            ActionKind::Copy { to, .. } | ActionKind::Replace { to, .. } => to,
            ActionKind::Remove { on } => on,
        }
    }

    fn wave(&self) -> Wave {
        match self.kind {
            ActionKind::Copy { .. } if self.diff == DiffType::New => Wave::Create,
            ActionKind::Copy { .. } => Wave::Update,
            ActionKind::Replace { .. } if self.source.is_folder() => Wave::Create,
            ActionKind::Replace { .. } | ActionKind::Remove { .. } => Wave::Remove,
        }
    }
}

/// Orders actions so parents exist before their children are created, and children are
/// gone before their parents are removed.
fn execution_order(x: &Action, y: &Action) -> Ordering {
    let (wx, wy) = (x.wave(), y.wave());
    wx.cmp(&wy).then_with(|| match wx {
        Wave::Remove => y.path.cmp(&x.path),
        Wave::Create | Wave::Update => x.path.cmp(&y.path),
    })
}

/// Plans the actions for every change the caller gave a direction for.
///
/// Changes without a direction are skipped, and so are unresolved conflicts unless a
/// direction was given for them explicitly. A direction for a path that did not change is
/// a configuration error, and nothing is planned in that case.
pub fn plan(
    reconciliation: &Reconciliation,
    directions: &BTreeMap<PathKey, Direction>,
) -> Result<Vec<Action>> {
    for path in directions.keys() {
        if reconciliation.change(path).is_none() {
            return Err(SyncError::Configuration(format!(
                "direction given for {}, which has not changed",
                path
            )));
        }
    }

    let mut actions = Vec::new();
    for change in reconciliation.iter() {
        let direction = directions.get(&change.path).cloned().unwrap_or(Direction::Skip);
        let from = match direction.source() {
            Some(side) => side,
            None => {
                if change.is_conflict() {
                    debug!("Leaving conflict {} unresolved", change.path);
                }
                continue;
            }
        };
        let to = from.other();
        let source = change.live(from);
        let target = change.live(to);
        let diff = target.diff(&source);
        let kind = match diff {
            DiffType::None => continue,
            DiffType::Removed => ActionKind::Remove { on: to },
            _ => ActionKind::Copy { from, to },
        };
        actions.push(Action {
            path: change.path.clone(),
            kind,
            diff,
            source,
            target,
        });
    }

    fuse_replacements(&mut actions);
    actions.sort_by(execution_order);
    debug!("Planned {} actions", actions.len());
    Ok(actions)
}

/// A creation at `/x` and a removal of `/x/` on the same replica (or the other way round)
/// become one `Replace`, since both names refer to the same filesystem entry.
fn fuse_replacements(actions: &mut Vec<Action>) {
    let mut removals: FnvHashMap<(PathKey, Side), usize> = FnvHashMap::default();
    for (index, action) in actions.iter().enumerate() {
        if let ActionKind::Remove { on } = action.kind {
            removals.insert((action.path.clone(), on), index);
        }
    }
    if removals.is_empty() {
        return;
    }

    let mut fused = HashSet::new();
    for index in 0..actions.len() {
        let (from, to) = match actions[index].kind {
            ActionKind::Copy { from, to } if actions[index].diff == DiffType::New => (from, to),
            _ => continue,
        };
        let displaced = match actions[index].path.counterpart() {
            Some(displaced) => displaced,
            None => continue,
        };
        if let Some(&removal) = removals.get(&(displaced.clone(), to)) {
            let displaced_entry = actions[removal].target;
            trace!("{} replaces {} on replica {}", actions[index].path, displaced, to);
            let action = &mut actions[index];
            action.kind = ActionKind::Replace {
                from,
                to,
                displaced,
                displaced_entry,
            };
            action.diff = DiffType::TypeMismatch;
            fused.insert(removal);
        }
    }

    let mut index = 0;
    actions.retain(|_| {
        let keep = !fused.contains(&index);
        index += 1;
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::Baseline;
    use crate::compare_files::Digest;
    use crate::error::BackendError;
    use crate::reconcile::{reconcile, ContentHasher};
    use crate::snapshot::Snapshot;

    struct NoHashing;

    impl ContentHasher for NoHashing {
        fn digest(&mut self, _: Side, path: &PathKey) -> std::result::Result<Digest, BackendError> {
            panic!("unexpected digest of {}", path)
        }
    }

    fn key(text: &str) -> PathKey {
        PathKey::parse(text).unwrap()
    }

    fn reconciled(base: &[(&str, Entry)], a: &[(&str, Entry)], b: &[(&str, Entry)]) -> Reconciliation {
        let dir = tempfile::tempdir().unwrap();
        let mut baseline = Baseline::open(dir.path().join(".data_plan")).unwrap();
        for &(path, entry) in base {
            baseline.record(&key(path), entry).unwrap();
        }
        fn snapshot(entries: &[(&str, Entry)]) -> Snapshot {
            entries.iter().map(|&(path, entry)| (key(path), entry)).collect()
        }
        reconcile(&mut baseline, &snapshot(a), &snapshot(b), &mut NoHashing).unwrap()
    }

    #[test]
    fn creations_ascend_and_removals_descend() {
        let folder = Entry::folder(0o755);
        let file = Entry::file(0o644, 1, 1);
        let result = reconciled(
            &[("/x/", folder), ("/x/y/", folder)],
            &[("/a/", folder), ("/a/b/", folder), ("/a/b/c.txt", file)],
            &[("/x/", folder), ("/x/y/", folder)],
        );
        let actions = plan(&result, &result.suggested_directions()).unwrap();
        let order: Vec<&str> = actions.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(order, vec!["/a/", "/a/b/", "/a/b/c.txt", "/x/y/", "/x/"]);
        assert_eq!(actions[4].kind, ActionKind::Remove { on: Side::B });
    }

    #[test]
    fn direction_for_unchanged_path_is_rejected() {
        let result = reconciled(&[], &[], &[]);
        let mut directions = BTreeMap::new();
        directions.insert(key("/nothing"), Direction::AToB);
        assert!(matches!(
            plan(&result, &directions),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn conflicts_need_an_explicit_direction() {
        let before = Entry::file(0o644, 1, 1);
        let result = reconciled(
            &[("/f", before)],
            &[("/f", Entry::file(0o644, 2, 2))],
            &[("/f", Entry::file(0o644, 3, 3))],
        );
        assert!(plan(&result, &result.suggested_directions()).unwrap().is_empty());

        let mut directions = BTreeMap::new();
        directions.insert(key("/f"), Direction::BToA);
        let actions = plan(&result, &directions).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Copy { from: Side::B, to: Side::A });
        assert_eq!(actions[0].diff, DiffType::ContentChanged);
    }

    #[test]
    fn folder_turned_file_is_one_replace_after_its_children() {
        let folder = Entry::folder(0o755);
        let file = Entry::file(0o644, 1, 1);
        let result = reconciled(
            &[("/x/", folder), ("/x/inner", file)],
            &[("/x", file)],
            &[("/x/", folder), ("/x/inner", file)],
        );
        let actions = plan(&result, &result.suggested_directions()).unwrap();
        let order: Vec<&str> = actions.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(order, vec!["/x/inner", "/x"]);
        assert_eq!(actions[1].diff, DiffType::TypeMismatch);
        assert_eq!(
            actions[1].kind,
            ActionKind::Replace {
                from: Side::A,
                to: Side::B,
                displaced: key("/x/"),
                displaced_entry: folder,
            }
        );
    }
}
