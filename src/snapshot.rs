use std::collections::btree_map::{self, BTreeMap};
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, EntryKind};
use crate::config::Tracking;
use crate::error::BackendError;
use crate::path::PathKey;
use crate::state::Entry;
use crate::util::is_temp_name;

/// The state of every tracked path in one replica (or in the baseline).
///
/// Paths that are not in the map are `Absent`, so absent entries are never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    entries: BTreeMap<PathKey, Entry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot::default()
    }

    pub fn get(&self, path: &PathKey) -> Entry {
        self.entries.get(path).cloned().unwrap_or(Entry::Absent)
    }

    /// Stores `entry` for `path`. Setting `Absent` removes the path.
    pub fn set(&mut self, path: PathKey, entry: Entry) {
        if entry.exists() {
            self.entries.insert(path, entry);
        } else {
            self.entries.remove(&path);
        }
    }

    pub fn remove(&mut self, path: &PathKey) -> Entry {
        self.entries.remove(path).unwrap_or(Entry::Absent)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &PathKey) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries in key order, so parents come before their children.
    pub fn iter(&self) -> btree_map::Iter<PathKey, Entry> {
        self.entries.iter()
    }

    pub fn paths(&self) -> btree_map::Keys<PathKey, Entry> {
        self.entries.keys()
    }

    /// Drops every entry `tracking` rejects, along with everything below a rejected
    /// folder. Returns the removed paths.
    pub fn retain_tracked<T: Tracking + ?Sized>(&mut self, tracking: &T) -> Vec<PathKey> {
        let mut removed: Vec<PathKey> = Vec::new();
        let mut pruned: Option<PathKey> = None;
        for (path, entry) in &self.entries {
            if let Some(ref folder) = pruned {
                if path.as_str().starts_with(folder.as_str()) {
                    removed.push(path.clone());
                    continue;
                }
            }
            let tracked = if entry.is_folder() {
                tracking.should_track_dir(path)
            } else {
                tracking.should_track_file(path)
            };
            if !tracked {
                removed.push(path.clone());
                if entry.is_folder() {
                    pruned = Some(path.clone());
                }
            }
        }
        for path in &removed {
            self.entries.remove(path);
        }
        removed
    }

    /// Lists every tracked path below the backend's root.
    ///
    /// Symbolic links, special files and unfinished transfers are left out. If any folder
    /// cannot be listed the whole walk fails: a partial snapshot would make the unreadable
    /// subtree look deleted.
    pub fn walk<B, T>(backend: &mut B, tracking: &T) -> Result<Snapshot, BackendError>
    where
        B: Backend + ?Sized,
        T: Tracking + ?Sized,
    {
        let mut snapshot = Snapshot::new();
        let mut pending = VecDeque::new();
        pending.push_back(PathKey::root());

        while let Some(dir) = pending.pop_front() {
            debug!("Walking {} on {}", dir, backend.describe());
            for item in backend.list(&dir)? {
                if is_temp_name(&item.name) {
                    trace!("Skipping unfinished transfer {}{}", dir, item.name);
                    continue;
                }
                let path = match item.kind {
                    EntryKind::Folder => dir.child_folder(&item.name),
                    EntryKind::File => dir.child_file(&item.name),
                    EntryKind::Symlink | EntryKind::Other => {
                        trace!("Skipping {}{} ({:?})", dir, item.name, item.kind);
                        continue;
                    }
                };
                let path = match path {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("Skipping {:?} in {}: {}", item.name, dir, e);
                        continue;
                    }
                };
                let tracked = match item.kind {
                    EntryKind::Folder => tracking.should_track_dir(&path),
                    _ => tracking.should_track_file(&path),
                };
                if !tracked {
                    debug!("Ignoring {}", path);
                    continue;
                }
                if let Some(entry) = item.entry() {
                    trace!("{}: {}", path, entry);
                    if entry.is_folder() {
                        pending.push_back(path.clone());
                    }
                    snapshot.entries.insert(path, entry);
                }
            }
        }
        Ok(snapshot)
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a PathKey, &'a Entry);
    type IntoIter = btree_map::Iter<'a, PathKey, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<(PathKey, Entry)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (PathKey, Entry)>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for (path, entry) in iter {
            snapshot.set(path, entry);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ignore;

    fn key(text: &str) -> PathKey {
        PathKey::parse(text).unwrap()
    }

    #[test]
    fn absent_entries_are_never_stored() {
        let mut snapshot = Snapshot::new();
        snapshot.set(key("/a"), Entry::file(0o644, 1, 1));
        assert_eq!(snapshot.len(), 1);
        snapshot.set(key("/a"), Entry::Absent);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.get(&key("/a")), Entry::Absent);
    }

    #[test]
    fn retain_tracked_drops_whole_subtrees() {
        let mut snapshot: Snapshot = vec![
            (key("/build/"), Entry::folder(0o755)),
            (key("/build/deep/"), Entry::folder(0o755)),
            (key("/build/deep/x.o"), Entry::file(0o644, 1, 1)),
            (key("/src/"), Entry::folder(0o755)),
            (key("/src/main.rs"), Entry::file(0o644, 1, 1)),
        ]
        .into_iter()
        .collect();

        let ignore = Ignore::new(&[], &["build"], &[]).unwrap();
        let removed = snapshot.retain_tracked(&ignore);
        assert_eq!(removed, vec![key("/build/"), key("/build/deep/"), key("/build/deep/x.o")]);
        let left: Vec<&PathKey> = snapshot.paths().collect();
        assert_eq!(left, vec![&key("/src/"), &key("/src/main.rs")]);
    }
}
