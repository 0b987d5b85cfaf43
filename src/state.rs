use std::fmt;

use serde::{Deserialize, Serialize};

/// Only permission bits are tracked; file type bits and setuid/sticky bits are dropped.
pub const MODE_MASK: u32 = 0o777;

/// One of the two replicas being kept in sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Mirrors the state of a path on one replica.
pub enum Entry {
    Absent,
    File { mode: u32, mtime: u64, size: u64 },
    Folder { mode: u32 },
}

impl Default for Entry {
    fn default() -> Self {
        Entry::Absent
    }
}

impl Entry {
    pub fn file(mode: u32, mtime: u64, size: u64) -> Entry {
        Entry::File {
            mode: mode & MODE_MASK,
            mtime,
            size,
        }
    }

    pub fn folder(mode: u32) -> Entry {
        Entry::Folder {
            mode: mode & MODE_MASK,
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(*self, Entry::Absent)
    }

    pub fn is_file(&self) -> bool {
        matches!(*self, Entry::File { .. })
    }

    pub fn is_folder(&self) -> bool {
        matches!(*self, Entry::Folder { .. })
    }

    pub fn mode(&self) -> Option<u32> {
        match *self {
            Entry::Absent => None,
            Entry::File { mode, .. } | Entry::Folder { mode } => Some(mode),
        }
    }

    /// Classifies what has to happen to `self` (the target) to make it look like `source`.
    pub fn diff(&self, source: &Entry) -> DiffType {
        match (*self, *source) {
            (target, source) if target == source => DiffType::None,
            (Entry::Absent, _) => DiffType::New,
            (_, Entry::Absent) => DiffType::Removed,
            (Entry::File { .. }, Entry::Folder { .. }) | (Entry::Folder { .. }, Entry::File { .. }) => {
                DiffType::TypeMismatch
            }
            (Entry::Folder { .. }, Entry::Folder { .. }) => DiffType::ModeChanged,
            (
                Entry::File { mtime: t_mtime, size: t_size, .. },
                Entry::File { mtime: s_mtime, size: s_size, .. },
            ) if t_size != s_size || t_mtime != s_mtime => DiffType::ContentChanged,
            (Entry::File { .. }, Entry::File { .. }) => DiffType::ModeChanged,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Entry::Absent => f.write_str("absent"),
            Entry::File { mode, mtime, size } => {
                write!(f, "file mode {:03o}, mtime {}, {} bytes", mode, mtime, size)
            }
            Entry::Folder { mode } => write!(f, "folder mode {:03o}", mode),
        }
    }
}

/// The result of comparing two entries, ordered by how much work it takes to repair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiffType {
    None,
    New,
    Removed,
    TypeMismatch,
    ModeChanged,
    MtimeChanged,
    ContentChanged,
}

/// Modification times are whole seconds. Sub-second precision is dropped when a listing is
/// taken and a negative time keeps its magnitude, so both backends produce the same value.
pub fn truncate_mtime(seconds: i64) -> u64 {
    seconds.unsigned_abs()
}
