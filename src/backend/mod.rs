//! Uniform access to a replica's filesystem tree, whether it lives on this machine or
//! behind an SSH connection.

use std::io::{Read, Write};
use std::path::Path;

use crate::compare_files::{digest_file, Digest};
use crate::config::{RemoteOptions, Root, SyncConfig};
use crate::error::{BackendError, Result, SyncError};
use crate::path::PathKey;
use crate::reconcile::ContentHasher;
use crate::state::{Entry, Side};

pub mod local;
pub mod remote;

pub use self::local::LocalBackend;
pub use self::remote::{
    AcceptUnknownHosts, Destination, HostKeyDecision, HostKeyPolicy, RejectUnknownHosts,
    RemoteBackend,
};

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
    Symlink,
    /// Sockets, devices, fifos.
    Other,
}

/// One row of a directory listing, captured at listing time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
}

impl ListEntry {
    /// The snapshot entry for this row, or `None` for kinds that are never synchronized.
    pub fn entry(&self) -> Option<Entry> {
        match self.kind {
            EntryKind::File => Some(Entry::file(self.mode, self.mtime, self.size)),
            EntryKind::Folder => Some(Entry::folder(self.mode)),
            EntryKind::Symlink | EntryKind::Other => None,
        }
    }
}

/// Returned by transfer progress callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Cancel,
}

/// Called with `(bytes_done, bytes_total)` after every chunk of a transfer.
pub type TransferProgress<'a> = dyn FnMut(u64, u64) -> Flow + 'a;

/// The operations synchronization needs from a replica. Every path is relative to the
/// backend's root.
pub trait Backend {
    /// Human readable location for log messages.
    fn describe(&self) -> String;

    /// Lists one folder, sorted by name. Symbolic links are reported, never followed.
    fn list(&mut self, dir: &PathKey) -> std::result::Result<Vec<ListEntry>, BackendError>;

    /// The current state of a single path, without following symbolic links. Anything
    /// that is neither a file nor a folder is an error.
    fn metadata(&mut self, path: &PathKey) -> std::result::Result<Entry, BackendError>;

    /// Copies the content of `path` into the local file `local`.
    fn read_into(
        &mut self,
        path: &PathKey,
        local: &Path,
        progress: &mut TransferProgress,
    ) -> std::result::Result<(), BackendError>;

    /// Copies the local file `local` to `path`, replacing whatever was there.
    fn write_from(
        &mut self,
        local: &Path,
        path: &PathKey,
        progress: &mut TransferProgress,
    ) -> std::result::Result<(), BackendError>;

    fn chmod(&mut self, path: &PathKey, mode: u32) -> std::result::Result<(), BackendError>;

    fn set_times(&mut self, path: &PathKey, mtime: u64) -> std::result::Result<(), BackendError>;

    fn mkdir(&mut self, path: &PathKey, mode: u32) -> std::result::Result<(), BackendError>;

    fn rmdir(&mut self, path: &PathKey) -> std::result::Result<(), BackendError>;

    fn remove(&mut self, path: &PathKey) -> std::result::Result<(), BackendError>;

    /// Moves `from` to `to`, replacing an existing file at `to`.
    ///
    /// Atomic on local filesystems. A remote server that cannot rename over a file has the
    /// target removed first, so `to` is briefly absent there.
    fn rename(&mut self, from: &PathKey, to: &PathKey) -> std::result::Result<(), BackendError>;

    fn digest(&mut self, path: &PathKey) -> std::result::Result<Digest, BackendError> {
        download_digest(self, path)
    }
}

/// Hashes a file by pulling it into a local temporary file first.
pub fn download_digest<B: Backend + ?Sized>(
    backend: &mut B,
    path: &PathKey,
) -> std::result::Result<Digest, BackendError> {
    let local = tempfile::NamedTempFile::new()
        .map_err(|e| BackendError::from_io(e, "creating temporary file"))?;
    backend.read_into(path, local.path(), &mut |_, _| Flow::Continue)?;
    digest_file(local.path()).map_err(|e| BackendError::from_io(e, format!("hashing {}", path)))
}

/// Streams `reader` into `writer`, reporting progress after every chunk.
pub(crate) fn copy_with_progress<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    progress: &mut TransferProgress,
    context: &str,
) -> std::result::Result<(), BackendError> {
    let mut buffer = vec![0; COPY_BUFFER];
    let mut done = 0u64;
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| BackendError::from_io(e, format!("reading {}", context)))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|e| BackendError::from_io(e, format!("writing {}", context)))?;
        done += read as u64;
        if progress(done, total.max(done)) == Flow::Cancel {
            return Err(BackendError::cancelled(format!("transfer of {} cancelled", context)));
        }
    }
    writer
        .flush()
        .map_err(|e| BackendError::from_io(e, format!("flushing {}", context)))
}

/// The two replicas of a synchronization pair.
pub struct Replicas {
    a: Box<dyn Backend>,
    b: Box<dyn Backend>,
}

impl Replicas {
    pub fn new(a: Box<dyn Backend>, b: Box<dyn Backend>) -> Self {
        Replicas { a, b }
    }

    /// Opens both roots of `config`. Remote roots ask `policy` about unknown host keys.
    pub fn connect(config: &SyncConfig, policy: &dyn HostKeyPolicy) -> Result<Self> {
        config.validate()?;
        let a = config.roots[0]
            .connect(&config.remote, policy)
            .map_err(|source| SyncError::backend(Side::A, source))?;
        let b = config.roots[1]
            .connect(&config.remote, policy)
            .map_err(|source| SyncError::backend(Side::B, source))?;
        Ok(Replicas::new(a, b))
    }

    pub fn get_mut(&mut self, side: Side) -> &mut dyn Backend {
        match side {
            Side::A => &mut *self.a,
            Side::B => &mut *self.b,
        }
    }

    /// Borrows `(source, destination)` for a copy starting at `from`.
    pub fn pair_mut(&mut self, from: Side) -> (&mut dyn Backend, &mut dyn Backend) {
        match from {
            Side::A => (&mut *self.a, &mut *self.b),
            Side::B => (&mut *self.b, &mut *self.a),
        }
    }
}

impl ContentHasher for Replicas {
    fn digest(&mut self, side: Side, path: &PathKey) -> std::result::Result<Digest, BackendError> {
        self.get_mut(side).digest(path)
    }
}

impl Root {
    /// Opens the backend for this root. Remote roots ask `policy` about unknown host keys.
    pub fn connect(
        &self,
        options: &RemoteOptions,
        policy: &dyn HostKeyPolicy,
    ) -> std::result::Result<Box<dyn Backend>, BackendError> {
        match *self {
            Root::Local(ref path) => Ok(Box::new(LocalBackend::new(path.clone())?)),
            Root::Remote(ref remote) => Ok(Box::new(RemoteBackend::connect(
                remote.clone(),
                options.clone(),
                policy,
            )?)),
        }
    }
}
