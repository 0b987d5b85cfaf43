use std::fs::{self, DirBuilder, File, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::backend::{copy_with_progress, Backend, EntryKind, ListEntry, TransferProgress};
use crate::compare_files::{digest_file, Digest};
use crate::error::{BackendError, BackendErrorKind};
use crate::path::PathKey;
use crate::state::{truncate_mtime, Entry, MODE_MASK};

/// A replica on a locally mounted filesystem.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self, BackendError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(BackendError::new(
                BackendErrorKind::NotFound,
                format!("root does not exist: {:?}", root),
            ));
        }
        Ok(LocalBackend { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &PathKey) -> PathBuf {
        path.under(&self.root)
    }
}

fn kind_of(metadata: &Metadata) -> EntryKind {
    let ty = metadata.file_type();
    if ty.is_symlink() {
        EntryKind::Symlink
    } else if ty.is_dir() {
        EntryKind::Folder
    } else if ty.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

fn describe_io<'a>(op: &'a str, path: &'a Path) -> impl Fn(io::Error) -> BackendError + 'a {
    move |e| BackendError::from_io(e, format!("{} {:?}", op, path))
}

impl Backend for LocalBackend {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn list(&mut self, dir: &PathKey) -> Result<Vec<ListEntry>, BackendError> {
        let absolute = self.resolve(dir);
        let mut entries = Vec::new();
        for item in fs::read_dir(&absolute).map_err(describe_io("listing", &absolute))? {
            let item = item.map_err(describe_io("listing", &absolute))?;
            let name = match item.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    warn!("Skipping non UTF-8 name {:?} in {:?}", name, absolute);
                    continue;
                }
            };
            // DirEntry::metadata does not traverse symbolic links
            let metadata = item.metadata().map_err(describe_io("reading", &item.path()))?;
            entries.push(ListEntry {
                name,
                kind: kind_of(&metadata),
                mode: metadata.mode() & MODE_MASK,
                mtime: truncate_mtime(metadata.mtime()),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn metadata(&mut self, path: &PathKey) -> Result<Entry, BackendError> {
        let absolute = self.resolve(path);
        let metadata = match fs::symlink_metadata(&absolute) {
            Ok(metadata) => metadata,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(Entry::Absent),
            Err(e) => return Err(describe_io("reading", &absolute)(e)),
        };
        match kind_of(&metadata) {
            EntryKind::File => Ok(Entry::file(
                metadata.mode(),
                truncate_mtime(metadata.mtime()),
                metadata.len(),
            )),
            EntryKind::Folder => Ok(Entry::folder(metadata.mode())),
            EntryKind::Symlink | EntryKind::Other => Err(BackendError::new(
                BackendErrorKind::Protocol,
                format!("{:?} is neither a file nor a folder", absolute),
            )),
        }
    }

    fn read_into(
        &mut self,
        path: &PathKey,
        local: &Path,
        progress: &mut TransferProgress,
    ) -> Result<(), BackendError> {
        let absolute = self.resolve(path);
        let mut source = File::open(&absolute).map_err(describe_io("opening", &absolute))?;
        let total = source
            .metadata()
            .map_err(describe_io("reading", &absolute))?
            .len();
        let mut dest = File::create(local).map_err(describe_io("creating", local))?;
        copy_with_progress(&mut source, &mut dest, total, progress, &absolute.to_string_lossy())
    }

    fn write_from(
        &mut self,
        local: &Path,
        path: &PathKey,
        progress: &mut TransferProgress,
    ) -> Result<(), BackendError> {
        let absolute = self.resolve(path);
        let mut source = File::open(local).map_err(describe_io("opening", local))?;
        let total = source.metadata().map_err(describe_io("reading", local))?.len();
        let mut dest = File::create(&absolute).map_err(describe_io("creating", &absolute))?;
        copy_with_progress(&mut source, &mut dest, total, progress, &absolute.to_string_lossy())?;
        dest.sync_all().map_err(describe_io("syncing", &absolute))
    }

    fn chmod(&mut self, path: &PathKey, mode: u32) -> Result<(), BackendError> {
        let absolute = self.resolve(path);
        fs::set_permissions(&absolute, Permissions::from_mode(mode & MODE_MASK))
            .map_err(describe_io("changing mode of", &absolute))
    }

    fn set_times(&mut self, path: &PathKey, mtime: u64) -> Result<(), BackendError> {
        let absolute = self.resolve(path);
        // by path: the mode applied just before may deny opening the file at all
        let time = FileTime::from_unix_time(mtime as i64, 0);
        filetime::set_file_times(&absolute, time, time)
            .map_err(describe_io("setting times of", &absolute))
    }

    fn mkdir(&mut self, path: &PathKey, mode: u32) -> Result<(), BackendError> {
        let absolute = self.resolve(path);
        DirBuilder::new()
            .mode(mode & MODE_MASK)
            .create(&absolute)
            .map_err(describe_io("creating directory", &absolute))
    }

    fn rmdir(&mut self, path: &PathKey) -> Result<(), BackendError> {
        let absolute = self.resolve(path);
        fs::remove_dir(&absolute).map_err(describe_io("removing directory", &absolute))
    }

    fn remove(&mut self, path: &PathKey) -> Result<(), BackendError> {
        let absolute = self.resolve(path);
        fs::remove_file(&absolute).map_err(describe_io("removing", &absolute))
    }

    fn rename(&mut self, from: &PathKey, to: &PathKey) -> Result<(), BackendError> {
        let source = self.resolve(from);
        let dest = self.resolve(to);
        fs::rename(&source, &dest).map_err(describe_io("renaming", &source))
    }

    fn digest(&mut self, path: &PathKey) -> Result<Digest, BackendError> {
        let absolute = self.resolve(path);
        digest_file(&absolute).map_err(describe_io("hashing", &absolute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Flow;

    const COPY_CHUNK: usize = 64 * 1024;

    fn key(text: &str) -> PathKey {
        PathKey::parse(text).unwrap()
    }

    #[test]
    fn missing_root_is_not_found() {
        let err = LocalBackend::new("/definitely/not/here").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::NotFound);
    }

    #[test]
    fn list_reports_links_without_following_them() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("file.txt"), b"hello").unwrap();
        std::os::unix::fs::symlink("file.txt", dir.path().join("link")).unwrap();

        let mut backend = LocalBackend::new(dir.path()).unwrap();
        let listing = backend.list(&PathKey::root()).unwrap();
        let names: Vec<(&str, EntryKind)> =
            listing.iter().map(|e| (e.name.as_str(), e.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("file.txt", EntryKind::File),
                ("link", EntryKind::Symlink),
                ("sub", EntryKind::Folder)
            ]
        );
        assert_eq!(listing[0].size, 5);
    }

    #[test]
    fn metadata_of_missing_path_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = LocalBackend::new(dir.path()).unwrap();
        assert_eq!(backend.metadata(&key("/nope")).unwrap(), Entry::Absent);
    }

    #[test]
    fn set_times_and_chmod_round_trip_through_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"abc").unwrap();
        let mut backend = LocalBackend::new(dir.path()).unwrap();

        backend.chmod(&key("/f"), 0o600).unwrap();
        backend.set_times(&key("/f"), 1_500_000_000).unwrap();
        assert_eq!(
            backend.metadata(&key("/f")).unwrap(),
            Entry::file(0o600, 1_500_000_000, 3)
        );
    }

    #[test]
    fn times_can_be_set_on_a_file_its_owner_cannot_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("w"), b"abc").unwrap();
        let mut backend = LocalBackend::new(dir.path()).unwrap();

        backend.chmod(&key("/w"), 0o200).unwrap();
        backend.set_times(&key("/w"), 1_500_000_000).unwrap();
        assert_eq!(
            backend.metadata(&key("/w")).unwrap(),
            Entry::file(0o200, 1_500_000_000, 3)
        );
    }

    #[test]
    fn digest_hashes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"same bytes").unwrap();
        let mut backend = LocalBackend::new(dir.path()).unwrap();
        assert_eq!(
            backend.digest(&key("/f")).unwrap(),
            crate::compare_files::digest_bytes(b"same bytes")
        );
        assert_eq!(
            backend.digest(&key("/missing")).unwrap_err().kind,
            BackendErrorKind::NotFound
        );
    }

    #[test]
    fn cancelled_read_stops_the_transfer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big"), vec![7u8; 3 * COPY_CHUNK]).unwrap();
        let mut backend = LocalBackend::new(dir.path()).unwrap();
        let out = dir.path().join("copy");

        let mut calls = 0;
        let err = backend
            .read_into(&key("/big"), &out, &mut |_, _| {
                calls += 1;
                Flow::Cancel
            })
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Cancelled);
        assert_eq!(calls, 1);
    }
}
