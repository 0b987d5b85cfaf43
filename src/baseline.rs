use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bincode::{deserialize_from, serialize_into};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use tempfile::NamedTempFile;

use crate::config::{SyncConfig, Tracking};
use crate::error::{Result, SyncError};
use crate::path::PathKey;
use crate::snapshot::Snapshot;
use crate::state::Entry;

const BASELINE_VERSION: u32 = 1;

/// The last state both replicas agreed on, persisted after every change.
///
/// The store holds an exclusive lock on `<path>.lock` for as long as it is open, so only
/// one process can synchronize a pair at a time.
#[derive(Debug)]
pub struct Baseline {
    path: PathBuf,
    snapshot: Snapshot,
    _lock: File,
}

impl Baseline {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(&path);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(SyncError::BaselineLocked(path));
        }

        let snapshot = if path.exists() {
            let mut file = BufReader::new(File::open(&path)?);
            read_snapshot(&mut file).map_err(|reason| SyncError::DataCorruption {
                path: path.clone(),
                reason,
            })?
        } else {
            debug!("No baseline at {:?}, starting empty", path);
            Snapshot::new()
        };
        info!("Opened baseline {:?} with {} entries", path, snapshot.len());

        Ok(Baseline {
            path,
            snapshot,
            _lock: lock,
        })
    }

    /// Opens the baseline belonging to `config`. If the roots or the ignore rules changed
    /// since the last run, entries the new rules no longer track are forgotten first.
    pub fn open_for(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let mut baseline = Baseline::open(config.baseline_path())?;

        let fingerprint_path = config.fingerprint_path();
        let current = format!("{:016x}", config.fingerprint());
        let stored = match fs::read_to_string(&fingerprint_path) {
            Ok(text) => Some(text.trim().to_owned()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if stored.as_deref() != Some(current.as_str()) {
            info!("Configuration {} changed, pruning baseline", config.name);
            baseline.forget_untracked(&config.ignore)?;
            fs::write(&fingerprint_path, &current)?;
        }
        Ok(baseline)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn get(&self, path: &PathKey) -> Entry {
        self.snapshot.get(path)
    }

    /// Records the agreed state of one path and writes the store through.
    pub fn record(&mut self, path: &PathKey, entry: Entry) -> Result<()> {
        if self.snapshot.get(path) == entry {
            return Ok(());
        }
        debug!("Baseline {}: {}", path, entry);
        self.snapshot.set(path.clone(), entry);
        self.persist()
    }

    /// Drops every entry `tracking` rejects.
    pub fn forget_untracked<T: Tracking + ?Sized>(&mut self, tracking: &T) -> Result<()> {
        let removed = self.snapshot.retain_tracked(tracking);
        if removed.is_empty() {
            return Ok(());
        }
        info!("Forgetting {} untracked baseline entries", removed.len());
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let mut out = BufWriter::new(temp.as_file_mut());
            write_snapshot(&mut out, &self.snapshot)?;
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| SyncError::Io(e.error))?;
        trace!("Wrote baseline {:?}", self.path);
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// reads a baseline from a binary stream
fn read_snapshot<R: Read>(read: &mut R) -> std::result::Result<Snapshot, String> {
    let version = read
        .read_u32::<LittleEndian>()
        .map_err(|e| format!("missing version header: {}", e))?;
    if version != BASELINE_VERSION {
        return Err(format!("unsupported version {}", version));
    }
    deserialize_from(read).map_err(|e| format!("undecodable entries: {}", e))
}

// writes a baseline to a binary stream
fn write_snapshot<W: Write>(out: &mut W, snapshot: &Snapshot) -> Result<()> {
    out.write_u32::<LittleEndian>(BASELINE_VERSION)?;
    serialize_into(out, snapshot).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(())
}
