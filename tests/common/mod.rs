#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tempfile::TempDir;
use walkdir::WalkDir;

use twosync::backend::{Backend, ListEntry, LocalBackend, TransferProgress};
use twosync::propagate::{temp_key_for, EmptyProgressCallback};
use twosync::{
    plan, reconcile_replicas, BackendError, BackendErrorKind, Baseline, Digest, Entry,
    ExecutionReport, Executor, ExecutorOptions, PathKey, Reconciliation, Replicas, Root, Side,
    SyncConfig,
};

pub const MTIME: u64 = 1_600_000_000;

pub fn key(text: &str) -> PathKey {
    PathKey::parse(text).unwrap()
}

/// Two empty replicas and a state directory, all inside one temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config: SyncConfig,
}

impl Fixture {
    pub fn new() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        for name in &["root_a", "root_b", "state"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        let mut config = SyncConfig::new(
            "test",
            [
                Root::Local(dir.path().join("root_a")),
                Root::Local(dir.path().join("root_b")),
            ],
        );
        config.state_dir = dir.path().join("state");
        Fixture { dir, config }
    }

    pub fn root(&self, side: Side) -> PathBuf {
        match side {
            Side::A => self.dir.path().join("root_a"),
            Side::B => self.dir.path().join("root_b"),
        }
    }

    pub fn path(&self, side: Side, relative: &str) -> PathBuf {
        self.root(side).join(relative.trim_start_matches('/'))
    }

    pub fn local(&self, side: Side) -> LocalBackend {
        LocalBackend::new(self.root(side)).unwrap()
    }

    pub fn replicas(&self) -> Replicas {
        Replicas::new(Box::new(self.local(Side::A)), Box::new(self.local(Side::B)))
    }

    /// Replica B wrapped in fault injection.
    pub fn replicas_with_faulty_b(&self, faults: Faults) -> Replicas {
        Replicas::new(
            Box::new(self.local(Side::A)),
            Box::new(FaultyBackend::new(self.local(Side::B), faults)),
        )
    }

    pub fn baseline(&self) -> Baseline {
        Baseline::open_for(&self.config).unwrap()
    }

    /// Writes a file whose mtime is `MTIME`, creating parent folders as needed.
    pub fn write(&self, side: Side, relative: &str, content: &str) {
        self.write_at(side, relative, content, MTIME);
    }

    pub fn write_at(&self, side: Side, relative: &str, content: &str, mtime: u64) {
        let path = self.path(side, relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        set_mtime(&path, mtime);
    }

    pub fn mkdir(&self, side: Side, relative: &str) {
        fs::create_dir_all(self.path(side, relative)).unwrap();
    }

    pub fn read(&self, side: Side, relative: &str) -> String {
        fs::read_to_string(self.path(side, relative)).unwrap()
    }

    pub fn mode(&self, side: Side, relative: &str) -> u32 {
        fs::metadata(self.path(side, relative)).unwrap().permissions().mode() & 0o777
    }

    pub fn mtime(&self, side: Side, relative: &str) -> u64 {
        fs::metadata(self.path(side, relative))
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    /// Every path below a root, folders with a trailing `/`, sorted.
    pub fn tree(&self, side: Side) -> Vec<String> {
        let root = self.root(side);
        WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| {
                let entry = entry.unwrap();
                let relative = entry.path().strip_prefix(&root).unwrap().to_string_lossy().into_owned();
                if entry.file_type().is_dir() {
                    format!("/{}/", relative)
                } else {
                    format!("/{}", relative)
                }
            })
            .collect()
    }
}

pub fn set_mtime(path: &Path, mtime: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime)).unwrap();
}

/// Reconciles, plans the suggested directions and executes them.
pub fn sync(
    fixture: &Fixture,
    replicas: &mut Replicas,
    baseline: &mut Baseline,
) -> (Reconciliation, ExecutionReport) {
    let reconciliation = reconcile_replicas(baseline, replicas, &fixture.config.ignore).unwrap();
    let actions = plan(&reconciliation, &reconciliation.suggested_directions()).unwrap();
    let report = Executor::new(replicas, baseline, ExecutorOptions::from(&fixture.config))
        .execute(&actions, &EmptyProgressCallback)
        .unwrap();
    (reconciliation, report)
}

/// Failures to inject into a `FaultyBackend`, by the key of the file being synced.
#[derive(Default)]
pub struct Faults {
    /// Uploads stop halfway through with a protocol error.
    pub truncate_upload: Vec<PathKey>,
    pub fail_rename_to: Vec<PathKey>,
    pub fail_remove: Vec<PathKey>,
    /// Every operation on these paths reports a lost connection.
    pub unreachable_on: Vec<PathKey>,
}

pub struct FaultyBackend {
    inner: LocalBackend,
    faults: Faults,
}

impl FaultyBackend {
    pub fn new(inner: LocalBackend, faults: Faults) -> Self {
        FaultyBackend { inner, faults }
    }

    fn reachable(&self, path: &PathKey) -> Result<(), BackendError> {
        let hit = self
            .faults
            .unreachable_on
            .iter()
            .any(|p| p == path || temp_key_for(p) == *path);
        if hit {
            Err(BackendError::new(BackendErrorKind::Unreachable, format!("lost connection at {}", path)))
        } else {
            Ok(())
        }
    }
}

impl Backend for FaultyBackend {
    fn describe(&self) -> String {
        format!("faulty {}", self.inner.describe())
    }

    fn list(&mut self, dir: &PathKey) -> Result<Vec<ListEntry>, BackendError> {
        self.inner.list(dir)
    }

    fn metadata(&mut self, path: &PathKey) -> Result<Entry, BackendError> {
        self.reachable(path)?;
        self.inner.metadata(path)
    }

    fn read_into(&mut self, path: &PathKey, local: &Path, progress: &mut TransferProgress) -> Result<(), BackendError> {
        self.reachable(path)?;
        self.inner.read_into(path, local, progress)
    }

    fn write_from(&mut self, local: &Path, path: &PathKey, progress: &mut TransferProgress) -> Result<(), BackendError> {
        self.reachable(path)?;
        if self.faults.truncate_upload.iter().any(|p| temp_key_for(p) == *path) {
            let content = fs::read(local).unwrap();
            fs::write(path.under(self.inner.root()), &content[..content.len() / 2]).unwrap();
            return Err(BackendError::new(BackendErrorKind::Protocol, "connection reset mid-transfer"));
        }
        self.inner.write_from(local, path, progress)
    }

    fn chmod(&mut self, path: &PathKey, mode: u32) -> Result<(), BackendError> {
        self.reachable(path)?;
        self.inner.chmod(path, mode)
    }

    fn set_times(&mut self, path: &PathKey, mtime: u64) -> Result<(), BackendError> {
        self.reachable(path)?;
        self.inner.set_times(path, mtime)
    }

    fn mkdir(&mut self, path: &PathKey, mode: u32) -> Result<(), BackendError> {
        self.reachable(path)?;
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&mut self, path: &PathKey) -> Result<(), BackendError> {
        self.reachable(path)?;
        self.inner.rmdir(path)
    }

    fn remove(&mut self, path: &PathKey) -> Result<(), BackendError> {
        self.reachable(path)?;
        if self.faults.fail_remove.contains(path) {
            return Err(BackendError::new(BackendErrorKind::PermissionDenied, format!("cannot remove {}", path)));
        }
        self.inner.remove(path)
    }

    fn rename(&mut self, from: &PathKey, to: &PathKey) -> Result<(), BackendError> {
        self.reachable(to)?;
        if self.faults.fail_rename_to.contains(to) {
            return Err(BackendError::new(BackendErrorKind::PermissionDenied, format!("cannot rename onto {}", to)));
        }
        self.inner.rename(from, to)
    }

    fn digest(&mut self, path: &PathKey) -> Result<Digest, BackendError> {
        self.reachable(path)?;
        self.inner.digest(path)
    }
}
