use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

use crate::error::{Result, SyncError};
use crate::path::PathKey;
use crate::util::hash_single;

const SSH_SCHEME: &str = "ssh://";

/// Decides which paths take part in synchronization.
///
/// Implementations must be pure: the walker asks once per path and prunes any folder
/// that is rejected without looking inside it.
pub trait Tracking {
    fn should_track_file(&self, path: &PathKey) -> bool;
    fn should_track_dir(&self, path: &PathKey) -> bool;
}

/// Tracks every path.
pub struct TrackAll;

impl Tracking for TrackAll {
    fn should_track_file(&self, _: &PathKey) -> bool {
        true
    }

    fn should_track_dir(&self, _: &PathKey) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
/// Determines which files should be ignored when building snapshots.
///
/// `paths` are root-relative prefixes matched by whole component, `regexes` are matched
/// against the full key (so `/target/` only matches folders), and `unless` re-includes
/// anything that would otherwise be ignored.
pub struct Ignore {
    pub regexes: Vec<Regex>,
    pub paths: Vec<String>,
    pub unless: Vec<Regex>,
}

impl Ignore {
    /// An `Ignore` struct that ignores nothing
    pub fn nothing() -> Self {
        Ignore {
            regexes: Vec::new(),
            paths: Vec::new(),
            unless: Vec::new(),
        }
    }

    pub fn new(regexes: &[&str], paths: &[&str], unless: &[&str]) -> Result<Self> {
        Ok(Ignore {
            regexes: compile(regexes)?,
            paths: paths.iter().map(|p| p.trim_matches('/').to_owned()).collect(),
            unless: compile(unless)?,
        })
    }

    pub fn is_ignored(&self, path: &PathKey) -> bool {
        let ignored = self.paths.iter().any(|prefix| path.is_within(prefix))
            || self.regexes.iter().any(|regex| regex.is_match(path.as_str()));
        if ignored && self.unless.iter().any(|regex| regex.is_match(path.as_str())) {
            trace!("{} is ignored but explicitly re-included", path);
            return false;
        }
        ignored
    }

    fn describe(&self) -> String {
        let regexes: Vec<&str> = self.regexes.iter().map(|r| r.as_str()).collect();
        let unless: Vec<&str> = self.unless.iter().map(|r| r.as_str()).collect();
        format!("{:?}|{:?}|{:?}", regexes, self.paths, unless)
    }
}

impl Default for Ignore {
    fn default() -> Self {
        Ignore::nothing()
    }
}

impl Tracking for Ignore {
    fn should_track_file(&self, path: &PathKey) -> bool {
        !self.is_ignored(path)
    }

    fn should_track_dir(&self, path: &PathKey) -> bool {
        !self.is_ignored(path)
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| {
                SyncError::Configuration(format!("invalid ignore pattern {:?}: {}", pattern, e))
            })
        })
        .collect()
}

/// Where a replica lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    Local(PathBuf),
    Remote(RemoteRoot),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRoot {
    /// A host name or an alias from ssh_config.
    pub host: String,
    /// Left out of the address, it comes from ssh_config or defaults to 22.
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Path on the remote host. Relative paths start at the login directory.
    pub path: String,
}

impl FromStr for Root {
    type Err = SyncError;

    /// Accepts a plain local path or `ssh://[user@]host[:port][/path]`.
    ///
    /// The remote path keeps its leading slash, so `ssh://host/srv/data` is `/srv/data` and
    /// not `srv/data` below the login directory, as scp-style addresses would read it. An
    /// address without a path is the login directory (`.`), not `/`.
    fn from_str(text: &str) -> Result<Self> {
        let rest = match text.strip_prefix(SSH_SCHEME) {
            Some(rest) => rest,
            None if text.is_empty() => {
                return Err(SyncError::Configuration("empty root".to_owned()))
            }
            None => return Ok(Root::Local(PathBuf::from(text))),
        };

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], rest[index..].to_owned()),
            None => (rest, ".".to_owned()),
        };
        let (user, host_port) = match authority.rfind('@') {
            Some(index) => (Some(authority[..index].to_owned()), &authority[index + 1..]),
            None => (None, authority),
        };
        let (host, port) = match host_port.rfind(':') {
            Some(index) => {
                let port = host_port[index + 1..].parse::<u16>().map_err(|e| {
                    SyncError::Configuration(format!("invalid port in {:?}: {}", text, e))
                })?;
                (&host_port[..index], Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(SyncError::Configuration(format!("missing host in {:?}", text)));
        }
        if user.as_deref() == Some("") {
            return Err(SyncError::Configuration(format!("empty user name in {:?}", text)));
        }

        Ok(Root::Remote(RemoteRoot {
            host: host.to_owned(),
            port,
            user,
            path,
        }))
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Root::Local(ref path) => write!(f, "{}", path.display()),
            Root::Remote(ref remote) => write!(f, "{}", remote),
        }
    }
}

impl fmt::Display for RemoteRoot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(SSH_SCHEME)?;
        if let Some(ref user) = self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if self.path.starts_with('/') {
            f.write_str(&self.path)
        } else {
            write!(f, "/{}", self.path)
        }
    }
}

/// Connection settings shared by every remote replica.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Upper bound for connecting and for every single SSH/SFTP call.
    pub timeout: Duration,
    pub identity_file: Option<PathBuf>,
    /// OpenSSH `known_hosts` file. Defaults to `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
    /// Read instead of `~/.ssh/config` and `/etc/ssh/ssh_config`.
    pub ssh_config: Option<PathBuf>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            timeout: Duration::from_secs(30),
            identity_file: None,
            known_hosts: None,
            ssh_config: None,
        }
    }
}

/// The configuration for the sync business.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this pairing; names the state files.
    pub name: String,
    pub roots: [Root; 2],
    pub ignore: Ignore,
    /// Directory holding the baseline and configuration fingerprint.
    pub state_dir: PathBuf,
    /// Hash files whose only difference is their mtime before transferring them.
    pub compare_file_contents: bool,
    pub remote: RemoteOptions,
}

impl SyncConfig {
    pub fn new<S: Into<String>>(name: S, roots: [Root; 2]) -> Self {
        SyncConfig {
            name: name.into(),
            roots,
            ignore: Ignore::nothing(),
            state_dir: PathBuf::from("."),
            compare_file_contents: false,
            remote: RemoteOptions::default(),
        }
    }

    /// Checks the configuration without touching any filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(SyncError::Configuration(format!(
                "invalid configuration name {:?}",
                self.name
            )));
        }
        if self.roots[0] == self.roots[1] {
            return Err(SyncError::Configuration(format!(
                "both roots point at {}",
                self.roots[0]
            )));
        }
        if let (Root::Local(a), Root::Local(b)) = (&self.roots[0], &self.roots[1]) {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(SyncError::Configuration(format!(
                    "roots {} and {} are nested",
                    a.display(),
                    b.display()
                )));
            }
        }
        for root in &self.roots {
            if let Root::Local(path) = root {
                if self.state_dir.starts_with(path) {
                    return Err(SyncError::Configuration(format!(
                        "state directory {} lies inside root {}",
                        self.state_dir.display(),
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn baseline_path(&self) -> PathBuf {
        self.state_path("data")
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.state_path("hash")
    }

    /// Changes whenever the roots or the ignore rules change.
    pub fn fingerprint(&self) -> u64 {
        let roots: Vec<String> = self.roots.iter().map(|root| root.to_string()).collect();
        hash_single(&(roots, self.ignore.describe()))
    }

    fn state_path(&self, kind: &str) -> PathBuf {
        Path::new(&self.state_dir).join(format!(".{}_{}", kind, self.name))
    }
}
