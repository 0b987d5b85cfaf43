use std::env;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

use ssh2::{
    CheckResult, ErrorCode, FileStat, HashType, HostKeyType, KnownHostFileKind, KnownHosts,
    RenameFlags, Session, Sftp,
};
use ssh2_config::{ParseRule, SshConfig};

use crate::backend::{
    copy_with_progress, download_digest, Backend, EntryKind, ListEntry, TransferProgress,
};
use crate::compare_files::Digest;
use crate::config::{RemoteOptions, RemoteRoot};
use crate::error::{BackendError, BackendErrorKind};
use crate::path::PathKey;
use crate::state::{Entry, MODE_MASK};

// libssh2 session error codes
const LIBSSH2_ERROR_SOCKET_NONE: i32 = -1;
const LIBSSH2_ERROR_BANNER_RECV: i32 = -2;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;
const LIBSSH2_FX_NO_CONNECTION: i32 = 6;
const LIBSSH2_FX_CONNECTION_LOST: i32 = 7;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;
const LIBSSH2_FX_WRITE_PROTECT: i32 = 12;

const KNOWN_HOSTS_COMMENT: &str = "added by twosync";
const DEFAULT_SSH_PORT: u16 = 22;
const SYSTEM_SSH_CONFIG: &str = "/etc/ssh/ssh_config";

/// What to do with a host key that is not in `known_hosts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// Trust the key for the lifetime of this connection only.
    Accept,
    /// Trust the key and append it to `known_hosts`.
    AcceptAndRemember,
    Reject,
}

/// Asked once, on first contact with a host whose key is not known yet. A key that
/// contradicts `known_hosts` is rejected without asking.
pub trait HostKeyPolicy {
    fn decide(&self, host: &str, fingerprint: &str) -> HostKeyDecision;
}

pub struct RejectUnknownHosts;

impl HostKeyPolicy for RejectUnknownHosts {
    fn decide(&self, host: &str, fingerprint: &str) -> HostKeyDecision {
        warn!("Rejecting unknown host key {} for {}", fingerprint, host);
        HostKeyDecision::Reject
    }
}

pub struct AcceptUnknownHosts {
    pub remember: bool,
}

impl HostKeyPolicy for AcceptUnknownHosts {
    fn decide(&self, host: &str, fingerprint: &str) -> HostKeyDecision {
        info!("Accepting unknown host key {} for {}", fingerprint, host);
        if self.remember {
            HostKeyDecision::AcceptAndRemember
        } else {
            HostKeyDecision::Accept
        }
    }
}

/// Where to connect once ssh_config has been applied to a `RemoteRoot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_files: Vec<PathBuf>,
}

impl Destination {
    /// Looks `root.host` up in the given ssh_config files. Values in the address win over
    /// the files, and an earlier file wins over a later one, as with ssh(1).
    pub fn resolve(root: &RemoteRoot, config_files: &[PathBuf]) -> Destination {
        let mut host_name = None;
        let mut port = root.port;
        let mut user = root.user.clone();
        let mut identity_files = Vec::new();
        for path in config_files {
            let config = match read_ssh_config(path) {
                Some(config) => config,
                None => continue,
            };
            let params = config.query(root.host.as_str());
            host_name = host_name.or(params.host_name);
            port = port.or(params.port);
            user = user.or(params.user);
            if identity_files.is_empty() {
                identity_files = params.identity_file.unwrap_or_default();
            }
        }
        let destination = Destination {
            host: host_name.unwrap_or_else(|| root.host.clone()),
            port: port.unwrap_or(DEFAULT_SSH_PORT),
            user,
            identity_files: identity_files.iter().map(|path| expand_home(path)).collect(),
        };
        if destination.host != root.host {
            debug!("{} is an alias for {}", root.host, destination.host);
        }
        destination
    }
}

fn ssh_config_files(options: &RemoteOptions) -> Vec<PathBuf> {
    if let Some(ref path) = options.ssh_config {
        return vec![path.clone()];
    }
    let mut files = Vec::new();
    if let Some(home) = env::var_os("HOME") {
        files.push(Path::new(&home).join(".ssh").join("config"));
    }
    files.push(PathBuf::from(SYSTEM_SSH_CONFIG));
    files
}

/// A missing or unreadable file counts as empty.
fn read_ssh_config(path: &Path) -> Option<SshConfig> {
    let file = File::open(path).ok()?;
    match SshConfig::default().parse(&mut BufReader::new(file), ParseRule::ALLOW_UNKNOWN_FIELDS) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Ignoring {:?}: {}", path, e);
            None
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), env::var_os("HOME")) {
        (Ok(rest), Some(home)) => Path::new(&home).join(rest),
        _ => path.to_owned(),
    }
}

/// Checks `key` against the known_hosts file at `path` (missing counts as empty).
///
/// An unknown key is put to `policy`. Without a policy, as on reconnect, it is refused.
fn check_host_key(
    known: &mut KnownHosts,
    path: Option<&Path>,
    destination: &Destination,
    key: &[u8],
    key_type: HostKeyType,
    fingerprint: &str,
    policy: Option<&dyn HostKeyPolicy>,
) -> Result<(), BackendError> {
    let (host, port) = (destination.host.as_str(), destination.port);
    if let Some(path) = path {
        if path.exists() {
            known
                .read_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|e| ssh_error(e, format!("reading {:?}", path)))?;
        }
    }

    match known.check_port(host, port, key) {
        CheckResult::Match => {
            debug!("Host key for {} matches known_hosts", host);
            Ok(())
        }
        CheckResult::Mismatch => Err(BackendError::new(
            BackendErrorKind::UnknownHostKey,
            format!("host key {} for {} does not match known_hosts", fingerprint, host),
        )),
        CheckResult::NotFound => {
            let policy = policy.ok_or_else(|| {
                BackendError::new(
                    BackendErrorKind::UnknownHostKey,
                    format!("{} presented a different unknown key {} on reconnect", host, fingerprint),
                )
            })?;
            match policy.decide(host, fingerprint) {
                HostKeyDecision::Reject => Err(BackendError::new(
                    BackendErrorKind::UnknownHostKey,
                    format!("host key {} for {} was rejected", fingerprint, host),
                )),
                HostKeyDecision::Accept => Ok(()),
                HostKeyDecision::AcceptAndRemember => {
                    let path = path.ok_or_else(|| {
                        BackendError::new(
                            BackendErrorKind::Protocol,
                            "no known_hosts file to remember the host key in",
                        )
                    })?;
                    let entry = if port == DEFAULT_SSH_PORT {
                        host.to_owned()
                    } else {
                        format!("[{}]:{}", host, port)
                    };
                    known
                        .add(&entry, key, KNOWN_HOSTS_COMMENT, key_type.into())
                        .map_err(|e| ssh_error(e, "adding host key"))?;
                    known
                        .write_file(path, KnownHostFileKind::OpenSSH)
                        .map_err(|e| ssh_error(e, format!("writing {:?}", path)))?;
                    info!("Remembered host key for {} in {:?}", host, path);
                    Ok(())
                }
            }
        }
        CheckResult::Failure => Err(BackendError::new(
            BackendErrorKind::Protocol,
            format!("could not check host key for {}", host),
        )),
    }
}

/// A replica reached over SSH/SFTP.
///
/// Every operation first checks that the SFTP session still answers and reconnects if it
/// does not, so a connection dropped while idle is invisible to callers.
pub struct RemoteBackend {
    root: RemoteRoot,
    destination: Destination,
    options: RemoteOptions,
    user: String,
    session: Option<Session>,
    sftp: Option<Sftp>,
    /// The host key accepted on first contact; reconnects must present the same key.
    trusted_key: Option<Vec<u8>>,
}

impl fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("root", &self.root)
            .field("destination", &self.destination)
            .field("user", &self.user)
            .field("connected", &self.sftp.is_some())
            .finish()
    }
}

impl RemoteBackend {
    pub fn connect(
        root: RemoteRoot,
        options: RemoteOptions,
        policy: &dyn HostKeyPolicy,
    ) -> Result<Self, BackendError> {
        let destination = Destination::resolve(&root, &ssh_config_files(&options));
        let user = destination
            .user
            .clone()
            .or_else(|| env::var("USER").ok())
            .ok_or_else(|| {
                BackendError::new(
                    BackendErrorKind::AuthenticationFailed,
                    format!("no user given for {} and $USER is unset", root.host),
                )
            })?;
        let mut backend = RemoteBackend {
            root,
            destination,
            options,
            user,
            session: None,
            sftp: None,
            trusted_key: None,
        };
        backend.open_session(Some(policy))?;
        Ok(backend)
    }

    fn open_session(&mut self, policy: Option<&dyn HostKeyPolicy>) -> Result<(), BackendError> {
        let host = self.destination.host.clone();
        let port = self.destination.port;
        info!("Connecting to {}:{} as {}", host, port, self.user);

        let address = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| BackendError::new(BackendErrorKind::Unreachable, format!("resolving {}: {}", host, e)))?
            .next()
            .ok_or_else(|| {
                BackendError::new(BackendErrorKind::Unreachable, format!("{} has no address", host))
            })?;
        let tcp = TcpStream::connect_timeout(&address, self.options.timeout)
            .map_err(|e| BackendError::from_io(e, format!("connecting to {}", address)))?;

        let mut session = Session::new().map_err(|e| ssh_error(e, "creating session"))?;
        session.set_timeout(self.options.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| ssh_error(e, format!("handshake with {}", host)))?;
        self.verify_host_key(&session, policy)?;
        self.authenticate(&session)?;
        let sftp = session
            .sftp()
            .map_err(|e| ssh_error(e, format!("starting sftp on {}", host)))?;

        self.session = Some(session);
        self.sftp = Some(sftp);
        Ok(())
    }

    fn known_hosts_path(&self) -> Option<PathBuf> {
        self.options.known_hosts.clone().or_else(|| {
            env::var_os("HOME").map(|home| Path::new(&home).join(".ssh").join("known_hosts"))
        })
    }

    fn verify_host_key(
        &mut self,
        session: &Session,
        policy: Option<&dyn HostKeyPolicy>,
    ) -> Result<(), BackendError> {
        let (key, key_type) = session
            .host_key()
            .map(|(key, key_type)| (key.to_vec(), key_type))
            .ok_or_else(|| BackendError::new(BackendErrorKind::Protocol, "server sent no host key"))?;
        if self.trusted_key.as_deref() == Some(key.as_slice()) {
            return Ok(());
        }

        let mut known = session
            .known_hosts()
            .map_err(|e| ssh_error(e, "loading known hosts"))?;
        check_host_key(
            &mut known,
            self.known_hosts_path().as_deref(),
            &self.destination,
            &key,
            key_type,
            &fingerprint(session),
            policy,
        )?;
        self.trusted_key = Some(key);
        Ok(())
    }

    fn authenticate(&self, session: &Session) -> Result<(), BackendError> {
        if let Err(e) = session.userauth_agent(&self.user) {
            debug!("Agent authentication for {} failed: {}", self.user, e);
        }
        if !session.authenticated() {
            for identity in self.identities() {
                if !identity.exists() {
                    continue;
                }
                match session.userauth_pubkey_file(&self.user, None, &identity, None) {
                    Ok(()) => break,
                    Err(e) => debug!("Key {:?} was not accepted: {}", identity, e),
                }
            }
        }
        if session.authenticated() {
            Ok(())
        } else {
            Err(BackendError::new(
                BackendErrorKind::AuthenticationFailed,
                format!("{}@{} accepted none of the offered keys", self.user, self.root.host),
            ))
        }
    }

    fn identities(&self) -> Vec<PathBuf> {
        if let Some(ref identity) = self.options.identity_file {
            return vec![identity.clone()];
        }
        if !self.destination.identity_files.is_empty() {
            return self.destination.identity_files.clone();
        }
        match env::var_os("HOME") {
            Some(home) => ["id_ed25519", "id_ecdsa", "id_rsa"]
                .iter()
                .map(|name| Path::new(&home).join(".ssh").join(name))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drops the connection. The next operation reconnects without consulting the host
    /// key policy again.
    pub fn disconnect(&mut self) {
        self.sftp = None;
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!("Disconnecting from {}: {}", self.root, e);
            }
        }
    }

    /// The live SFTP channel, reconnecting first if the old one stopped answering.
    fn sftp(&mut self) -> Result<&Sftp, BackendError> {
        let alive = match self.sftp {
            Some(ref sftp) => sftp.realpath(Path::new(".")).is_ok(),
            None => false,
        };
        if !alive {
            info!("Session to {} is gone, reconnecting", self.root);
            self.sftp = None;
            self.session = None;
            self.open_session(None).map_err(|e| {
                BackendError::new(
                    BackendErrorKind::Unreachable,
                    format!("reconnecting to {}: {}", self.root.host, e),
                )
            })?;
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| BackendError::new(BackendErrorKind::Unreachable, "no sftp session"))
    }

    fn absolute(&self, path: &PathKey) -> PathBuf {
        path.under(Path::new(&self.root.path))
    }

    fn remote_digest(&mut self, path: &PathKey) -> Result<Option<Digest>, BackendError> {
        let absolute = self.absolute(path);
        self.sftp()?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| BackendError::new(BackendErrorKind::Unreachable, "no ssh session"))?;
        let command = format!("sha256sum -- {}", shell_quote(&absolute.to_string_lossy()));
        let mut channel = session
            .channel_session()
            .map_err(|e| ssh_error(e, "opening channel"))?;
        channel
            .exec(&command)
            .map_err(|e| ssh_error(e, format!("running {:?}", command)))?;
        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| BackendError::from_io(e, format!("reading output of {:?}", command)))?;
        channel.wait_close().map_err(|e| ssh_error(e, "closing channel"))?;
        let status = channel
            .exit_status()
            .map_err(|e| ssh_error(e, "reading exit status"))?;
        if status != 0 {
            debug!("{:?} exited with {} on {}", command, status, self.root.host);
            return Ok(None);
        }
        Ok(output
            .split_whitespace()
            .next()
            .and_then(|digest| digest.parse().ok()))
    }
}

fn fingerprint(session: &Session) -> String {
    match session.host_key_hash(HashType::Sha256) {
        Some(hash) => {
            let hex: Vec<String> = hash.iter().map(|byte| format!("{:02x}", byte)).collect();
            format!("SHA256:{}", hex.concat())
        }
        None => "unknown".to_owned(),
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn ssh_error<C: fmt::Display>(err: ssh2::Error, context: C) -> BackendError {
    let kind = match err.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) | ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_PATH) => {
            BackendErrorKind::NotFound
        }
        ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) | ErrorCode::SFTP(LIBSSH2_FX_WRITE_PROTECT) => {
            BackendErrorKind::PermissionDenied
        }
        ErrorCode::SFTP(LIBSSH2_FX_NO_CONNECTION) | ErrorCode::SFTP(LIBSSH2_FX_CONNECTION_LOST) => {
            BackendErrorKind::Unreachable
        }
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_TIMEOUT) => {
            BackendErrorKind::Timeout
        }
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => {
            BackendErrorKind::AuthenticationFailed
        }
        ErrorCode::Session(LIBSSH2_ERROR_SOCKET_NONE)
        | ErrorCode::Session(LIBSSH2_ERROR_BANNER_RECV)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_SEND)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV) => BackendErrorKind::Unreachable,
        _ => BackendErrorKind::Protocol,
    };
    BackendError::new(kind, format!("{}: {}", context, err.message()))
}

fn list_entry(name: String, stat: &FileStat) -> ListEntry {
    let file_type = stat.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Folder
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    ListEntry {
        name,
        kind,
        mode: stat.perm.unwrap_or(0) & MODE_MASK,
        mtime: stat.mtime.unwrap_or(0),
        size: stat.size.unwrap_or(0),
    }
}

fn setstat(perm: Option<u32>, mtime: Option<u64>) -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm,
        atime: mtime,
        mtime,
    }
}

impl Backend for RemoteBackend {
    fn describe(&self) -> String {
        self.root.to_string()
    }

    fn list(&mut self, dir: &PathKey) -> Result<Vec<ListEntry>, BackendError> {
        let absolute = self.absolute(dir);
        let listing = self
            .sftp()?
            .readdir(&absolute)
            .map_err(|e| ssh_error(e, format!("listing {:?}", absolute)))?;
        let mut entries = Vec::with_capacity(listing.len());
        for (path, stat) in listing {
            match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => entries.push(list_entry(name.to_owned(), &stat)),
                None => warn!("Skipping unreadable name {:?} on {}", path, self.root),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn metadata(&mut self, path: &PathKey) -> Result<Entry, BackendError> {
        let absolute = self.absolute(path);
        let result = self.sftp()?.lstat(&absolute);
        let stat = match result {
            Ok(stat) => stat,
            Err(e) => {
                let err = ssh_error(e, format!("reading {:?}", absolute));
                return match err.kind {
                    BackendErrorKind::NotFound => Ok(Entry::Absent),
                    _ => Err(err),
                };
            }
        };
        let listed = list_entry(path.name().to_owned(), &stat);
        listed.entry().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Protocol,
                format!("{:?} is neither a file nor a folder", absolute),
            )
        })
    }

    fn read_into(
        &mut self,
        path: &PathKey,
        local: &Path,
        progress: &mut TransferProgress,
    ) -> Result<(), BackendError> {
        let absolute = self.absolute(path);
        let mut source = self
            .sftp()?
            .open(&absolute)
            .map_err(|e| ssh_error(e, format!("opening {:?}", absolute)))?;
        let total = source
            .stat()
            .map_err(|e| ssh_error(e, format!("reading {:?}", absolute)))?
            .size
            .unwrap_or(0);
        let mut dest =
            File::create(local).map_err(|e| BackendError::from_io(e, format!("creating {:?}", local)))?;
        copy_with_progress(&mut source, &mut dest, total, progress, &absolute.to_string_lossy())
    }

    fn write_from(
        &mut self,
        local: &Path,
        path: &PathKey,
        progress: &mut TransferProgress,
    ) -> Result<(), BackendError> {
        let absolute = self.absolute(path);
        let mut source =
            File::open(local).map_err(|e| BackendError::from_io(e, format!("opening {:?}", local)))?;
        let total = source
            .metadata()
            .map_err(|e| BackendError::from_io(e, format!("reading {:?}", local)))?
            .len();
        let mut dest = self
            .sftp()?
            .create(&absolute)
            .map_err(|e| ssh_error(e, format!("creating {:?}", absolute)))?;
        copy_with_progress(&mut source, &mut dest, total, progress, &absolute.to_string_lossy())
    }

    fn chmod(&mut self, path: &PathKey, mode: u32) -> Result<(), BackendError> {
        let absolute = self.absolute(path);
        self.sftp()?
            .setstat(&absolute, setstat(Some(mode & MODE_MASK), None))
            .map_err(|e| ssh_error(e, format!("changing mode of {:?}", absolute)))
    }

    fn set_times(&mut self, path: &PathKey, mtime: u64) -> Result<(), BackendError> {
        let absolute = self.absolute(path);
        self.sftp()?
            .setstat(&absolute, setstat(None, Some(mtime)))
            .map_err(|e| ssh_error(e, format!("setting times of {:?}", absolute)))
    }

    fn mkdir(&mut self, path: &PathKey, mode: u32) -> Result<(), BackendError> {
        let absolute = self.absolute(path);
        self.sftp()?
            .mkdir(&absolute, (mode & MODE_MASK) as i32)
            .map_err(|e| ssh_error(e, format!("creating directory {:?}", absolute)))
    }

    fn rmdir(&mut self, path: &PathKey) -> Result<(), BackendError> {
        let absolute = self.absolute(path);
        self.sftp()?
            .rmdir(&absolute)
            .map_err(|e| ssh_error(e, format!("removing directory {:?}", absolute)))
    }

    fn remove(&mut self, path: &PathKey) -> Result<(), BackendError> {
        let absolute = self.absolute(path);
        self.sftp()?
            .unlink(&absolute)
            .map_err(|e| ssh_error(e, format!("removing {:?}", absolute)))
    }

    /// Tries an atomic overwrite first. SFTP v3 servers such as OpenSSH's refuse to rename
    /// over an existing file, and then `to` is unlinked before a plain rename. This is not
    /// atomic: in between `to` does not exist, and if the second rename fails it stays gone.
    fn rename(&mut self, from: &PathKey, to: &PathKey) -> Result<(), BackendError> {
        let source = self.absolute(from);
        let dest = self.absolute(to);
        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        let sftp = self.sftp()?;
        if let Err(e) = sftp.rename(&source, &dest, Some(flags)) {
            let err = ssh_error(e, format!("renaming {:?}", source));
            if err.is_batch_fatal() || sftp.lstat(&dest).is_err() {
                return Err(err);
            }
            debug!("{}; replacing {:?} non-atomically", err, dest);
            sftp.unlink(&dest)
                .map_err(|e| ssh_error(e, format!("removing {:?}", dest)))?;
            sftp.rename(&source, &dest, None)
                .map_err(|e| ssh_error(e, format!("renaming {:?}", source)))?;
        }
        Ok(())
    }

    fn digest(&mut self, path: &PathKey) -> Result<Digest, BackendError> {
        match self.remote_digest(path)? {
            Some(digest) => Ok(digest),
            None => {
                debug!("sha256sum unavailable on {}, downloading {}", self.root.host, path);
                download_digest(self, path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use super::*;

    const KEY: [u8; 32] = [7; 32];
    const OTHER_KEY: [u8; 32] = [9; 32];

    struct Answer {
        decision: HostKeyDecision,
        asked: Cell<usize>,
    }

    impl Answer {
        fn new(decision: HostKeyDecision) -> Self {
            Answer {
                decision,
                asked: Cell::new(0),
            }
        }
    }

    impl HostKeyPolicy for Answer {
        fn decide(&self, _: &str, _: &str) -> HostKeyDecision {
            self.asked.set(self.asked.get() + 1);
            self.decision
        }
    }

    fn remote_root(text: &str) -> RemoteRoot {
        match text.parse::<crate::config::Root>().unwrap() {
            crate::config::Root::Remote(remote) => remote,
            crate::config::Root::Local(path) => panic!("{:?} parsed as local", path),
        }
    }

    fn destination(host: &str, port: u16) -> Destination {
        Destination {
            host: host.to_owned(),
            port,
            user: None,
            identity_files: Vec::new(),
        }
    }

    fn check(
        known_hosts: &Path,
        destination: &Destination,
        key: &[u8],
        policy: Option<&dyn HostKeyPolicy>,
    ) -> Result<(), BackendError> {
        let session = Session::new().unwrap();
        let mut known = session.known_hosts().unwrap();
        check_host_key(
            &mut known,
            Some(known_hosts),
            destination,
            key,
            HostKeyType::Ed25519,
            "SHA256:00",
            policy,
        )
    }

    #[test]
    fn ssh_config_fills_in_what_the_address_leaves_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config");
        fs::write(
            &config,
            "Host nas\n    HostName 192.168.1.20\n    User backup\n    Port 2200\n    \
             IdentityFile /keys/nas_ed25519\n\nHost *\n    ServerAliveInterval 30\n",
        )
        .unwrap();
        let files = vec![config];

        let resolved = Destination::resolve(&remote_root("ssh://nas/volume1"), &files);
        assert_eq!(
            resolved,
            Destination {
                host: "192.168.1.20".to_owned(),
                port: 2200,
                user: Some("backup".to_owned()),
                identity_files: vec![PathBuf::from("/keys/nas_ed25519")],
            }
        );

        let explicit = Destination::resolve(&remote_root("ssh://alice@nas:22/volume1"), &files);
        assert_eq!(explicit.host, "192.168.1.20");
        assert_eq!(explicit.port, 22);
        assert_eq!(explicit.user.as_deref(), Some("alice"));

        let other = Destination::resolve(&remote_root("ssh://example.org"), &files);
        assert_eq!(other, destination("example.org", 22));
    }

    #[test]
    fn missing_ssh_config_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = Destination::resolve(
            &remote_root("ssh://example.org:2222/srv"),
            &[dir.path().join("absent")],
        );
        assert_eq!(resolved, destination("example.org", 2222));
    }

    #[test]
    fn unknown_host_is_put_to_the_policy_and_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        let host = destination("example.org", 22);

        let remember = Answer::new(HostKeyDecision::AcceptAndRemember);
        check(&known_hosts, &host, &KEY, Some(&remember)).unwrap();
        assert_eq!(remember.asked.get(), 1);
        let written = fs::read_to_string(&known_hosts).unwrap();
        assert!(written.starts_with("example.org ssh-ed25519 "), "{}", written);

        // known now, so nobody is asked and a reconnect is fine as well
        let never = Answer::new(HostKeyDecision::Reject);
        check(&known_hosts, &host, &KEY, Some(&never)).unwrap();
        check(&known_hosts, &host, &KEY, None).unwrap();
        assert_eq!(never.asked.get(), 0);
    }

    #[test]
    fn changed_host_key_is_refused_without_asking() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        let host = destination("example.org", 22);
        check(&known_hosts, &host, &KEY, Some(&Answer::new(HostKeyDecision::AcceptAndRemember)))
            .unwrap();

        let accept = Answer::new(HostKeyDecision::Accept);
        let err = check(&known_hosts, &host, &OTHER_KEY, Some(&accept)).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::UnknownHostKey);
        assert_eq!(accept.asked.get(), 0);
    }

    #[test]
    fn rejected_or_reconnecting_unknown_host_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        let host = destination("example.org", 2222);

        let reject = Answer::new(HostKeyDecision::Reject);
        let err = check(&known_hosts, &host, &KEY, Some(&reject)).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::UnknownHostKey);
        assert_eq!(reject.asked.get(), 1);

        let err = check(&known_hosts, &host, &KEY, None).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::UnknownHostKey);

        let accept = Answer::new(HostKeyDecision::Accept);
        check(&known_hosts, &host, &KEY, Some(&accept)).unwrap();
        assert!(!known_hosts.exists());
    }

    #[test]
    fn non_default_port_is_remembered_in_brackets() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        let host = destination("example.org", 2222);
        check(&known_hosts, &host, &KEY, Some(&AcceptUnknownHosts { remember: true })).unwrap();
        let written = fs::read_to_string(&known_hosts).unwrap();
        assert!(written.starts_with("[example.org]:2222 "), "{}", written);
        check(&known_hosts, &host, &KEY, None).unwrap();
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("/srv/it's here"), r"'/srv/it'\''s here'");
    }

    #[test]
    fn sftp_status_codes_map_onto_backend_errors() {
        let err = ssh_error(
            ssh2::Error::new(ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE), "no such file"),
            "open",
        );
        assert_eq!(err.kind, BackendErrorKind::NotFound);

        let err = ssh_error(
            ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), "timed out"),
            "read",
        );
        assert_eq!(err.kind, BackendErrorKind::Timeout);
        assert!(err.is_batch_fatal());
    }

    #[test]
    fn directory_listing_rows_keep_permission_bits_only() {
        let stat = FileStat {
            size: Some(12),
            uid: None,
            gid: None,
            perm: Some(0o100644),
            atime: None,
            mtime: Some(1_600_000_000),
        };
        let entry = list_entry("a.txt".to_owned(), &stat);
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.entry(), Some(Entry::file(0o644, 1_600_000_000, 12)));
    }
}
