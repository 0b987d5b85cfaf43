use std::convert::TryFrom;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A normalized path relative to a replica root.
///
/// Keys always start with `/`. Folders end with `/`, so `/a` (a file) and `/a/` (a folder)
/// are different keys. Keys compare in byte order, and because a folder key is a prefix of
/// every key below it, parents always sort before their children.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathKey(String);

impl PathKey {
    /// The root folder of a replica. It is never stored in a snapshot.
    pub fn root() -> PathKey {
        PathKey("/".to_owned())
    }

    pub fn parse(text: &str) -> Result<PathKey, SyncError> {
        if !text.starts_with('/') {
            return Err(invalid(text, "must start with '/'"));
        }
        if text == "/" {
            return Ok(PathKey::root());
        }
        let inner = text[1..].strip_suffix('/').unwrap_or(&text[1..]);
        for component in inner.split('/') {
            check_name(component).map_err(|reason| invalid(text, reason))?;
        }
        Ok(PathKey(text.to_owned()))
    }

    /// Builds a file key from a root-relative path such as `a/b.txt`.
    pub fn file(relative: &str) -> Result<PathKey, SyncError> {
        let key = PathKey::parse(&format!("/{}", relative.trim_start_matches('/')))?;
        if key.is_folder() {
            return Err(invalid(relative, "file keys cannot end with '/'"));
        }
        Ok(key)
    }

    /// Builds a folder key from a root-relative path such as `a/b`.
    pub fn folder(relative: &str) -> Result<PathKey, SyncError> {
        let trimmed = relative.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(PathKey::root());
        }
        PathKey::parse(&format!("/{}/", trimmed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn is_folder(&self) -> bool {
        self.0.ends_with('/')
    }

    /// The path without its leading and trailing separators, e.g. `a/b` for `/a/b/`.
    pub fn relative(&self) -> &str {
        self.0.trim_start_matches('/').trim_end_matches('/')
    }

    pub fn name(&self) -> &str {
        let relative = self.relative();
        relative.rsplit('/').next().unwrap_or(relative)
    }

    pub fn parent(&self) -> Option<PathKey> {
        if self.is_root() {
            return None;
        }
        let relative = self.relative();
        match relative.rfind('/') {
            Some(index) => Some(PathKey(format!("/{}/", &relative[..index]))),
            None => Some(PathKey::root()),
        }
    }

    pub fn child_file(&self, name: &str) -> Result<PathKey, SyncError> {
        self.child(name, false)
    }

    pub fn child_folder(&self, name: &str) -> Result<PathKey, SyncError> {
        self.child(name, true)
    }

    fn child(&self, name: &str, folder: bool) -> Result<PathKey, SyncError> {
        check_name(name).map_err(|reason| invalid(name, reason))?;
        debug_assert!(self.is_folder());
        let suffix = if folder { "/" } else { "" };
        Ok(PathKey(format!("{}{}{}", self.0, name, suffix)))
    }

    /// The key naming the same location with the other kind: `/a` <-> `/a/`.
    pub fn counterpart(&self) -> Option<PathKey> {
        if self.is_root() {
            None
        } else if self.is_folder() {
            Some(PathKey(self.0[..self.0.len() - 1].to_owned()))
        } else {
            Some(PathKey(format!("{}/", self.0)))
        }
    }

    /// True if `self` lies at or below the root-relative prefix `prefix`, compared by component.
    pub fn is_within(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_matches('/');
        let relative = self.relative();
        prefix.is_empty()
            || relative == prefix
            || (relative.starts_with(prefix) && relative[prefix.len()..].starts_with('/'))
    }

    /// Resolves the key against a local root directory.
    pub fn under(&self, root: &Path) -> PathBuf {
        let relative = self.relative();
        if relative.is_empty() {
            root.to_path_buf()
        } else {
            root.join(relative)
        }
    }
}

fn check_name(name: &str) -> Result<(), &'static str> {
    match name {
        "" => Err("empty component"),
        "." | ".." => Err("relative components are not allowed"),
        _ if name.contains('/') => Err("names cannot contain '/'"),
        _ if name.contains('\0') => Err("names cannot contain NUL"),
        _ => Ok(()),
    }
}

fn invalid(text: &str, reason: &str) -> SyncError {
    SyncError::Configuration(format!("invalid path {:?}: {}", text, reason))
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PathKey {
    type Error = SyncError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        PathKey::parse(&text)
    }
}

impl From<PathKey> for String {
    fn from(key: PathKey) -> String {
        key.0
    }
}
