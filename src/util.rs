use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hash, Hasher};

use fnv::FnvHasher;

use crate::path::PathKey;

const PARTIAL_PREFIX: &str = ".twosync-";
const PARTIAL_SUFFIX: &str = ".partial";

pub fn hash_single<T: Hash + ?Sized>(object: &T) -> u64 {
    let mut hasher: FnvHasher = Default::default();
    object.hash(&mut hasher);
    hasher.finish()
}

pub type FnvHashMap<K, T> = HashMap<K, T, BuildHasherDefault<FnvHasher>>;

/// The sibling name a file is written to before being renamed over `path`.
///
/// The name only depends on `path`, so a transfer interrupted in an earlier run leaves
/// behind a file the next attempt simply overwrites.
pub fn temp_key_for(path: &PathKey) -> PathKey {
    let parent = path.parent().unwrap_or_else(PathKey::root);
    let name = format!("{}{:016x}{}", PARTIAL_PREFIX, hash_single(path.as_str()), PARTIAL_SUFFIX);
    parent
        .child_file(&name)
        .unwrap_or_else(|_| unreachable!("generated temp names are always valid"))
}

/// Temporary transfer files are never part of a snapshot.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_key_is_a_deterministic_sibling() {
        let path = PathKey::parse("/docs/report.txt").unwrap();
        let temp = temp_key_for(&path);
        assert_eq!(temp, temp_key_for(&path));
        assert_eq!(temp.parent(), path.parent());
        assert!(is_temp_name(temp.name()));
        assert_ne!(temp, temp_key_for(&PathKey::parse("/docs/other.txt").unwrap()));
    }
}
