use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

/// SHA-256 of a file's contents. Only used to break ties between conflicting files whose
/// metadata already matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Digest {
    type Err = String;

    /// Parses the hex digest printed by `sha256sum`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.len() != 64 || !text.is_ascii() {
            return Err(format!("not a sha256 digest: {:?}", text));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
                .map_err(|e| format!("not a sha256 digest: {:?}: {}", text, e))?;
        }
        Ok(Digest(bytes))
    }
}

#[cfg(test)]
pub fn digest_bytes(content: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(content);
    finish(hasher)
}

pub fn digest_file(path: &Path) -> io::Result<Digest> {
    debug!("Hashing {:?}", path);
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(finish(hasher))
}

fn finish(hasher: Sha256) -> Digest {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    Digest(bytes)
}
