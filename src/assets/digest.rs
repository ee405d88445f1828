//! MD5 + SHA256 computed in a single pass.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BuildResult, IoContext};

const BUF_SIZE: usize = 1024 * 1024;

/// Checksums and size of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub size: u64,
    pub md5: String,
    pub sha256: String,
}

/// Incremental hasher feeding both digests.
#[derive(Default)]
pub struct DualHasher {
    md5: Md5,
    sha256: Sha256,
    size: u64,
}

impl DualHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha256.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn finalize(self) -> Digests {
        Digests {
            size: self.size,
            md5: format!("{:x}", self.md5.finalize()),
            sha256: format!("{:x}", self.sha256.finalize()),
        }
    }
}

pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<Digests> {
    let mut hasher = DualHasher::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

pub fn hash_file(path: &Path) -> BuildResult<Digests> {
    let f = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    hash_reader(BufReader::new(f)).io_context(|| format!("hashing '{}'", path.display()))
}

pub fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hex sha256 of an in-memory value.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        let d = hash_reader(&b"abc"[..]).unwrap();
        assert_eq!(d.size, 3);
        assert_eq!(d.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            d.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn chunked_updates_match_single_pass() {
        let mut hasher = DualHasher::new();
        hasher.update(b"a");
        hasher.update(b"bc");
        assert_eq!(hasher.finalize(), hash_reader(&b"abc"[..]).unwrap());
    }
}
