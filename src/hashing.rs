//! SHA-256 helpers for content hashes.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex-encoded SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Combine labelled parts into one digest. Order matters.
pub fn combine<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut hasher = Sha256::new();
    for (label, value) in parts {
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0xffu8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, b"chapter one").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_bytes(b"chapter one"));
    }

    #[test]
    fn combine_is_order_and_boundary_sensitive() {
        let ab = combine([("a", "1"), ("b", "2")]);
        let ba = combine([("b", "2"), ("a", "1")]);
        let merged = combine([("a1", ""), ("b", "2")]);
        assert_ne!(ab, ba);
        assert_ne!(ab, merged);
        assert_eq!(ab, combine([("a", "1"), ("b", "2")]));
    }
}
