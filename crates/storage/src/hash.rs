//! Product hashing and sizing.
//!
//! A product hash is formatted as `<algorithm>:<hex>`. A single regular
//! file hashes to the digest of its contents. A directory hashes to a
//! fingerprint built from, per sorted entry, the digest of the entry name,
//! a one-byte entry kind tag and the entry's own fingerprint; multi-part
//! products combine their parts the same way. Legacy bare-hex values (no
//! algorithm prefix) are SHA-1.

use md5::Md5;
use muninn_core::{Error, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Supported product hash algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(Error::Config(format!(
                "unsupported hash algorithm: \"{other}\""
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

/// Split a stored hash value into its algorithm and bare digest. A value
/// without a recognized `<algorithm>:` prefix is a legacy SHA-1 digest.
pub fn split_hash(value: &str) -> (Option<HashAlgorithm>, &str) {
    if let Some((prefix, digest)) = value.split_once(':') {
        if let Ok(algorithm) = HashAlgorithm::from_name(prefix) {
            return (Some(algorithm), digest);
        }
    }
    (None, value)
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<String> {
    use std::io::Read;
    let mut hasher = algorithm.hasher();
    let mut file = fs::File::open(path)
        .map_err(|e| Error::Storage(format!("cannot open '{}': {e}", path.display())))?;
    let mut buffer = [0u8; 65536];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| Error::Storage(format!("cannot read '{}': {e}", path.display())))?;
        if read == 0 {
            return Ok(hasher.finalize_hex());
        }
        hasher.update(&buffer[..read]);
    }
}

/// Entry kind tag. A top-level root is resolved, so a symlinked root is
/// tagged by what it points at; nested symlinks are tagged as links.
fn entry_kind(path: &Path, resolve_root: bool) -> &'static [u8] {
    if path.is_symlink() && !resolve_root {
        b"l"
    } else if path.is_dir() {
        b"d"
    } else {
        b"f"
    }
}

fn hash_path(algorithm: HashAlgorithm, path: &Path, resolve_root: bool) -> Result<String> {
    if path.is_symlink() && !resolve_root {
        // a nested link is fingerprinted by its target path, not by the
        // bytes behind it
        let target = fs::read_link(path)
            .map_err(|e| Error::Storage(format!("cannot read link '{}': {e}", path.display())))?;
        return Ok(hash_bytes(
            algorithm,
            target.to_string_lossy().as_bytes(),
        ));
    }
    if path.is_file() {
        return hash_file(algorithm, path);
    }
    if path.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(path)
            .map_err(|e| Error::Storage(format!("cannot list '{}': {e}", path.display())))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::Storage(e.to_string()))?;
        entries.sort();

        let mut hasher = algorithm.hasher();
        for entry in entries {
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            hasher.update(hash_bytes(algorithm, name.as_bytes()).as_bytes());
            hasher.update(entry_kind(&entry, false));
            hasher.update(hash_path(algorithm, &entry, false)?.as_bytes());
        }
        return Ok(hasher.finalize_hex());
    }
    Err(Error::Storage(format!(
        "path does not refer to a regular file or directory: {}",
        path.display()
    )))
}

/// Compute the `<algorithm>:<hex>` product hash of one or more paths.
pub fn product_hash(paths: &[PathBuf], algorithm: HashAlgorithm) -> Result<String> {
    if paths.len() == 1 {
        return Ok(format!(
            "{}:{}",
            algorithm.name(),
            hash_path(algorithm, &paths[0], true)?
        ));
    }

    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();

    let mut hasher = algorithm.hasher();
    for path in sorted {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        hasher.update(hash_bytes(algorithm, name.as_bytes()).as_bytes());
        hasher.update(entry_kind(path, true));
        hasher.update(hash_path(algorithm, path, true)?.as_bytes());
    }
    Ok(format!("{}:{}", algorithm.name(), hasher.finalize_hex()))
}

/// Total size in bytes of one or more files or directory trees.
pub fn product_size(paths: &[PathBuf]) -> Result<u64> {
    fn size_of(path: &Path) -> Result<u64> {
        let metadata = fs::symlink_metadata(path)
            .map_err(|e| Error::Storage(format!("cannot stat '{}': {e}", path.display())))?;
        if metadata.is_dir() {
            let mut total = 0;
            for entry in fs::read_dir(path).map_err(|e| Error::Storage(e.to_string()))? {
                total += size_of(&entry.map_err(|e| Error::Storage(e.to_string()))?.path())?;
            }
            Ok(total)
        } else if metadata.is_symlink() {
            // follow the link like a regular read would
            let metadata = fs::metadata(path)
                .map_err(|e| Error::Storage(format!("cannot stat '{}': {e}", path.display())))?;
            Ok(metadata.len())
        } else {
            Ok(metadata.len())
        }
    }

    paths.iter().map(|path| size_of(path)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_hash_is_content_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.dat");
        fs::write(&path, b"hello").unwrap();

        let hash = product_hash(&[path], HashAlgorithm::Md5).unwrap();
        assert_eq!(hash, "md5:5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn directory_fingerprint_depends_on_names() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("product");
        fs::create_dir(&product).unwrap();
        fs::write(product.join("a.dat"), b"one").unwrap();
        fs::write(product.join("b.dat"), b"two").unwrap();
        let first = product_hash(&[product.clone()], HashAlgorithm::Sha256).unwrap();

        fs::rename(product.join("b.dat"), product.join("c.dat")).unwrap();
        let second = product_hash(&[product], HashAlgorithm::Sha256).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn multi_part_hash_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.dat");
        let b = dir.path().join("b.dat");
        fs::write(&a, b"one").unwrap();
        fs::write(&b, b"two").unwrap();

        let forward = product_hash(&[a.clone(), b.clone()], HashAlgorithm::Md5).unwrap();
        let backward = product_hash(&[b, a], HashAlgorithm::Md5).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    #[cfg(unix)]
    fn nested_symlink_hashes_its_target_path() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("product");
        fs::create_dir(&product).unwrap();
        fs::write(dir.path().join("data.dat"), b"payload").unwrap();
        symlink("../data.dat", product.join("part.dat")).unwrap();

        let before = product_hash(&[product.clone()], HashAlgorithm::Md5).unwrap();

        // the fingerprint tracks the link target path, not the linked bytes
        fs::write(dir.path().join("data.dat"), b"different payload").unwrap();
        let unchanged = product_hash(&[product.clone()], HashAlgorithm::Md5).unwrap();
        assert_eq!(before, unchanged);

        fs::remove_file(product.join("part.dat")).unwrap();
        symlink("../other.dat", product.join("part.dat")).unwrap();
        fs::write(dir.path().join("other.dat"), b"payload").unwrap();
        let retargeted = product_hash(&[product], HashAlgorithm::Md5).unwrap();
        assert_ne!(before, retargeted);
    }

    #[test]
    fn legacy_bare_hex_is_sha1() {
        let (algorithm, digest) = split_hash("5d41402abc4b2a76b9719d911017c592");
        assert_eq!(algorithm, None);
        assert_eq!(digest, "5d41402abc4b2a76b9719d911017c592");

        let (algorithm, digest) = split_hash("md5:abc");
        assert_eq!(algorithm, Some(HashAlgorithm::Md5));
        assert_eq!(digest, "abc");
    }

    #[test]
    fn size_sums_trees() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("product");
        fs::create_dir(&product).unwrap();
        fs::write(product.join("a.dat"), b"12345").unwrap();
        fs::write(product.join("b.dat"), b"123").unwrap();
        assert_eq!(product_size(&[product]).unwrap(), 8);
    }
}
