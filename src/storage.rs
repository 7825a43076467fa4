//! # Content-Addressed Blob Storage
//!
//! Stores manifests, configs and layers of the local image repository by
//! their SHA-256 digest, in the flat layout the OCI image-layout format
//! prescribes:
//!
//! ```text
//! var/repositories/blobs/
//! └── sha256/
//!     ├── 4bcff63911fcb4448bd4fdacec207030997caf25e9bea4045fa6c8c44de311d1
//!     └── 9b2ff8d1...
//! ```
//!
//! ## Security Model
//!
//! ### Digest Verification
//!
//! [`BlobStore::put_blob`] and [`BlobStore::put_blob_from_file`] hash the
//! content and refuse to store it unless it matches the declared digest. A
//! registry or archive cannot poison the store with mislabelled content.
//!
//! ### Path Traversal Protection
//!
//! Digests are parsed strictly (`sha256:` followed by 64 lowercase hex
//! characters) before they are turned into paths. Anything else is an
//! [`Error::InvalidDigest`].
//!
//! ### Atomic Writes
//!
//! Blobs are written to a uniquely named temp file next to their final
//! location and renamed into place, so a crash never leaves a partial blob
//! under a valid digest.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Computes the `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Returns the hex part of a validated `sha256:<hex>` digest.
///
/// # Security
///
/// This is the only way digests become path components.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| Error::InvalidDigest(digest.to_string()))?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(Error::InvalidDigest(digest.to_string()));
    }
    Ok(hex)
}

/// Content-addressed blob store rooted at an OCI layout's `blobs/` dir.
///
/// ## Thread Safety
///
/// Each operation is independent and writes are atomic, so concurrent
/// writers of the same blob converge on identical content.
#[derive(Debug, Clone)]
pub struct BlobStore {
    /// The `blobs` directory.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join("sha256")).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of a blob, whether or not it exists.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.base_dir.join("sha256").join(digest_hex(digest)?))
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|p| p.is_file())
    }

    /// Reads a blob.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::BlobNotFound {
                digest: digest.to_string(),
            },
            _ => Error::Io(e),
        })
    }

    /// Opens a blob for streaming reads.
    pub fn open_blob(&self, digest: &str) -> Result<File> {
        let path = self.blob_path(digest)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::BlobNotFound {
                digest: digest.to_string(),
            },
            _ => Error::Io(e),
        })
    }

    /// Size of a stored blob in bytes.
    pub fn blob_size(&self, digest: &str) -> Result<u64> {
        let path = self.blob_path(digest)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Stores a blob after verifying its content matches the digest.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest)?;

        // SECURITY: Verify content matches digest before storage
        let computed = sha256_digest(data);
        if computed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        if path.exists() {
            debug!(digest, "blob already present");
            return Ok(());
        }

        let temp_path = self.temp_path();
        fs::write(&temp_path, data)?;
        self.commit(&temp_path, &path)?;

        debug!(digest, size = data.len(), "stored blob");
        Ok(())
    }

    /// Stores `data` under its own digest and returns that digest.
    pub fn put_bytes(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        self.put_blob(&digest, data)?;
        Ok(digest)
    }

    /// Streams a file into the store, verifying it hashes to `digest`.
    pub fn put_blob_from_file(&self, digest: &str, source: &Path) -> Result<()> {
        let path = self.blob_path(digest)?;
        if path.exists() {
            debug!(digest, "blob already present");
            return Ok(());
        }

        let temp_path = self.temp_path();
        let computed = match copy_hashed(source, &temp_path) {
            Ok((computed, _)) => computed,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };
        if computed != digest {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        self.commit(&temp_path, &path)?;
        debug!(digest, source = %source.display(), "stored blob from file");
        Ok(())
    }

    /// Streams a file into the store under its own digest.
    ///
    /// Returns the digest and size of the stored blob.
    pub fn put_file(&self, source: &Path) -> Result<(String, u64)> {
        let temp_path = self.temp_path();
        let (digest, size) = match copy_hashed(source, &temp_path) {
            Ok(result) => result,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        let path = self.blob_path(&digest)?;
        if path.exists() {
            let _ = fs::remove_file(&temp_path);
        } else {
            self.commit(&temp_path, &path)?;
        }
        debug!(digest = %digest, size, source = %source.display(), "stored file");
        Ok((digest, size))
    }

    /// Removes a blob. Missing blobs are not an error.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(digest)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    // SECURITY: Unique temp names keep concurrent writers of the same blob
    // from clobbering each other's partial files.
    fn temp_path(&self) -> PathBuf {
        self.base_dir
            .join("sha256")
            .join(format!(".tmp.{}", uuid::Uuid::now_v7().simple()))
    }

    fn commit(&self, temp_path: &Path, path: &Path) -> Result<()> {
        fs::rename(temp_path, path).map_err(|e| {
            let _ = fs::remove_file(temp_path);
            Error::Io(e)
        })
    }
}

/// Copies `source` to `dest`, returning the SHA-256 digest and size.
fn copy_hashed(source: &Path, dest: &Path) -> Result<(String, u64)> {
    let mut input = File::open(source)?;
    let mut output = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        size += n as u64;
    }
    output.sync_all()?;
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().join("blobs")).unwrap();

        let data = b"hello world";
        let digest = store.put_bytes(data).unwrap();

        assert!(store.has_blob(&digest));
        assert_eq!(store.get_blob(&digest).unwrap(), data);
        assert_eq!(store.blob_size(&digest).unwrap(), data.len() as u64);

        store.remove_blob(&digest).unwrap();
        assert!(!store.has_blob(&digest));
        assert!(matches!(
            store.get_blob(&digest),
            Err(Error::BlobNotFound { .. })
        ));
    }

    #[test]
    fn test_blob_digest_verification_fails() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().join("blobs")).unwrap();

        let wrong = format!("sha256:{}", "0".repeat(64));
        let result = store.put_blob(&wrong, b"hello world");
        assert!(matches!(result, Err(Error::DigestMismatch { .. })));
        assert!(!store.has_blob(&wrong));
    }

    #[test]
    fn test_put_blob_from_file_verifies() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().join("blobs")).unwrap();
        let source = temp.path().join("layer.tar");
        fs::write(&source, b"layer bytes").unwrap();

        let digest = sha256_digest(b"layer bytes");
        store.put_blob_from_file(&digest, &source).unwrap();
        assert_eq!(store.get_blob(&digest).unwrap(), b"layer bytes");

        let (same, size) = store.put_file(&source).unwrap();
        assert_eq!(same, digest);
        assert_eq!(size, 11);

        let wrong = sha256_digest(b"other");
        assert!(store.put_blob_from_file(&wrong, &source).is_err());
        let leftovers: Vec<_> = fs::read_dir(temp.path().join("blobs/sha256"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_blob_path_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_path(temp.path().join("blobs")).unwrap();

        assert!(store.blob_path("sha256:../../etc/passwd").is_err());
        assert!(store.blob_path("md5:abcd").is_err());
        assert!(store.blob_path(&format!("sha256:{}", "A".repeat(64))).is_err());

        let ok = format!("sha256:{}", "ab".repeat(32));
        let path = store.blob_path(&ok).unwrap();
        assert!(path.ends_with(format!("sha256/{}", "ab".repeat(32))));
    }
}
