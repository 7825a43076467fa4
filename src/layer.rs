//! # Layer Extraction and Cache
//!
//! Applies an image's layers, base first, onto a directory, and keeps one
//! flattened copy per image under `var/overlay/lower/<digest-hex>` for
//! overlay sandboxes to share.
//!
//! ## Layer Format
//!
//! Each layer is a tar stream, optionally gzip-compressed (detected by its
//! magic bytes, not by media type, since registries are inconsistent about
//! labelling). Within a layer:
//!
//! | Entry                   | Effect                                          |
//! |-------------------------|-------------------------------------------------|
//! | `dir/.wh.name`          | deletes `dir/name` from lower layers            |
//! | `dir/.wh..wh..opq`      | empties `dir` of content from lower layers      |
//! | anything else           | unpacked over what is already there             |
//!
//! ## Security
//!
//! Entry paths are checked component by component. Absolute paths and any
//! `..` component are rejected with [`Error::PathTraversal`] before the
//! entry touches the filesystem.
//!
//! Whiteouts, opaque markers, conflict removal and permission fixes act on
//! paths that already exist under the destination. Those paths are walked
//! with `symlink_metadata`, and an entry that would pass through a symlink
//! unpacked by an earlier layer is rejected the same way.
//!
//! The bytes unpacked into one tree are bounded by `MAX_ROOTFS_SIZE`, and
//! no single layer blob may exceed `MAX_LAYER_SIZE`.
//!
//! ## Cache Semantics
//!
//! A cache entry is written once and never modified. A miss extracts into
//! `var/tmp/<uuid>` and renames into place; when two materializers race,
//! the loser's rename fails, it finds the winner's directory present, and
//! it discards its own copy and reports success.

use crate::constants::{MAX_LAYER_SIZE, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::oci::Descriptor;
use crate::storage::BlobStore;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// =============================================================================
// Extraction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    fn sniff(head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if head.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Running total of bytes unpacked into one tree.
#[derive(Debug)]
struct SizeBudget {
    used: u64,
    limit: u64,
}

impl SizeBudget {
    fn new(limit: u64) -> Self {
        Self { used: 0, limit }
    }

    fn charge(&mut self, bytes: u64, digest: &str) -> Result<()> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(Error::LayerExtractionFailed {
                digest: digest.to_string(),
                reason: format!("extracted size exceeds limit of {} bytes", self.limit),
            });
        }
        Ok(())
    }
}

/// Applies `layers` in order onto `dest`.
pub fn extract_layers(blobs: &BlobStore, layers: &[Descriptor], dest: &Path) -> Result<()> {
    extract_bounded(blobs, layers, dest, MAX_ROOTFS_SIZE)
}

fn extract_bounded(
    blobs: &BlobStore,
    layers: &[Descriptor],
    dest: &Path,
    limit: u64,
) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut budget = SizeBudget::new(limit);
    for layer in layers {
        apply_layer(blobs, layer, dest, &mut budget)?;
    }
    Ok(())
}

fn apply_layer(
    blobs: &BlobStore,
    layer: &Descriptor,
    dest: &Path,
    budget: &mut SizeBudget,
) -> Result<()> {
    debug!(digest = %layer.digest, size = layer.size, "extracting layer");

    let blob_size = blobs.blob_size(&layer.digest)?;
    if blob_size > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            digest: layer.digest.clone(),
            size: blob_size,
            limit: MAX_LAYER_SIZE,
        });
    }

    let file = blobs.open_blob(&layer.digest)?;
    let mut reader = BufReader::new(file);
    let compression = Compression::sniff(reader.fill_buf()?);

    let stream: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
        Compression::None => Box::new(reader),
        Compression::Zstd => {
            return Err(Error::LayerExtractionFailed {
                digest: layer.digest.clone(),
                reason: "zstd-compressed layers are not supported".to_string(),
            });
        }
    };

    unpack(stream, dest, &layer.digest, budget).map_err(|e| match e {
        Error::Io(io) => Error::LayerExtractionFailed {
            digest: layer.digest.clone(),
            reason: io.to_string(),
        },
        other => other,
    })
}

/// Unpacks one tar stream onto `dest`, honouring whiteouts.
fn unpack(stream: impl Read, dest: &Path, digest: &str, budget: &mut SizeBudget) -> Result<()> {
    let mut archive = Archive::new(stream);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);
    // SAFETY: geteuid has no preconditions.
    archive.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);

    let mut extracted: HashSet<PathBuf> = HashSet::new();
    let mut readonly_dirs: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let relative = sanitize(&path)?;

        let Some(file_name) = relative.file_name().and_then(|n| n.to_str()) else {
            // Root entry ("./"); nothing to do.
            continue;
        };
        let parent = relative.parent().unwrap_or(Path::new("")).to_path_buf();

        if file_name == OPAQUE_WHITEOUT {
            reject_symlinks(dest, &parent)?;
            clear_lower_contents(&dest.join(&parent), &parent, &extracted)?;
            continue;
        }
        if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            reject_symlinks(dest, &parent)?;
            remove_path(&dest.join(&parent).join(target))?;
            continue;
        }

        budget.charge(entry.size(), digest)?;

        let mode = entry.header().mode().unwrap_or(0o755);
        let is_dir = entry.header().entry_type().is_dir();

        if !unpack_entry(&mut entry, dest, &relative)? {
            return Err(Error::PathTraversal {
                path: path.display().to_string(),
            });
        }

        // Read-only directories would block later entries beneath them.
        if is_dir && mode & 0o200 == 0 {
            reject_symlinks(dest, &relative)?;
            let full = dest.join(&relative);
            fs::set_permissions(&full, fs::Permissions::from_mode(mode | 0o700))?;
            readonly_dirs.push((relative.clone(), mode));
        }

        extracted.insert(relative);
    }

    for (relative, mode) in readonly_dirs.into_iter().rev() {
        // A later entry may have replaced the directory.
        if reject_symlinks(dest, &relative).is_err() {
            continue;
        }
        match fs::symlink_metadata(dest.join(&relative)) {
            Ok(meta) if meta.is_dir() => fs::set_permissions(
                dest.join(&relative),
                fs::Permissions::from_mode(mode & 0o7777),
            )?,
            _ => {}
        }
    }
    Ok(())
}

/// Unpacks an entry, clearing a conflicting path and retrying once.
fn unpack_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    dest: &Path,
    relative: &Path,
) -> Result<bool> {
    match entry.unpack_in(dest) {
        Ok(done) => Ok(done),
        Err(first) => {
            if let Some(parent) = relative.parent() {
                reject_symlinks(dest, parent)?;
            }
            let target = dest.join(relative);
            if fs::symlink_metadata(&target).is_err() {
                return Err(Error::Io(first));
            }
            warn!(path = %relative.display(), error = %first, "replacing conflicting path");
            remove_path(&target)?;
            Ok(entry.unpack_in(dest)?)
        }
    }
}

/// Validates an entry path and returns it without `.` components.
///
/// # Security
///
/// Rejects absolute paths and `..` anywhere in the path.
fn sanitize(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: path.display().to_string(),
                });
            }
        }
    }
    Ok(clean)
}

/// Fails with [`Error::PathTraversal`] when an existing component of
/// `relative` under `dest` is a symlink. The walk stops at the first
/// component that does not exist.
fn reject_symlinks(dest: &Path, relative: &Path) -> Result<()> {
    let mut current = dest.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: relative.display().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Removes a file, symlink or directory tree. Missing paths are fine.
fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Empties `dir` of everything not unpacked by the current layer.
fn clear_lower_contents(dir: &Path, relative: &Path, extracted: &HashSet<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
    };
    for child in entries {
        let child = child?;
        let child_relative = relative.join(child.file_name());
        if extracted.iter().any(|p| p.starts_with(&child_relative)) {
            continue;
        }
        remove_path(&child.path())?;
    }
    Ok(())
}

// =============================================================================
// Layer Cache
// =============================================================================

/// Append-only cache of flattened image filesystems.
#[derive(Debug, Clone)]
pub struct LayerCache {
    cache_dir: PathBuf,
    temp_dir: PathBuf,
    blobs: BlobStore,
}

impl LayerCache {
    pub fn new(cache_dir: PathBuf, temp_dir: PathBuf, blobs: BlobStore) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            cache_dir,
            temp_dir,
            blobs,
        })
    }

    /// Cache directory for `image`, whether or not it exists yet.
    pub fn path_for(&self, image: &Image) -> PathBuf {
        self.cache_dir.join(image.hex())
    }

    /// Returns the flattened filesystem of `image`, extracting it on a miss.
    pub fn materialize(&self, image: &Image) -> Result<PathBuf> {
        let target = self.path_for(image);
        if target.is_dir() {
            debug!(digest = %image.digest, "layer cache hit");
            return Ok(target);
        }

        let staging = self
            .temp_dir
            .join(uuid::Uuid::now_v7().simple().to_string());
        if let Err(e) = extract_layers(&self.blobs, image.layers(), &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        match fs::rename(&staging, &target) {
            Ok(()) => {
                info!(digest = %image.digest, path = %target.display(), "materialized image");
                Ok(target)
            }
            Err(e) if target.is_dir() => {
                debug!(digest = %image.digest, error = %e, "lost materialize race");
                let _ = fs::remove_dir_all(&staging);
                Ok(target)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(Error::Io(e))
            }
        }
    }

    /// Extracts `image` into a private directory, bypassing the cache.
    pub fn extract_into(&self, image: &Image, dest: &Path) -> Result<()> {
        extract_layers(&self.blobs, image.layers(), dest)
    }
}
