//! # Image Archives (save / load)
//!
//! Moves images between hosts as tarballs.
//!
//! ## Archive Layout
//!
//! [`export`] writes a tar stream that is both an OCI image layout and a
//! `docker save` archive:
//!
//! ```text
//! oci-layout
//! index.json           one entry per saved name, ref-name annotated
//! manifest.json        [{"Config": "blobs/sha256/..", "RepoTags": [..], "Layers": [..]}]
//! blobs/sha256/<hex>   manifests, configs, layers
//! ```
//!
//! [`import`] accepts that format, plain `docker save` archives and
//! gzip-compressed variants of either. When the archive carries the image
//! manifest it is stored byte-for-byte, so an image keeps its digest across
//! a save/load round trip. Otherwise a Docker v2 manifest is synthesized.
//!
//! ## Naming on Import
//!
//! 1. the explicit tag passed by the caller
//! 2. the first `RepoTags` entry of the first `manifest.json` record
//! 3. the ref-name annotation of the first `index.json` entry
//! 4. the archive's file name without its last extension

use crate::constants::{
    DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE_GZIP, DOCKER_LAYER_MEDIA_TYPE_TAR,
    OCI_LAYOUT_VERSION, is_image_manifest,
};
use crate::error::{Error, Result};
use crate::image::{Image, ImageStore};
use crate::oci::{ArchiveManifestEntry, Descriptor, ImageIndex, ImageManifest};
use crate::reference::ImageReference;
use crate::storage::digest_hex;
use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info};

// =============================================================================
// Export
// =============================================================================

/// Writes the images named by `references` into one archive on `writer`.
pub fn export<W: Write>(
    store: &ImageStore,
    references: &[ImageReference],
    writer: W,
) -> Result<()> {
    let mut index = ImageIndex::default();
    let mut records = Vec::new();
    let mut blobs: BTreeSet<String> = BTreeSet::new();

    for reference in references {
        let image = store.find(reference)?;
        let ref_name = reference.canonical();

        index
            .manifests
            .push(image.descriptor().with_ref_name(&ref_name));

        let repo_tags = if reference.digest().is_none() {
            vec![ref_name]
        } else {
            Vec::new()
        };
        records.push(ArchiveManifestEntry {
            config: blob_entry_name(&image.manifest.config.digest)?,
            repo_tags,
            layers: image
                .layers()
                .iter()
                .map(|l| blob_entry_name(&l.digest))
                .collect::<Result<_>>()?,
        });

        blobs.insert(image.digest.clone());
        blobs.insert(image.manifest.config.digest.clone());
        blobs.extend(image.layers().iter().map(|l| l.digest.clone()));
    }

    let mut builder = Builder::new(writer);
    append_bytes(&mut builder, "oci-layout", OCI_LAYOUT_VERSION.as_bytes())?;
    append_bytes(&mut builder, "index.json", &serde_json::to_vec(&index)?)?;
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&records)?)?;
    append_dir(&mut builder, "blobs/")?;
    append_dir(&mut builder, "blobs/sha256/")?;

    for digest in &blobs {
        let file = store.blobs().open_blob(digest)?;
        let size = file.metadata()?.len();
        let mut header = file_header(size);
        builder.append_data(&mut header, blob_entry_name(digest)?, file)?;
    }

    builder.into_inner()?.flush()?;
    info!(images = references.len(), blobs = blobs.len(), "exported images");
    Ok(())
}

fn blob_entry_name(digest: &str) -> Result<String> {
    Ok(format!("blobs/sha256/{}", digest_hex(digest)?))
}

fn file_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header
}

fn append_bytes<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = file_header(data.len() as u64);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut Builder<W>, name: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    builder.append_data(&mut header, name, std::io::empty())?;
    Ok(())
}

// =============================================================================
// Import
// =============================================================================

/// Loads the archive at `path` into `store`.
///
/// Returns the ref name the image was indexed under, and the image.
pub fn import(
    store: &ImageStore,
    path: &Path,
    tag: Option<&ImageReference>,
    scratch: &Path,
) -> Result<(String, Image)> {
    let staging = scratch.join(uuid::Uuid::now_v7().simple().to_string());
    fs::create_dir_all(&staging)?;
    let result = import_staged(store, path, tag, &staging);
    let _ = fs::remove_dir_all(&staging);
    result
}

fn import_staged(
    store: &ImageStore,
    path: &Path,
    tag: Option<&ImageReference>,
    staging: &Path,
) -> Result<(String, Image)> {
    unpack_archive(path, staging)?;

    let records: Vec<ArchiveManifestEntry> =
        read_json(&staging.join("manifest.json"))?.unwrap_or_default();
    let index: Option<ImageIndex> = read_json(&staging.join("index.json"))?;

    let invalid = |reason: &str| Error::InvalidArchive {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let (image, embedded_name) = if let Some(record) = records.first() {
        let image = import_record(store, staging, record, index.as_ref())?;
        (image, record.repo_tags.first().cloned())
    } else if let Some(entry) = index.as_ref().and_then(|i| {
        i.manifests
            .iter()
            .find(|d| is_image_manifest(&d.media_type))
    }) {
        let image = import_oci_entry(store, staging, entry)?;
        (image, entry.ref_name().map(str::to_string))
    } else {
        return Err(invalid("neither manifest.json nor an OCI index found"));
    };

    let ref_name = match tag {
        Some(tag) => tag.canonical(),
        None => match embedded_name.and_then(|n| ImageReference::parse(&n).ok()) {
            Some(reference) => reference.canonical(),
            None => {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| invalid("cannot derive a name from the file name"))?;
                ImageReference::parse(stem)?.canonical()
            }
        },
    };

    store.replace_or_insert(&image, &ref_name)?;
    info!(reference = %ref_name, digest = %image.digest, "loaded image");
    Ok((ref_name, image))
}

/// Unpacks a plain or gzip-compressed tarball.
fn unpack_archive(path: &Path, dest: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let gzip = reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);
    let stream: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    // tar::Archive::unpack refuses entries that would escape `dest`.
    Archive::new(stream).unpack(dest)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Resolves an archive-relative path, refusing anything outside `staging`.
fn staged_path(staging: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::PathTraversal {
            path: name.to_string(),
        });
    }
    Ok(staging.join(relative))
}

/// Imports one `manifest.json` record.
fn import_record(
    store: &ImageStore,
    staging: &Path,
    record: &ArchiveManifestEntry,
    index: Option<&ImageIndex>,
) -> Result<Image> {
    let blobs = store.blobs();
    let (config_digest, config_size) = blobs.put_file(&staged_path(staging, &record.config)?)?;

    let mut layers = Vec::with_capacity(record.layers.len());
    for name in &record.layers {
        let source = staged_path(staging, name)?;
        let media_type = if is_gzip(&source)? {
            DOCKER_LAYER_MEDIA_TYPE_GZIP
        } else {
            DOCKER_LAYER_MEDIA_TYPE_TAR
        };
        let (digest, size) = blobs.put_file(&source)?;
        debug!(layer = %digest, size, "imported layer");
        layers.push(Descriptor::new(media_type, digest, size));
    }

    // Prefer the original manifest so the digest survives the round trip.
    if let Some(index) = index {
        for entry in index
            .manifests
            .iter()
            .filter(|d| is_image_manifest(&d.media_type))
        {
            let bytes = fs::read(staging.join(blob_entry_name(&entry.digest)?))?;
            let manifest: ImageManifest = serde_json::from_slice(&bytes)?;
            if manifest.config.digest == config_digest {
                return store.commit_manifest(&bytes);
            }
        }
    }

    let manifest = ImageManifest::docker(
        Descriptor::new(DOCKER_CONFIG_MEDIA_TYPE, config_digest, config_size),
        layers,
    );
    store.commit_manifest(&serde_json::to_vec(&manifest)?)
}

/// Imports an image from the OCI layout part of an archive.
fn import_oci_entry(store: &ImageStore, staging: &Path, entry: &Descriptor) -> Result<Image> {
    let blobs = store.blobs();
    let bytes = fs::read(staging.join(blob_entry_name(&entry.digest)?))?;
    let manifest: ImageManifest = serde_json::from_slice(&bytes)?;

    for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        let source = staging.join(blob_entry_name(&descriptor.digest)?);
        blobs.put_blob_from_file(&descriptor.digest, &source)?;
    }
    store.commit_manifest(&bytes)
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}
