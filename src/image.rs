//! # Local Image Store
//!
//! An OCI image layout on disk under `var/repositories`:
//!
//! ```text
//! var/repositories/
//! ├── oci-layout          {"imageLayoutVersion":"1.0.0"}
//! ├── index.json          one descriptor per stored name
//! └── blobs/sha256/...    manifests, configs, layers
//! ```
//!
//! Every user-facing image is an `index.json` entry whose
//! `org.opencontainers.image.ref.name` annotation holds the canonical
//! reference name (see [`crate::reference`]). Entries without the
//! annotation, or whose media type is not a single-platform manifest, are
//! never returned.
//!
//! ## Operations
//!
//! | Operation              | Effect on `index.json`                              |
//! |------------------------|-----------------------------------------------------|
//! | [`ImageStore::find`]   | none                                                |
//! | [`ImageStore::replace_or_insert`] | drop same name and same digest, append   |
//! | [`ImageStore::tag`]    | `replace_or_insert` of an existing image            |
//! | [`ImageStore::remove`] | drop entries with the name                          |
//! | [`ImageStore::list`]   | none                                                |
//!
//! Index writes go through a temp file and rename. There is no lock: the
//! engine assumes one invocation mutates the store at a time.

use crate::config::Policy;
use crate::constants::{
    DOCKER_CONFIG_MEDIA_TYPE, MAX_MANIFEST_SIZE, OCI_IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_LAYOUT_VERSION, is_image_manifest,
};
use crate::error::{Error, Result};
use crate::oci::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest};
use crate::reference::ImageReference;
use crate::storage::{BlobStore, digest_hex};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Image
// =============================================================================

/// A stored image: manifest plus parsed config, addressed by manifest digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Digest of the manifest blob.
    pub digest: String,
    /// Media type of the manifest blob.
    pub media_type: String,
    /// Size of the manifest blob in bytes.
    pub size: u64,
    pub manifest: ImageManifest,
    pub config: ImageConfiguration,
}

impl Image {
    /// Hex part of the manifest digest; names the layer cache entry.
    pub fn hex(&self) -> &str {
        self.digest.strip_prefix("sha256:").unwrap_or(&self.digest)
    }

    /// Layer descriptors, base layer first.
    pub fn layers(&self) -> &[Descriptor] {
        &self.manifest.layers
    }

    /// Index descriptor for this image, without annotations.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(&self.media_type, &self.digest, self.size)
    }
}

/// One row of `image ls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub repository: String,
    pub tag: String,
    /// First 12 hex characters of the manifest digest.
    pub image_id: String,
    /// Sum of the stored layer blob sizes.
    pub size: u64,
}

// =============================================================================
// Image Store
// =============================================================================

/// OCI-layout image repository.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
    blobs: BlobStore,
    policy: Policy,
}

impl ImageStore {
    /// Opens the repository at `root`, creating the layout on first use.
    pub fn open(root: impl Into<PathBuf>, policy: Policy) -> Result<Self> {
        let root = root.into();
        let blobs = BlobStore::with_path(root.join("blobs"))?;

        let layout = root.join("oci-layout");
        if !layout.exists() {
            fs::write(&layout, OCI_LAYOUT_VERSION)?;
        }
        let store = Self {
            root,
            blobs,
            policy,
        };
        if !store.index_path().exists() {
            store.write_index(&ImageIndex::default())?;
            info!(path = %store.root.display(), "initialized image repository");
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Reads `index.json`.
    pub fn read_index(&self) -> Result<ImageIndex> {
        let data = fs::read(self.index_path())?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        let temp = self
            .root
            .join(format!(".index.json.{}", uuid::Uuid::now_v7().simple()));
        fs::write(&temp, data)?;
        fs::rename(&temp, self.index_path()).map_err(|e| {
            let _ = fs::remove_file(&temp);
            Error::Io(e)
        })
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Loads the image whose manifest has `digest`.
    pub fn load(&self, digest: &str) -> Result<Image> {
        let size = self.blobs.blob_size(digest)?;
        if size > MAX_MANIFEST_SIZE {
            return Err(Error::ManifestTooLarge {
                digest: digest.to_string(),
                size,
            });
        }
        let bytes = self.blobs.get_blob(digest)?;
        self.decode(digest.to_string(), &bytes)
    }

    fn decode(&self, digest: String, bytes: &[u8]) -> Result<Image> {
        let manifest: ImageManifest = serde_json::from_slice(bytes)?;
        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string());
        if !is_image_manifest(&media_type) {
            return Err(Error::UnsupportedMediaType(media_type));
        }

        let config_bytes = self.blobs.get_blob(&manifest.config.digest)?;
        let config: ImageConfiguration = serde_json::from_slice(&config_bytes)?;

        Ok(Image {
            digest,
            media_type,
            size: bytes.len() as u64,
            manifest,
            config,
        })
    }

    /// Stores manifest bytes verbatim and loads the image they describe.
    ///
    /// The config blob must already be in the store.
    pub fn commit_manifest(&self, bytes: &[u8]) -> Result<Image> {
        let digest = self.blobs.put_bytes(bytes)?;
        self.decode(digest, bytes)
    }

    /// Stores `config`, synthesizes a Docker v2 manifest over `layers`
    /// (already stored) and returns the resulting image.
    pub fn write_image(
        &self,
        config: &ImageConfiguration,
        layers: Vec<Descriptor>,
    ) -> Result<Image> {
        let config_bytes = serde_json::to_vec(config)?;
        let config_digest = self.blobs.put_bytes(&config_bytes)?;
        let manifest = ImageManifest::docker(
            Descriptor::new(
                DOCKER_CONFIG_MEDIA_TYPE,
                config_digest,
                config_bytes.len() as u64,
            ),
            layers,
        );
        self.commit_manifest(&serde_json::to_vec(&manifest)?)
    }

    // =========================================================================
    // Index operations
    // =========================================================================

    /// Finds the image stored under `reference`'s canonical name.
    pub fn find(&self, reference: &ImageReference) -> Result<Image> {
        self.find_by_name(&reference.canonical())
    }

    /// Finds the image stored under an exact ref name.
    pub fn find_by_name(&self, ref_name: &str) -> Result<Image> {
        let index = self.read_index()?;
        let entry = index
            .manifests
            .iter()
            .find(|d| is_image_manifest(&d.media_type) && d.ref_name() == Some(ref_name))
            .ok_or_else(|| Error::ImageNotFound(ref_name.to_string()))?;
        self.load(&entry.digest)
    }

    /// Indexes `image` under `ref_name`.
    ///
    /// Removes every entry that carries `ref_name` or points at the same
    /// digest, then appends the image annotated with `ref_name`.
    pub fn replace_or_insert(&self, image: &Image, ref_name: &str) -> Result<()> {
        let mut index = self.read_index()?;
        let before = index.manifests.len();
        index
            .manifests
            .retain(|d| d.ref_name() != Some(ref_name) && d.digest != image.digest);
        let replaced = before - index.manifests.len();

        index
            .manifests
            .push(image.descriptor().with_ref_name(ref_name));
        self.write_index(&index)?;

        debug!(ref_name, digest = %image.digest, replaced, "indexed image");
        Ok(())
    }

    /// Re-indexes the image found under `src` as `dst`.
    pub fn tag(&self, src: &ImageReference, dst: &ImageReference) -> Result<Image> {
        let image = self.find(src)?;
        self.replace_or_insert(&image, &dst.canonical())?;
        info!(src = %src, dst = %dst, digest = %image.digest, "tagged image");
        Ok(image)
    }

    /// Removes every entry named `reference`.
    pub fn remove(&self, reference: &ImageReference) -> Result<()> {
        let ref_name = reference.canonical();
        let mut index = self.read_index()?;
        let before = index.manifests.len();
        index
            .manifests
            .retain(|d| d.ref_name() != Some(ref_name.as_str()));
        if index.manifests.len() == before {
            return Err(Error::ImageNotFound(ref_name));
        }
        self.write_index(&index)?;
        info!(reference = %ref_name, "removed image");
        Ok(())
    }

    /// Summaries of every named image, in index order.
    pub fn list(&self) -> Result<Vec<ImageSummary>> {
        let index = self.read_index()?;
        let mut rows = Vec::new();

        for entry in &index.manifests {
            let Some(ref_name) = entry.ref_name() else {
                continue;
            };
            if !is_image_manifest(&entry.media_type) {
                continue;
            }

            let image = match self.load(&entry.digest) {
                Ok(image) => image,
                Err(e) if self.policy.strict_size_accounting => return Err(e),
                Err(e) => {
                    warn!(
                        reference = %ref_name,
                        digest = %entry.digest,
                        error = %e,
                        "skipping unreadable image"
                    );
                    continue;
                }
            };
            let mut size = 0u64;
            for layer in image.layers() {
                match self.blobs.blob_size(&layer.digest) {
                    Ok(n) => size += n,
                    Err(e) if self.policy.strict_size_accounting => return Err(e),
                    Err(e) => warn!(layer = %layer.digest, error = %e, "layer size unavailable"),
                }
            }

            let (repository, tag) = ImageReference::split_ref_name(ref_name);
            let image_id = digest_hex(&entry.digest)
                .map(|hex| hex[..12].to_string())
                .unwrap_or_default();
            rows.push(ImageSummary {
                repository,
                tag,
                image_id,
                size,
            });
        }
        Ok(rows)
    }
}
