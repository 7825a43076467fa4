//! # Remote Resolver
//!
//! Pulls images from OCI registries into the local [`ImageStore`].
//!
//! ## Features
//!
//! - **Multi-arch resolution**: selects the host's variant from an index
//! - **Layer deduplication**: blobs already in the store are not fetched
//! - **Always replace**: a pull re-indexes the canonical name even when the
//!   remote content is identical to what is stored
//! - **Timeouts**: the whole pull is bounded by `IMAGE_PULL_TIMEOUT`
//!
//! ## Transport Seam
//!
//! Network access goes through the [`ManifestSource`] trait. The
//! production implementation, [`RegistryClient`], wraps `oci-distribution`
//! with anonymous HTTPS access; tests substitute an in-memory source.
//!
//! ## Platform Selection
//!
//! For a multi-arch index, [`select_manifest`] walks the entries once:
//!
//! ```text
//!   arch == host && os == host   → selected, scan stops
//!   arch == host (first seen)    → kept as fallback, scan continues
//!   no arch match at all         → "no matching image for platform"
//! ```
//!
//! ## Security
//!
//! - References are validated by [`ImageReference::parse`] before use
//! - Layer count validated against `MAX_LAYERS`
//! - Blob sizes validated against `MAX_LAYER_SIZE` before fetching
//! - Manifests are kept as the exact bytes served and checked against the
//!   digest they were requested or reported under
//! - Every fetched blob is digest-verified by [`BlobStore::put_blob`]
//!
//! [`BlobStore::put_blob`]: crate::storage::BlobStore::put_blob

use crate::constants::{
    DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE, IMAGE_PULL_TIMEOUT,
    MAX_LAYER_SIZE, MAX_LAYERS, MAX_MANIFEST_SIZE, OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MANIFEST_MEDIA_TYPE, is_image_index,
};
use crate::error::{Error, Result};
use crate::image::{Image, ImageStore};
use crate::oci::{Descriptor, ImageIndex, ImageManifest};
use crate::platform::Platform;
use crate::reference::ImageReference;
use crate::storage::sha256_digest;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use tracing::{debug, info};

/// Manifest media types requested from registries.
const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    OCI_IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

// =============================================================================
// Transport Seam
// =============================================================================

/// Manifest as returned by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteManifest {
    /// Single-platform image manifest, as the exact bytes served.
    Image(Vec<u8>),
    /// Multi-arch index entries.
    Index(Vec<Descriptor>),
}

/// Just enough of a manifest document to tell an index from an image.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestKind {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

impl RemoteManifest {
    /// Classifies a raw manifest document by its media type, falling back
    /// to the presence of a `manifests` list when the type is absent.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let kind: ManifestKind = serde_json::from_slice(&raw)?;
        let is_index = match kind.media_type.as_deref() {
            Some(media_type) => is_image_index(media_type),
            None => kind.manifests.is_some(),
        };
        if is_index {
            let index: ImageIndex = serde_json::from_slice(&raw)?;
            Ok(RemoteManifest::Index(index.manifests))
        } else {
            Ok(RemoteManifest::Image(raw))
        }
    }
}

/// Source of manifests and blobs for a reference.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches the manifest for `reference`, or for `digest` within the
    /// same repository when given.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        digest: Option<&str>,
    ) -> Result<RemoteManifest>;

    /// Fetches a blob from the repository of `reference`.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>>;
}

// =============================================================================
// Registry Client
// =============================================================================

/// OCI registry client with anonymous HTTPS access.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(ClientConfig {
                protocol: ClientProtocol::Https,
                ..Default::default()
            }),
            auth: RegistryAuth::Anonymous,
        }
    }

    fn remote_reference(reference: &ImageReference, digest: Option<&str>) -> Result<Reference> {
        let text = match digest {
            Some(digest) => format!("{}@{}", reference.name(), digest),
            None => reference.canonical(),
        };
        text.parse().map_err(|e| Error::InvalidImageReference {
            reference: text.clone(),
            reason: format!("{e}"),
        })
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManifestSource for RegistryClient {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        digest: Option<&str>,
    ) -> Result<RemoteManifest> {
        let remote = Self::remote_reference(reference, digest)?;
        let (raw, manifest_digest) = self
            .client
            .pull_manifest_raw(&remote, &self.auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| Error::ImagePullFailed {
                reference: reference.canonical(),
                reason: e.to_string(),
            })?;
        debug!(reference = %remote, digest = %manifest_digest, size = raw.len(), "fetched manifest");

        check_manifest(&raw, &manifest_digest)?;
        RemoteManifest::from_bytes(raw)
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let remote = Self::remote_reference(reference, None)?;
        let layer = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: i64::try_from(descriptor.size).unwrap_or(i64::MAX),
            urls: None,
            annotations: None,
        };

        let mut data = Vec::new();
        self.client
            .pull_blob(&remote, &layer, &mut data)
            .await
            .map_err(|e| Error::ImagePullFailed {
                reference: reference.canonical(),
                reason: format!("blob {}: {e}", descriptor.digest),
            })?;
        Ok(data)
    }
}

/// Checks manifest bytes against the size limit and the expected digest.
///
/// Only `sha256` digests are verified; the local store cannot address
/// anything else.
fn check_manifest(raw: &[u8], expected: &str) -> Result<()> {
    if raw.len() as u64 > MAX_MANIFEST_SIZE {
        return Err(Error::ManifestTooLarge {
            digest: expected.to_string(),
            size: raw.len() as u64,
        });
    }
    if !expected.starts_with("sha256:") {
        return Ok(());
    }
    let actual = sha256_digest(raw);
    if actual != expected {
        return Err(Error::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Rejects a blob larger than `MAX_LAYER_SIZE`.
fn check_blob_size(descriptor: &Descriptor, size: u64) -> Result<()> {
    if size > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            digest: descriptor.digest.clone(),
            size,
            limit: MAX_LAYER_SIZE,
        });
    }
    Ok(())
}

// =============================================================================
// Resolution
// =============================================================================

/// Picks the index entry for `platform`.
///
/// An entry matching both architecture and OS wins immediately. Otherwise
/// the first architecture-only match is returned.
pub fn select_manifest<'a>(
    entries: &'a [Descriptor],
    platform: &Platform,
) -> Result<&'a Descriptor> {
    let mut fallback = None;
    for entry in entries {
        let Some(p) = &entry.platform else {
            continue;
        };
        if p.architecture != platform.architecture {
            continue;
        }
        if p.os == platform.os {
            return Ok(entry);
        }
        if fallback.is_none() {
            fallback = Some(entry);
        }
    }
    fallback.ok_or_else(|| Error::NoMatchingPlatform {
        os: platform.os.clone(),
        architecture: platform.architecture.clone(),
    })
}

/// Pulls `reference` into `store` and indexes it under its canonical name.
///
/// Any existing entry for the name is replaced, even if identical.
pub async fn pull(
    source: &dyn ManifestSource,
    store: &ImageStore,
    reference: &ImageReference,
    platform: &Platform,
) -> Result<Image> {
    info!(reference = %reference, platform = %platform, "pulling image");

    let fetched = fetch(source, store, reference, platform);
    let image = tokio::time::timeout(IMAGE_PULL_TIMEOUT, fetched)
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull {reference}"),
            duration: IMAGE_PULL_TIMEOUT,
        })??;

    store.replace_or_insert(&image, &reference.canonical())?;
    info!(reference = %reference, digest = %image.digest, "pulled image");
    Ok(image)
}

async fn fetch(
    source: &dyn ManifestSource,
    store: &ImageStore,
    reference: &ImageReference,
    platform: &Platform,
) -> Result<Image> {
    let raw = match source.fetch_manifest(reference, None).await? {
        RemoteManifest::Image(raw) => raw,
        RemoteManifest::Index(entries) => {
            let selected = select_manifest(&entries, platform)?;
            debug!(digest = %selected.digest, "selected platform manifest");
            match source.fetch_manifest(reference, Some(&selected.digest)).await? {
                RemoteManifest::Image(raw) => {
                    check_manifest(&raw, &selected.digest)?;
                    raw
                }
                RemoteManifest::Index(_) => {
                    return Err(Error::ImagePullFailed {
                        reference: reference.canonical(),
                        reason: "nested image index not supported".to_string(),
                    });
                }
            }
        }
    };
    let manifest: ImageManifest = serde_json::from_slice(&raw)?;

    if manifest.layers.len() > MAX_LAYERS {
        return Err(Error::ImagePullFailed {
            reference: reference.canonical(),
            reason: format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
        });
    }

    let blobs = store.blobs();
    for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        if blobs.has_blob(&descriptor.digest) {
            debug!(digest = %descriptor.digest, "blob already cached");
            continue;
        }
        check_blob_size(descriptor, descriptor.size)?;
        debug!(digest = %descriptor.digest, size = descriptor.size, "fetching blob");
        let data = source.fetch_blob(reference, descriptor).await?;
        check_blob_size(descriptor, data.len() as u64)?;
        blobs.put_blob(&descriptor.digest, &data)?;
    }

    store.commit_manifest(&raw)
}

/// Returns the local image for `reference`, pulling it when absent.
pub async fn get_image(
    source: &dyn ManifestSource,
    store: &ImageStore,
    reference: &ImageReference,
    platform: &Platform,
) -> Result<Image> {
    match store.find(reference) {
        Ok(image) => Ok(image),
        Err(Error::ImageNotFound(_)) => pull(source, store, reference, platform).await,
        Err(e) => Err(e),
    }
}
