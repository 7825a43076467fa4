//! Shared fixtures: in-memory layer tarballs and images built on top of them.

#![allow(dead_code)]

use async_trait::async_trait;
use cask::constants::{
    DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE_GZIP, DOCKER_LAYER_MEDIA_TYPE_TAR,
    DOCKER_MANIFEST_MEDIA_TYPE,
};
use cask::oci::{
    ContainerConfig, Descriptor, ImageConfiguration, ImageManifest, Platform as OciPlatform,
};
use cask::storage::sha256_digest;
use cask::{BlobStore, Image, ImageReference, ImageStore, ManifestSource, RemoteManifest};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tar::{Builder, EntryType, Header};

/// GNU header owned by root, so unpacking with preserved ownership works.
fn header(kind: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header
}

/// Builds a layer tarball entry by entry.
pub struct LayerBuilder {
    builder: Builder<Vec<u8>>,
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: Builder::new(Vec::new()),
        }
    }

    pub fn dir(self, path: &str) -> Self {
        self.dir_with_mode(path, 0o755)
    }

    pub fn dir_with_mode(mut self, path: &str, mode: u32) -> Self {
        let mut header = header(EntryType::Directory, mode);
        header.set_size(0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn file(mut self, path: &str, contents: &str) -> Self {
        let mut header = header(EntryType::Regular, 0o644);
        header.set_size(contents.len() as u64);
        self.builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = header(EntryType::Symlink, 0o777);
        header.set_size(0);
        self.builder
            .append_link(&mut header, path, target)
            .unwrap();
        self
    }

    /// Deletes `dir/name` from lower layers.
    pub fn whiteout(self, dir: &str, name: &str) -> Self {
        let path = if dir.is_empty() {
            format!(".wh.{name}")
        } else {
            format!("{dir}/.wh.{name}")
        };
        self.file(&path, "")
    }

    /// Hides everything lower layers put in `dir`.
    pub fn opaque(self, dir: &str) -> Self {
        self.file(&format!("{dir}/.wh..wh..opq"), "")
    }

    /// Appends an entry whose raw name bypasses the tar crate's path checks.
    pub fn raw_entry(mut self, name: &str, contents: &str) -> Self {
        let mut header = Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        self.builder.append(&header, contents.as_bytes()).unwrap();
        self
    }

    pub fn tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn gzip(self) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.tar()).unwrap();
        encoder.finish().unwrap()
    }
}

/// Stores a layer blob and returns its descriptor.
pub fn store_layer(blobs: &BlobStore, data: &[u8]) -> Descriptor {
    let digest = blobs.put_bytes(data).unwrap();
    let media_type = if data.starts_with(&[0x1f, 0x8b]) {
        DOCKER_LAYER_MEDIA_TYPE_GZIP
    } else {
        DOCKER_LAYER_MEDIA_TYPE_TAR
    };
    Descriptor::new(media_type, digest, data.len() as u64)
}

/// Image configuration with the given entrypoint and command.
pub fn image_config(entrypoint: &[&str], cmd: &[&str]) -> ImageConfiguration {
    let owned = |v: &[&str]| {
        (!v.is_empty()).then(|| v.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    };
    ImageConfiguration {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        config: Some(ContainerConfig {
            entrypoint: owned(entrypoint),
            cmd: owned(cmd),
            env: Some(vec!["PATH=/bin".to_string()]),
            ..Default::default()
        }),
        rootfs: None,
    }
}

/// Stores `layers` and an image over them, indexed under `ref_name`.
pub fn add_image(store: &ImageStore, ref_name: &str, layers: &[Vec<u8>], cmd: &[&str]) -> Image {
    let descriptors = layers
        .iter()
        .map(|data| store_layer(store.blobs(), data))
        .collect();
    let image = store
        .write_image(&image_config(&[], cmd), descriptors)
        .unwrap();
    store.replace_or_insert(&image, ref_name).unwrap();
    image
}

/// The classic two-layer fixture: a base with a few files, and an upper
/// layer that overrides one, deletes one and adds one.
pub fn two_layers() -> Vec<Vec<u8>> {
    let base = LayerBuilder::new()
        .dir("etc")
        .file("etc/motd", "base motd\n")
        .file("etc/hostname", "base\n")
        .dir("bin")
        .file("bin/app", "#!/bin/sh\n")
        .gzip();
    let upper = LayerBuilder::new()
        .file("etc/motd", "upper motd\n")
        .whiteout("etc", "hostname")
        .file("etc/added", "added\n")
        .tar();
    vec![base, upper]
}

/// True when the test process runs with an effective uid of 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

// =============================================================================
// In-memory registry
// =============================================================================

/// Registry double serving one tagged manifest plus content by digest.
#[derive(Default)]
pub struct FakeRegistry {
    tagged: Mutex<Option<RemoteManifest>>,
    manifests: Mutex<HashMap<String, Vec<u8>>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub blob_fetches: AtomicUsize,
    pub manifest_fetches: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an image built from `layers` and returns its manifest bytes
    /// and manifest digest. Nothing is tagged.
    pub fn publish(&self, layers: &[Vec<u8>], cmd: &[&str]) -> (Vec<u8>, String) {
        let manifest = self.push_blobs(layers, cmd);
        self.publish_manifest(serde_json::to_vec(&manifest).unwrap())
    }

    /// Stores config and layer blobs and returns a manifest over them,
    /// without publishing the manifest itself.
    pub fn push_blobs(&self, layers: &[Vec<u8>], cmd: &[&str]) -> ImageManifest {
        let mut blobs = self.blobs.lock().unwrap();

        let config = serde_json::to_vec(&image_config(&[], cmd)).unwrap();
        let config_digest = sha256_digest(&config);
        let config_desc =
            Descriptor::new(DOCKER_CONFIG_MEDIA_TYPE, &config_digest, config.len() as u64);
        blobs.insert(config_digest, config);

        let layer_descs = layers
            .iter()
            .map(|data| {
                let digest = sha256_digest(data);
                blobs.insert(digest.clone(), data.clone());
                Descriptor::new(DOCKER_LAYER_MEDIA_TYPE_TAR, digest, data.len() as u64)
            })
            .collect();

        ImageManifest::docker(config_desc, layer_descs)
    }

    /// Publishes manifest bytes as they are and returns them with their digest.
    pub fn publish_manifest(&self, raw: Vec<u8>) -> (Vec<u8>, String) {
        let digest = sha256_digest(&raw);
        self.serve_by_digest(&digest, raw.clone());
        (raw, digest)
    }

    /// Serves `raw` for a fetch by `digest`, whether or not it matches.
    pub fn serve_by_digest(&self, digest: &str, raw: Vec<u8>) {
        self.manifests
            .lock()
            .unwrap()
            .insert(digest.to_string(), raw);
    }

    /// Sets what a fetch by tag returns.
    pub fn serve(&self, manifest: RemoteManifest) {
        *self.tagged.lock().unwrap() = Some(manifest);
    }

    /// Index entry pointing at a published manifest.
    pub fn index_entry(digest: &str, os: &str, architecture: &str) -> Descriptor {
        let mut entry = Descriptor::new(DOCKER_MANIFEST_MEDIA_TYPE, digest, 0);
        entry.platform = Some(OciPlatform {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: None,
        });
        entry
    }
}

#[async_trait]
impl ManifestSource for FakeRegistry {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        digest: Option<&str>,
    ) -> cask::Result<RemoteManifest> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let not_found = || cask::Error::ImagePullFailed {
            reference: reference.canonical(),
            reason: "manifest unknown".to_string(),
        };
        match digest {
            Some(digest) => self
                .manifests
                .lock()
                .unwrap()
                .get(digest)
                .cloned()
                .map(RemoteManifest::Image)
                .ok_or_else(not_found),
            None => self.tagged.lock().unwrap().clone().ok_or_else(not_found),
        }
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> cask::Result<Vec<u8>> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .unwrap()
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| cask::Error::ImagePullFailed {
                reference: reference.canonical(),
                reason: format!("blob {} unknown", descriptor.digest),
            })
    }
}
