//! # Engine Constants
//!
//! Fixed paths, media types, timeouts and limits used across the engine.
//! These constants are the single source of truth for the on-disk layout
//! and for the bounds enforced during image handling.
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Joins the relative paths below onto the engine root
//! - [`crate::registry`]: Uses the pull deadline and media types
//! - [`crate::layer`]: Uses the extraction limits
//! - [`crate::lifecycle`]: Uses the termination grace period and poll interval

use std::time::Duration;

// =============================================================================
// Filesystem Layout
// =============================================================================
//
// Every engine path is relative to the configured root directory (the
// current working directory unless overridden). Cgroups are the exception:
// they live under the cgroup v2 mount.
// =============================================================================

/// OCI-layout image repository (`oci-layout`, `index.json`, `blobs/`).
pub const REPOSITORY_DIR: &str = "var/repositories";

/// Flattened layer cache, one directory per image digest hex.
pub const LAYER_CACHE_DIR: &str = "var/overlay/lower";

/// Per-container overlay upper directories.
pub const OVERLAY_UPPER_DIR: &str = "var/overlay/upper";

/// Per-container overlay working directories.
pub const OVERLAY_WORK_DIR: &str = "var/overlay/working";

/// Per-container sandbox roots (overlay mount points or extracted trees).
pub const SANDBOX_DIR: &str = "var/sandbox";

/// Scratch space for in-progress extractions and imports.
pub const TEMP_DIR: &str = "var/tmp";

/// Serialized launch descriptors handed to the re-exec'd child.
pub const RUNTIME_DIR: &str = "var/runtime";

/// Flat JSON container metadata store.
pub const CONTAINER_META_FILE: &str = "var/container.json";

/// Default cgroup v2 mount point.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Slice directory holding one `<id>.scope` cgroup per container.
pub const CGROUP_SLICE: &str = "container.slice";

/// Internal subcommand the binary re-executes itself with for stage 2.
pub const REEXEC_COMMAND: &str = "inner-container-run";

// =============================================================================
// Environment Variables
// =============================================================================

/// Overrides the engine root directory.
pub const ENV_ROOT: &str = "CASK_ROOT";

/// Overrides the cgroup v2 mount point.
pub const ENV_CGROUP_ROOT: &str = "CASK_CGROUP_ROOT";

/// Enables strict policy (`1`/`true`): size lookups and user switches fail hard.
pub const ENV_STRICT: &str = "CASK_STRICT";

/// Forces a sandbox strategy (`auto`, `overlay`, `extract`).
pub const ENV_SANDBOX: &str = "CASK_SANDBOX";

// =============================================================================
// Timeouts
// =============================================================================

/// Deadline for a complete image pull (manifest, config and all layers).
///
/// **Rationale**: layers can be several GiB on slow links, so the bound is
/// generous. It still guarantees an unresponsive registry eventually fails.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Time between SIGTERM and SIGKILL when stopping a container.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Liveness poll interval while waiting for a container to exit.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Limits
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum tag length (Docker distribution grammar).
pub const MAX_TAG_LEN: usize = 128;

/// Maximum number of layers accepted in a manifest.
///
/// **Attack Vector**: thousands of tiny layers would overwhelm extraction.
pub const MAX_LAYERS: usize = 128;

/// Maximum size of a manifest or config blob read into memory (4 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum size of a single layer blob (512 MiB).
///
/// **Attack Vector**: a registry advertising or streaming a huge blob
/// would exhaust memory, since blobs are buffered before verification.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total bytes unpacked into one root filesystem (4 GiB).
///
/// **Attack Vector**: a small compressed layer can expand without bound
/// (decompression bomb). This bounds the extracted tree across all layers.
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Characters accepted anywhere in an image reference.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/:.-_@";

/// Bit of `CapEff` in `/proc/self/status` for `CAP_SYS_ADMIN`.
pub const CAP_SYS_ADMIN_BIT: u32 = 21;

// =============================================================================
// OCI / Docker Media Types
// =============================================================================
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/media-types.md>
// =============================================================================

/// OCI image manifest (single platform).
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index (multi-platform).
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image config.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Docker registry v2 manifest.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Docker manifest list (multi-platform).
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image config.
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Docker gzip-compressed layer.
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Docker uncompressed layer.
pub const DOCKER_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Annotation carrying the human-readable reference name of an index entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Contents of the `oci-layout` marker file.
pub const OCI_LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Returns true for media types naming a single-platform image manifest.
pub fn is_image_manifest(media_type: &str) -> bool {
    media_type == OCI_IMAGE_MANIFEST_MEDIA_TYPE || media_type == DOCKER_MANIFEST_MEDIA_TYPE
}

/// Returns true for media types naming a multi-platform index.
pub fn is_image_index(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
}
