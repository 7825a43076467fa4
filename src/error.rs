//! Error types for the container engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container launch failed before the payload was exec'd.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send signal to container '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    /// Launch descriptor resolved to an empty command.
    #[error("no command specified for image '{0}'")]
    NoCommand(String),

    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// No index entry carries the requested reference name.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// A multi-arch index has no variant for the host architecture.
    #[error("no matching image for platform {os}/{architecture}")]
    NoMatchingPlatform { os: String, architecture: String },

    /// Manifest media type the engine does not handle.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Manifest blob larger than `MAX_MANIFEST_SIZE`.
    #[error("manifest {digest} is too large ({size} bytes)")]
    ManifestTooLarge { digest: String, size: u64 },

    /// Blob or extracted tree over its size limit.
    #[error("{digest} is too large: {size} bytes exceeds limit of {limit}")]
    ImageTooLarge { digest: String, size: u64, limit: u64 },

    /// Image archive is malformed.
    #[error("invalid image archive {path}: {reason}")]
    InvalidArchive { path: PathBuf, reason: String },

    // =========================================================================
    // Layer Errors
    // =========================================================================
    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    /// A mount or unmount failed.
    #[error("mount of {target} failed: {source}")]
    MountFailed {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Sandbox could not be built.
    #[error("failed to build sandbox for '{id}': {reason}")]
    SandboxBuildFailed { id: String, reason: String },

    /// User named in the image config could not be resolved or switched to.
    #[error("cannot switch to user '{user}': {reason}")]
    UserSwitchFailed { user: String, reason: String },

    // =========================================================================
    // Cgroup Errors
    // =========================================================================
    /// Cgroup file operation failed.
    #[error("cgroup operation on {path} failed: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed human-readable byte quantity.
    #[error("invalid byte quantity '{0}'")]
    InvalidByteQuantity(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Blob content does not hash to its declared digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Digest string is not `sha256:<64 hex>`.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },
}

impl Error {
    /// Wraps an I/O error with the cgroup path it occurred on.
    pub(crate) fn cgroup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Cgroup {
            path: path.into(),
            source,
        }
    }

    /// Wraps an I/O error with the mount target it occurred on.
    pub(crate) fn mount(target: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::MountFailed {
            target: target.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_too_large_names_the_limit() {
        let err = Error::ImageTooLarge {
            digest: "sha256:ab".into(),
            size: 11,
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "sha256:ab is too large: 11 bytes exceeds limit of 10"
        );
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
