//! # Sandbox Builder
//!
//! Produces the root filesystem a container is chrooted into.
//!
//! ## Strategies
//!
//! | Strategy  | Root                          | Cost per container          |
//! |-----------|-------------------------------|-----------------------------|
//! | Overlay   | overlay mount on the cache    | two empty directories       |
//! | Extract   | private copy of every layer   | full extraction             |
//!
//! With [`SandboxStrategy::Auto`] the overlay is used when
//! [`SandboxBuilder::can_use_overlay`] says the host allows it: the sandbox
//! directory must not itself live on an overlay, and the process must hold
//! `CAP_SYS_ADMIN`.
//!
//! ## Ownership
//!
//! A [`Sandbox`] and its [`Overlay`] belong to exactly one container. The
//! lower directory is shared through the [`LayerCache`] and never written.

use crate::config::{EngineConfig, SandboxStrategy};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layer::LayerCache;
use crate::platform::{MountTable, mask_has_sys_admin, overlay_supported, parse_cap_eff};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Overlay
// =============================================================================

/// A live copy-on-write mount owned by one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub working: PathBuf,
    pub upper: PathBuf,
    pub mount_point: PathBuf,
}

impl Overlay {
    /// Unmounts the overlay and discards its writable layer.
    ///
    /// The mount point is only unmounted if the live mount table lists it,
    /// so a record left behind after a manual unmount is still cleaned up.
    pub fn teardown(&self, mounts: &MountTable) -> Result<()> {
        if mounts.is_mount_point(&self.mount_point) {
            unmount(&self.mount_point)?;
            debug!(mount_point = %self.mount_point.display(), "unmounted overlay");
        }
        remove_dir_if_present(&self.upper)?;
        remove_dir_if_present(&self.working)?;
        Ok(())
    }
}

/// A container root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub root: PathBuf,
    pub overlay: Option<Overlay>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builds sandboxes under the engine root.
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    config: EngineConfig,
    cache: LayerCache,
}

impl SandboxBuilder {
    pub fn new(config: EngineConfig, cache: LayerCache) -> Self {
        Self { config, cache }
    }

    /// Probes whether an overlay can be mounted under the sandbox directory.
    pub fn can_use_overlay(&self) -> bool {
        let base = self.config.sandbox_base();
        if let Err(e) = fs::create_dir_all(&base) {
            warn!(path = %base.display(), error = %e, "cannot create sandbox directory");
            return false;
        }
        let base = fs::canonicalize(&base).unwrap_or(base);

        let mounts = match MountTable::read() {
            Ok(mounts) => mounts,
            Err(e) => {
                warn!(error = %e, "cannot read mount table");
                return false;
            }
        };
        let cap_eff = fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|s| parse_cap_eff(&s));
        let usable = overlay_supported(&mounts, cap_eff, &base);
        debug!(
            usable,
            cap_sys_admin = cap_eff.is_some_and(mask_has_sys_admin),
            "overlay capability"
        );
        usable
    }

    /// Builds the sandbox for container `id`.
    pub fn build(&self, image: &Image, id: &str) -> Result<Sandbox> {
        let use_overlay = match self.config.sandbox_strategy {
            SandboxStrategy::Overlay => true,
            SandboxStrategy::Extract => false,
            SandboxStrategy::Auto => self.can_use_overlay(),
        };

        let sandbox = if use_overlay {
            self.build_overlay(image, id)?
        } else {
            self.build_extracted(image, id)?
        };
        info!(
            container = id,
            root = %sandbox.root.display(),
            overlay = sandbox.overlay.is_some(),
            "sandbox ready"
        );
        Ok(sandbox)
    }

    fn build_overlay(&self, image: &Image, id: &str) -> Result<Sandbox> {
        let lower = self.cache.materialize(image)?;
        let overlay = Overlay {
            working: self.config.work_dir(id),
            upper: self.config.upper_dir(id),
            mount_point: self.config.sandbox_dir(id),
        };

        let result = (|| -> Result<()> {
            fs::create_dir_all(&overlay.upper)?;
            fs::create_dir_all(&overlay.working)?;
            fs::create_dir_all(&overlay.mount_point)?;
            mount_overlay(&lower, &overlay)
        })();

        if let Err(e) = result {
            let _ = remove_dir_if_present(&overlay.upper);
            let _ = remove_dir_if_present(&overlay.working);
            let _ = remove_dir_if_present(&overlay.mount_point);
            return Err(e);
        }

        Ok(Sandbox {
            root: overlay.mount_point.clone(),
            overlay: Some(overlay),
        })
    }

    fn build_extracted(&self, image: &Image, id: &str) -> Result<Sandbox> {
        let root = self.config.sandbox_dir(id);
        if root.exists() {
            return Err(Error::SandboxBuildFailed {
                id: id.to_string(),
                reason: format!("{} already exists", root.display()),
            });
        }
        if let Err(e) = self.cache.extract_into(image, &root) {
            let _ = fs::remove_dir_all(&root);
            return Err(e);
        }
        Ok(Sandbox {
            root,
            overlay: None,
        })
    }
}

// =============================================================================
// Mount helpers
// =============================================================================

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::mount(path, io::Error::new(io::ErrorKind::InvalidInput, e)))
}

/// Overlay option values may not contain the separators the kernel parses.
fn overlay_option_path(path: &Path) -> Result<String> {
    let text = path.to_str().unwrap_or_default();
    if text.is_empty() || text.contains([',', ':']) {
        return Err(Error::mount(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "unsupported characters in path"),
        ));
    }
    Ok(text.to_string())
}

fn mount_overlay(lower: &Path, overlay: &Overlay) -> Result<()> {
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        overlay_option_path(lower)?,
        overlay_option_path(&overlay.upper)?,
        overlay_option_path(&overlay.working)?
    );
    let source = c"overlay";
    let fstype = c"overlay";
    let target = cstring(&overlay.mount_point)?;
    let data = CString::new(options).map_err(|e| {
        Error::mount(
            &overlay.mount_point,
            io::Error::new(io::ErrorKind::InvalidInput, e),
        )
    })?;

    // SAFETY: all pointers are valid NUL-terminated strings for the call.
    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            data.as_ptr().cast(),
        )
    };
    if rc != 0 {
        return Err(Error::mount(&overlay.mount_point, io::Error::last_os_error()));
    }
    debug!(mount_point = %overlay.mount_point.display(), "mounted overlay");
    Ok(())
}

fn unmount(target: &Path) -> Result<()> {
    let c_target = cstring(target)?;
    // SAFETY: c_target is a valid NUL-terminated path.
    if unsafe { libc::umount2(c_target.as_ptr(), 0) } != 0 {
        return Err(Error::mount(target, io::Error::last_os_error()));
    }
    Ok(())
}

/// Recursively removes `path`; a missing path is not an error.
pub(crate) fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}
