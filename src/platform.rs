//! Platform detection, mount table inspection and capability probing.
//!
//! Detects the host OS and architecture used to select a variant from a
//! multi-arch index, and answers the two questions the sandbox builder asks
//! before mounting an overlay: which filesystem backs a path, and whether
//! the process holds `CAP_SYS_ADMIN`.

use crate::constants::CAP_SYS_ADMIN_BIT;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

impl Os {
    /// OCI `os` string.
    pub fn as_oci(self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        }
    }
}

impl Arch {
    /// OCI `architecture` string.
    pub fn as_oci(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "unknown",
        }
    }
}

/// Host platform as used for manifest selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// OCI `os` value.
    pub os: String,
    /// OCI `architecture` value.
    pub architecture: String,
}

impl Platform {
    /// Creates a platform from explicit OCI strings.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    /// Detects the current platform.
    pub fn detect() -> Self {
        Self::new(detect_os().as_oci(), detect_arch().as_oci())
    }

    /// Returns the OCI platform string (e.g., "linux/amd64").
    pub fn oci_platform(&self) -> String {
        format!("{}/{}", self.os, self.architecture)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.oci_platform())
    }
}

fn detect_os() -> Os {
    #[cfg(target_os = "linux")]
    return Os::Linux;

    #[cfg(target_os = "macos")]
    return Os::Darwin;

    #[cfg(target_os = "windows")]
    return Os::Windows;

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return Os::Unknown;
}

fn detect_arch() -> Arch {
    #[cfg(target_arch = "x86_64")]
    return Arch::Amd64;

    #[cfg(target_arch = "aarch64")]
    return Arch::Arm64;

    #[cfg(target_arch = "arm")]
    return Arch::Arm;

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
    return Arch::Unknown;
}

// =============================================================================
// Mount Table
// =============================================================================

/// One line of `/proc/self/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fstype: String,
}

/// Snapshot of the live mount table.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Reads `/proc/self/mounts`.
    pub fn read() -> std::io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string("/proc/self/mounts")?))
    }

    /// Parses mount table text. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = fields.next()?;
                let mount_point = fields.next()?;
                let fstype = fields.next()?;
                Some(MountEntry {
                    source: unescape_mount_field(source),
                    mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                    fstype: fstype.to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The mount whose mount point is the longest prefix of `path`.
    ///
    /// Later entries win ties, matching how stacked mounts shadow earlier
    /// ones at the same point.
    pub fn containing(&self, path: &Path) -> Option<&MountEntry> {
        let mut best: Option<&MountEntry> = None;
        for entry in &self.entries {
            if !path.starts_with(&entry.mount_point) {
                continue;
            }
            let len = entry.mount_point.as_os_str().len();
            if best.is_none_or(|b| len >= b.mount_point.as_os_str().len()) {
                best = Some(entry);
            }
        }
        best
    }

    /// True if something is mounted exactly at `path`.
    pub fn is_mount_point(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.mount_point == path)
    }
}

/// Decodes the octal escapes (`\040` for space etc.) the kernel uses.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let digit = |k: usize| bytes[i + k] - b'0';
            out.push(digit(1) * 64 + digit(2) * 8 + digit(3));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// =============================================================================
// Capabilities
// =============================================================================

/// Extracts the `CapEff` mask from `/proc/<pid>/status` text.
pub fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

/// True if the effective capability mask contains `CAP_SYS_ADMIN`.
pub fn mask_has_sys_admin(mask: u64) -> bool {
    mask & (1u64 << CAP_SYS_ADMIN_BIT) != 0
}

/// Decides whether an overlay can be mounted under `path`.
///
/// Rejects a path that already lives on an overlay (nested overlays are
/// not supported by the kernel configuration the engine targets) and a
/// process without `CAP_SYS_ADMIN`.
pub fn overlay_supported(mounts: &MountTable, cap_eff: Option<u64>, path: &Path) -> bool {
    let backing = mounts.containing(path);
    if let Some(entry) = backing {
        debug!(
            path = %path.display(),
            mount_point = %entry.mount_point.display(),
            fstype = %entry.fstype,
            "sandbox backing filesystem"
        );
        if entry.fstype == "overlay" {
            return false;
        }
    }
    cap_eff.is_some_and(mask_has_sys_admin)
}
