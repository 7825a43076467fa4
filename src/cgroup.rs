//! # cgroup v2 Controller
//!
//! Every container gets one scope under a shared slice:
//!
//! ```text
//! <cgroup-root>/
//! ├── cgroup.subtree_control      +cpu +memory ...
//! └── container.slice/
//!     ├── cgroup.subtree_control  +cpu +memory ...
//!     └── <container-id>.scope/
//!         ├── memory.max
//!         └── cgroup.procs
//! ```
//!
//! A scope only exposes `memory.max` once `cpu` and `memory` are delegated
//! from the root down to the slice, so [`CgroupController::create`] enables
//! them on demand. Limits are an ordered list of [`Limit`] values, each of
//! which names one control file and the value written to it.

use crate::constants::CGROUP_SLICE;
use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONTROLLERS: &str = "cgroup.controllers";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";
const PROCS: &str = "cgroup.procs";

/// Controllers a scope needs before limits can be applied.
const REQUIRED_CONTROLLERS: [&str; 2] = ["cpu", "memory"];

/// One resource limit applied to a container scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Hard memory ceiling in bytes.
    MaxMemory(u64),
    /// Moves a process into the scope.
    ProcessId(u32),
}

impl Limit {
    /// Control file inside the scope this limit is written to.
    pub fn control_file(&self) -> &'static str {
        match self {
            Limit::MaxMemory(_) => "memory.max",
            Limit::ProcessId(_) => PROCS,
        }
    }

    /// Decimal value written to the control file.
    pub fn value(&self) -> String {
        match self {
            Limit::MaxMemory(bytes) => bytes.to_string(),
            Limit::ProcessId(pid) => pid.to_string(),
        }
    }
}

/// Manages container scopes under `<cgroup-root>/container.slice`.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
}

impl CgroupController {
    /// Controller for the cgroup v2 hierarchy mounted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn slice_path(&self) -> PathBuf {
        self.root.join(CGROUP_SLICE)
    }

    /// Scope directory of container `id`.
    pub fn scope_path(&self, id: &str) -> PathBuf {
        self.slice_path().join(format!("{id}.scope"))
    }

    /// Creates the scope for `id` and delegates `cpu`/`memory` to it.
    pub fn create(&self, id: &str) -> Result<PathBuf> {
        let scope = self.scope_path(id);
        match fs::metadata(&scope) {
            Ok(_) => debug!(scope = %scope.display(), "cgroup scope exists"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&scope).map_err(|e| Error::cgroup(&scope, e))?;
            }
            Err(e) => return Err(Error::cgroup(&scope, e)),
        }

        if !has_required(&scope.join(CONTROLLERS))? {
            info!(scope = %scope.display(), "delegating cpu and memory controllers");
            self.delegate()?;
        }

        info!(container = id, scope = %scope.display(), "created cgroup");
        Ok(scope)
    }

    /// Enables every available controller at the root and then at the slice.
    fn delegate(&self) -> Result<()> {
        let slice = self.slice_path();

        if !has_required(&self.root.join(SUBTREE_CONTROL))? {
            // A cgroup with processes of its own cannot delegate controllers.
            self.evacuate_root(&slice);
            enable_all(&self.root)?;
        }
        if !has_required(&slice.join(SUBTREE_CONTROL))? {
            enable_all(&slice)?;
        }
        Ok(())
    }

    fn evacuate_root(&self, slice: &Path) {
        let Ok(procs) = fs::read_to_string(self.root.join(PROCS)) else {
            return;
        };
        for pid in procs.split_whitespace() {
            if let Err(e) = append_line(&slice.join(PROCS), pid) {
                debug!(pid, error = %e, "cannot move process out of root cgroup");
            }
        }
    }

    /// Writes each limit in order.
    pub fn apply(&self, id: &str, limits: &[Limit]) -> Result<()> {
        let scope = self.scope_path(id);
        for limit in limits {
            let path = scope.join(limit.control_file());
            fs::write(&path, limit.value()).map_err(|e| Error::cgroup(&path, e))?;
            debug!(container = id, file = limit.control_file(), value = %limit.value(), "applied limit");
        }
        Ok(())
    }

    /// Removes the scope of `id`. A missing scope is not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        let scope = self.scope_path(id);
        match fs::remove_dir(&scope) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            // Only plain directory trees (not cgroupfs) still hold files.
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                fs::remove_dir_all(&scope).map_err(|e| Error::cgroup(&scope, e))?;
            }
            Err(e) => return Err(Error::cgroup(&scope, e)),
        }
        info!(container = id, "removed cgroup");
        Ok(())
    }
}

/// True if the whitespace-separated controller list at `path` names both
/// `cpu` and `memory` as whole tokens.
fn has_required(path: &Path) -> Result<bool> {
    let content = fs::read_to_string(path).map_err(|e| Error::cgroup(path, e))?;
    let tokens: Vec<&str> = content.split_whitespace().collect();
    Ok(REQUIRED_CONTROLLERS.iter().all(|c| tokens.contains(c)))
}

/// Writes `+<ctrl>` to `dir/cgroup.subtree_control` for every controller
/// listed in `dir/cgroup.controllers`.
fn enable_all(dir: &Path) -> Result<()> {
    let available = dir.join(CONTROLLERS);
    let content = fs::read_to_string(&available).map_err(|e| Error::cgroup(&available, e))?;
    let control = dir.join(SUBTREE_CONTROL);
    for controller in content.split_whitespace() {
        append_line(&control, &format!("+{controller}")).map_err(|e| Error::cgroup(&control, e))?;
        debug!(path = %control.display(), controller, "enabled controller");
    }
    Ok(())
}

/// Appends one value to a control file. cgroupfs treats every write as a
/// separate command, so appending is equivalent to writing there.
fn append_line(path: &Path, value: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(format!("{value}\n").as_bytes())
}

// =============================================================================
// Byte quantities
// =============================================================================

/// Parses a human-readable byte quantity such as `512m`, `1.5GiB` or `100`.
///
/// `k/m/g/t` (and `kb/mb/...`) are powers of 1000, `ki/mi/gi/ti` (and
/// `kib/mib/...`) are powers of 1024. A bare number or a `b` suffix is
/// bytes. Case is ignored.
pub fn parse_byte_quantity(input: &str) -> Result<u64> {
    let invalid = || Error::InvalidByteQuantity(input.to_string());

    let text = input.trim().to_ascii_lowercase();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let unit = unit.trim();

    if number.is_empty() {
        return Err(invalid());
    }

    let multiplier: u64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "m" | "mb" => 1000u64.pow(2),
        "g" | "gb" => 1000u64.pow(3),
        "t" | "tb" => 1000u64.pow(4),
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        _ => return Err(invalid()),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes.round() as u64)
}

/// Logs a cgroup removal failure instead of propagating it.
pub(crate) fn remove_quietly(controller: &CgroupController, id: &str) {
    if let Err(e) = controller.remove(id) {
        warn!(container = id, error = %e, "failed to remove cgroup");
    }
}
