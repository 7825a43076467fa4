//! # Lifecycle Supervisor
//!
//! Liveness checks, listing, stopping and removing containers recorded in
//! the metadata store.
//!
//! ## Liveness
//!
//! A recorded pid is only trusted while it still runs the recorded program:
//!
//! 1. the pid is positive
//! 2. `kill(pid, 0)` succeeds, or fails with `EPERM`
//! 3. `/proc/<pid>/stat` does not report a zombie
//! 4. argv[0] in `/proc/<pid>/cmdline` equals the recorded command, either
//!    exactly or by base name
//!
//! The last check keeps a recycled pid from being mistaken for the
//! container.
//!
//! ## Stopping
//!
//! ```text
//! SIGTERM ──► poll every 500ms ──► gone      => Termination::Graceful
//!        └──► 5s grace elapsed  ──► SIGKILL to the process group
//!                                            => Termination::Forced
//! ```

use crate::cgroup::{CgroupController, remove_quietly};
use crate::constants::{LIVENESS_POLL_INTERVAL, STOP_GRACE_PERIOD};
use crate::container::{ContainerMeta, MetadataStore, Status};
use crate::error::{Error, Result};
use crate::platform::MountTable;
use crate::runtime::Engine;
use crate::sandbox::remove_dir_if_present;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// =============================================================================
// Liveness
// =============================================================================

/// True while the container's recorded process is running.
pub fn is_alive(meta: &ContainerMeta) -> bool {
    process_matches(meta.process_id, &meta.command)
}

/// True if `pid` is a live, non-zombie process whose argv[0] is `command`.
pub fn process_matches(pid: i32, command: &str) -> bool {
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 only performs the existence and permission check.
    if unsafe { libc::kill(pid, 0) } != 0
        && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM)
    {
        return false;
    }

    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) if is_zombie(&stat) => return false,
        Ok(_) => {}
        Err(_) => return false,
    }

    let Ok(cmdline) = fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
    command_matches(&String::from_utf8_lossy(argv0), command)
}

/// Process state from `/proc/<pid>/stat`, which follows the parenthesized
/// command name.
fn is_zombie(stat: &str) -> bool {
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

fn command_matches(argv0: &str, command: &str) -> bool {
    if argv0.is_empty() || command.is_empty() {
        return false;
    }
    argv0 == command || Path::new(argv0).file_name() == Path::new(command).file_name()
}

// =============================================================================
// Termination
// =============================================================================

/// How a container was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Killed with SIGKILL after the grace period.
    Forced,
}

fn send_signal(pid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Sends SIGTERM and escalates to SIGKILL on the process group when the
/// process outlives `grace`.
pub async fn terminate(
    meta: &ContainerMeta,
    grace: Duration,
    poll: Duration,
) -> Result<Termination> {
    let pid = meta.process_id;
    if pid <= 0 {
        return Err(Error::SignalFailed {
            id: meta.container_id.clone(),
            reason: format!("invalid pid {pid}"),
        });
    }

    match send_signal(pid, libc::SIGTERM) {
        Ok(()) => debug!(container = %meta.container_id, pid, "sent SIGTERM"),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(Termination::Graceful),
        Err(e) => {
            return Err(Error::SignalFailed {
                id: meta.container_id.clone(),
                reason: e.to_string(),
            });
        }
    }

    let watched = meta.clone();
    let mut watcher = tokio::spawn(async move {
        while is_alive(&watched) {
            tokio::time::sleep(poll).await;
        }
    });

    tokio::select! {
        _ = &mut watcher => {
            info!(container = %meta.container_id, "container stopped");
            Ok(Termination::Graceful)
        }
        _ = tokio::time::sleep(grace) => {
            watcher.abort();
            warn!(
                container = %meta.container_id,
                grace_secs = grace.as_secs_f64(),
                "grace period elapsed, killing process group"
            );
            let killed = send_signal(-pid, libc::SIGKILL).or_else(|e| {
                if e.raw_os_error() == Some(libc::ESRCH) {
                    send_signal(pid, libc::SIGKILL)
                } else {
                    Err(e)
                }
            });
            match killed {
                Ok(()) => Ok(Termination::Forced),
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(Termination::Forced),
                Err(e) => Err(Error::SignalFailed {
                    id: meta.container_id.clone(),
                    reason: e.to_string(),
                }),
            }
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Why a batch operation stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchNotice {
    NoSuchContainer(String),
    StillRunning(String),
}

impl fmt::Display for BatchNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchNotice::NoSuchContainer(name) => write!(f, "No such container: {name}"),
            BatchNotice::StillRunning(name) => {
                write!(f, "Container {name} is running, please stop it first")
            }
        }
    }
}

/// Result of `stop`.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Name as given, and how it stopped.
    pub stopped: Vec<(String, Termination)>,
    pub not_found: Vec<String>,
    /// Known containers that were not running.
    pub not_running: Vec<String>,
    /// Names whose termination failed, with the error.
    pub failed: Vec<(String, Error)>,
}

/// Result of `remove`.
#[derive(Debug, Default)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    /// Set when the batch was cut short.
    pub notice: Option<BatchNotice>,
}

// =============================================================================
// Engine operations
// =============================================================================

impl Engine {
    /// All containers, with `Exited` derived for dead processes.
    pub fn list_containers(&self) -> Result<Vec<ContainerMeta>> {
        let mut records = self.metadata.list()?;
        for record in &mut records {
            if !is_alive(record) {
                record.status = Status::Exited;
            }
        }
        Ok(records)
    }

    /// Stops the named containers concurrently.
    pub async fn stop(&self, names: &[String]) -> Result<StopReport> {
        self.stop_with(names, STOP_GRACE_PERIOD, LIVENESS_POLL_INTERVAL)
            .await
    }

    /// [`Engine::stop`] with explicit timings.
    pub async fn stop_with(
        &self,
        names: &[String],
        grace: Duration,
        poll: Duration,
    ) -> Result<StopReport> {
        let records = self.metadata.list()?;
        let mut report = StopReport::default();
        let mut tasks = JoinSet::new();

        for name in names {
            let Some(meta) = records.iter().find(|c| c.matches(name)) else {
                report.not_found.push(name.clone());
                continue;
            };
            if !is_alive(meta) {
                report.not_running.push(name.clone());
                continue;
            }
            let meta = meta.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let result = terminate(&meta, grace, poll).await;
                (name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, result) = joined.map_err(|e| Error::Io(io::Error::other(e)))?;
            match result {
                Ok(termination) => report.stopped.push((name, termination)),
                Err(e) => report.failed.push((name, e)),
            }
        }
        Ok(report)
    }

    /// Removes the named containers in order.
    ///
    /// The batch stops at the first unknown or running container, which is
    /// left untouched and reported through [`RemoveReport::notice`].
    pub fn remove(&self, names: &[String]) -> Result<RemoveReport> {
        let mut report = RemoveReport::default();
        let records = self.metadata.list()?;

        for name in names {
            let Some(meta) = records.iter().find(|c| c.matches(name)) else {
                report.notice = Some(BatchNotice::NoSuchContainer(name.clone()));
                break;
            };
            if is_alive(meta) {
                report.notice = Some(BatchNotice::StillRunning(name.clone()));
                break;
            }
            discard(&self.metadata, &self.cgroups, meta)?;
            report.removed.push(name.clone());
        }
        Ok(report)
    }
}

/// Deletes a dead container's record, overlay, sandbox and cgroup.
pub(crate) fn discard(
    metadata: &MetadataStore,
    cgroups: &CgroupController,
    meta: &ContainerMeta,
) -> Result<()> {
    metadata.remove(&meta.container_id)?;

    if let Some(overlay) = &meta.overlay {
        let mounts = MountTable::read()?;
        overlay.teardown(&mounts)?;
    }
    if !meta.sandbox.as_os_str().is_empty() {
        remove_dir_if_present(&meta.sandbox)?;
    }
    remove_quietly(cgroups, &meta.container_id);

    info!(container = %meta.container_id, name = %meta.name, "removed container");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zombie_state_parsing() {
        assert!(is_zombie("1234 (sleep) Z 1 1234 1234 0"));
        assert!(!is_zombie("1234 (sleep) S 1 1234 1234 0"));
        // Command names may contain spaces and parentheses.
        assert!(is_zombie("1234 (a) b (c)) Z 1"));
        assert!(!is_zombie("garbage"));
    }

    #[test]
    fn test_command_matching() {
        assert!(command_matches("sleep", "sleep"));
        assert!(command_matches("/bin/sleep", "sleep"));
        assert!(command_matches("sleep", "/usr/bin/sleep"));
        assert!(!command_matches("/bin/sh", "sleep"));
        assert!(!command_matches("", "sleep"));
    }

    #[test]
    fn test_notices_render_console_text() {
        assert_eq!(
            BatchNotice::NoSuchContainer("web".into()).to_string(),
            "No such container: web"
        );
        assert_eq!(
            BatchNotice::StillRunning("web".into()).to_string(),
            "Container web is running, please stop it first"
        );
    }

    #[test]
    fn test_current_process_is_alive() {
        let pid = std::process::id() as i32;
        let cmdline = fs::read(format!("/proc/{pid}/cmdline")).unwrap();
        let argv0 = String::from_utf8_lossy(cmdline.split(|b| *b == 0).next().unwrap()).into_owned();
        assert!(process_matches(pid, &argv0));
        assert!(!process_matches(pid, "definitely-not-this-binary"));
        assert!(!process_matches(0, &argv0));
    }
}
