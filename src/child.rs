//! Stage 2: inside the new namespaces.
//!
//! Entered through `cask inner-container-run <sandbox> <launch-file>`. Sets
//! up the hostname, name resolution files and the pseudo filesystems of
//! the sandbox, changes root into it, switches user and execs the payload.
//! Nothing here returns on success.

use crate::config::Role;
use crate::error::{Error, Result};
use crate::runtime::LaunchConfig;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, info_span, warn};

const HOSTS_TEMPLATE: &str = "\
127.0.0.1\tlocalhost
::1\tlocalhost ip6-localhost ip6-loopback
fe00::0\tip6-localnet
ff00::0\tip6-mcastprefix
ff02::1\tip6-allnodes
ff02::2\tip6-allrouters
";

/// Prepares the sandbox and replaces the process with the payload.
pub fn run_in_sandbox(role: Role, sandbox: &Path, launch_file: &Path) -> Result<Infallible> {
    let _span = info_span!("container", role = %role).entered();

    let launch = LaunchConfig::read(launch_file)?;
    info!(
        pid = std::process::id(),
        hostname = %launch.hostname,
        command = ?launch.command,
        "entering sandbox"
    );

    set_hostname(&launch.hostname)?;
    write_network_files(sandbox, &launch.hostname)?;
    mount_filesystems(sandbox)?;

    std::os::unix::fs::chroot(sandbox)?;
    std::env::set_current_dir("/")?;

    if let Some(user) = &launch.user {
        switch_user(user, launch.strict_user)?;
    }

    let working_dir = launch.working_dir.as_deref().unwrap_or("/");
    std::env::set_current_dir(working_dir)?;

    exec(&launch)
}

fn set_hostname(hostname: &str) -> Result<()> {
    // SAFETY: the pointer and length describe `hostname`'s bytes.
    if unsafe { libc::sethostname(hostname.as_ptr().cast(), hostname.len()) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn write_network_files(sandbox: &Path, hostname: &str) -> Result<()> {
    let etc = sandbox_dir(sandbox, "etc")?;
    write_sandbox_file(
        &etc.join("hosts"),
        format!("{HOSTS_TEMPLATE}127.0.1.1\t{hostname}\n").as_bytes(),
    )?;

    match fs::read("/etc/resolv.conf") {
        Ok(content) => write_sandbox_file(&etc.join("resolv.conf"), &content)?,
        Err(e) => warn!(error = %e, "host has no readable /etc/resolv.conf"),
    }
    Ok(())
}

// Everything below runs before `chroot`, so a symlink shipped in the image
// would resolve against the host root. Such links are replaced, never
// followed.

/// Removes `path` if it is a symlink.
fn unlink_symlink(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            warn!(path = %path.display(), "replacing symlink in sandbox");
            fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Ensures `sandbox/<name>` is a real directory.
fn sandbox_dir(sandbox: &Path, name: &str) -> Result<PathBuf> {
    let dir = sandbox.join(name);
    unlink_symlink(&dir)?;
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Writes a regular file, refusing to follow a symlink at `path`.
fn write_sandbox_file(path: &Path, contents: &[u8]) -> Result<()> {
    unlink_symlink(path)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

fn mount(
    source: &str,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
) -> Result<()> {
    let c = |s: &str| CString::new(s).map_err(|e| Error::mount(target, io::Error::other(e)));
    let source = c(source)?;
    let fstype = fstype.map(c).transpose()?;
    let c_target = CString::new(target.as_os_str().as_bytes())
        .map_err(|e| Error::mount(target, io::Error::other(e)))?;

    // SAFETY: all strings are NUL-terminated and outlive the call.
    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            c_target.as_ptr(),
            fstype.as_ref().map_or(std::ptr::null(), |f| f.as_ptr()),
            flags,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(Error::mount(target, io::Error::last_os_error()));
    }
    Ok(())
}

fn mount_filesystems(sandbox: &Path) -> Result<()> {
    // Keep the mounts below from propagating back to the host namespace.
    mount("none", Path::new("/"), None, libc::MS_REC | libc::MS_PRIVATE)?;

    let pseudo = [
        ("proc", "proc", "proc"),
        ("dev", "dev", "devtmpfs"),
        ("sys", "sys", "sysfs"),
    ];
    for (source, dir, fstype) in pseudo {
        let target = sandbox_dir(sandbox, dir)?;
        mount(source, &target, Some(fstype), 0)?;
        debug!(target = %target.display(), fstype, "mounted");
    }
    Ok(())
}

// =============================================================================
// User switching
// =============================================================================

/// Numeric identity resolved from an image `User` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Resolves `user[:group]` against passwd and group file contents.
///
/// Either part may be a name or a number. A numeric user missing from
/// `passwd` keeps gid 0 unless a group is given.
pub fn resolve_identity(spec: &str, passwd: &str, group: &str) -> Option<Identity> {
    let (user, group_part) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let entries = || {
        passwd
            .lines()
            .map(|l| l.split(':').collect::<Vec<_>>())
            .filter(|f| f.len() >= 4)
    };

    let (uid, primary_gid): (u32, u32) = match entries().find(|f| f[0] == user) {
        Some(f) => (f[2].parse().ok()?, f[3].parse().ok()?),
        None => {
            let uid: u32 = user.parse().ok()?;
            let gid = entries()
                .find(|f| f[2].parse::<u32>().ok() == Some(uid))
                .and_then(|f| f[3].parse().ok())
                .unwrap_or(0);
            (uid, gid)
        }
    };

    let gid: u32 = match group_part {
        None | Some("") => primary_gid,
        Some(name) => match group
            .lines()
            .map(|l| l.split(':').collect::<Vec<_>>())
            .find(|f| f.len() >= 3 && f[0] == name)
        {
            Some(f) => f[2].parse().ok()?,
            None => name.parse().ok()?,
        },
    };

    Some(Identity { uid, gid })
}

fn switch_user(spec: &str, strict: bool) -> Result<()> {
    let passwd = fs::read_to_string("/etc/passwd").unwrap_or_default();
    let group = fs::read_to_string("/etc/group").unwrap_or_default();

    let fail = |reason: String| -> Result<()> {
        if strict {
            Err(Error::UserSwitchFailed {
                user: spec.to_string(),
                reason,
            })
        } else {
            warn!(user = spec, %reason, "running as current user");
            Ok(())
        }
    };

    let Some(identity) = resolve_identity(spec, &passwd, &group) else {
        return fail("unknown user".to_string());
    };

    // SAFETY: setgroups reads one gid; setgid/setuid take plain integers.
    unsafe {
        if libc::setgroups(1, &identity.gid) != 0 {
            debug!(error = %io::Error::last_os_error(), "setgroups failed");
        }
        if libc::setgid(identity.gid) != 0 {
            return fail(format!("setgid: {}", io::Error::last_os_error()));
        }
        if libc::setuid(identity.uid) != 0 {
            return fail(format!("setuid: {}", io::Error::last_os_error()));
        }
    }
    debug!(uid = identity.uid, gid = identity.gid, "switched user");
    Ok(())
}

/// Replaces the process with the payload. `PATH` from the launch
/// environment is used to look up a bare program name.
fn exec(launch: &LaunchConfig) -> Result<Infallible> {
    let Some((program, args)) = launch.command.split_first() else {
        return Err(Error::NoCommand(launch.hostname.clone()));
    };

    let mut command = Command::new(program);
    command.arg0(program).args(args).env_clear();
    for entry in &launch.env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }

    let err = command.exec();
    Err(Error::StartFailed {
        id: launch.hostname.clone(),
        reason: format!("exec {program}: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/sh
nobody:x:65534:65534:nobody:/:/sbin/nologin
app:x:1000:1001::/home/app:/bin/sh
";
    const GROUP: &str = "\
root:x:0:
staff:x:50:app
app:x:1001:
";

    fn host_file(dir: &tempfile::TempDir) -> PathBuf {
        let host = dir.path().join("host");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("hosts"), "host entries\n").unwrap();
        host
    }

    #[test]
    fn test_network_files_replace_symlinked_hosts() {
        let dir = tempfile::TempDir::new().unwrap();
        let host = host_file(&dir);
        let sandbox = dir.path().join("sandbox");
        fs::create_dir_all(sandbox.join("etc")).unwrap();
        std::os::unix::fs::symlink(host.join("hosts"), sandbox.join("etc/hosts")).unwrap();

        write_network_files(&sandbox, "0123456789ab").unwrap();

        assert_eq!(fs::read_to_string(host.join("hosts")).unwrap(), "host entries\n");
        let meta = fs::symlink_metadata(sandbox.join("etc/hosts")).unwrap();
        assert!(meta.file_type().is_file());
        let hosts = fs::read_to_string(sandbox.join("etc/hosts")).unwrap();
        assert!(hosts.ends_with("127.0.1.1\t0123456789ab\n"));
    }

    #[test]
    fn test_network_files_replace_symlinked_etc() {
        let dir = tempfile::TempDir::new().unwrap();
        let host = host_file(&dir);
        let sandbox = dir.path().join("sandbox");
        fs::create_dir_all(&sandbox).unwrap();
        std::os::unix::fs::symlink(&host, sandbox.join("etc")).unwrap();

        write_network_files(&sandbox, "0123456789ab").unwrap();

        assert_eq!(fs::read_to_string(host.join("hosts")).unwrap(), "host entries\n");
        assert!(!host.join("resolv.conf").exists());
        assert!(fs::symlink_metadata(sandbox.join("etc")).unwrap().is_dir());
        assert!(sandbox.join("etc/hosts").is_file());
    }

    #[test]
    fn test_sandbox_dir_keeps_real_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        fs::write(dir.path().join("proc/marker"), "").unwrap();

        let proc_dir = sandbox_dir(dir.path(), "proc").unwrap();
        assert!(proc_dir.join("marker").exists());
    }

    #[test]
    fn test_resolve_by_name() {
        assert_eq!(
            resolve_identity("app", PASSWD, GROUP),
            Some(Identity { uid: 1000, gid: 1001 })
        );
        assert_eq!(
            resolve_identity("app:staff", PASSWD, GROUP),
            Some(Identity { uid: 1000, gid: 50 })
        );
    }

    #[test]
    fn test_resolve_numeric() {
        assert_eq!(
            resolve_identity("65534", PASSWD, GROUP),
            Some(Identity { uid: 65534, gid: 65534 })
        );
        assert_eq!(
            resolve_identity("4242:7", PASSWD, GROUP),
            Some(Identity { uid: 4242, gid: 7 })
        );
    }

    #[test]
    fn test_resolve_unknown() {
        assert_eq!(resolve_identity("ghost", PASSWD, GROUP), None);
        assert_eq!(resolve_identity("app:ghosts", PASSWD, GROUP), None);
    }
}
