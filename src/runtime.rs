//! # Execution Engine
//!
//! Runs a container in two stages across a self re-exec:
//!
//! ```text
//! cask run IMAGE CMD                       (stage 1, Role::Orchestrator)
//!   ├── resolve image, build sandbox
//!   ├── write var/runtime/<id>.json        (LaunchConfig)
//!   ├── record metadata, create cgroup
//!   └── clone(NEWNS|NEWIPC|NEWPID|NEWUTS)
//!         └── execve(cask inner-container-run <sandbox> <launch-file>)
//!               └── child::run_in_sandbox  (stage 2, Role::Sandbox)
//!                     └── execve(CMD)
//! ```
//!
//! Stage 1 then moves the child into its cgroup, marks it running and blocks
//! until it exits. Stage 2 only ever reads the serialized [`LaunchConfig`];
//! it shares no memory with the orchestrator.

use crate::cgroup::{CgroupController, Limit, remove_quietly};
use crate::config::{EngineConfig, Role};
use crate::constants::REEXEC_COMMAND;
use crate::container::{ContainerMeta, MetadataStore, Status, generate_name};
use crate::error::{Error, Result};
use crate::image::{Image, ImageStore};
use crate::layer::LayerCache;
use crate::oci::ContainerConfig;
use crate::platform::Platform;
use crate::reference::ImageReference;
use crate::registry::{self, ManifestSource, RegistryClient};
use crate::sandbox::SandboxBuilder;
use serde::{Deserialize, Serialize};
use std::ffi::{CString, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

/// Stack handed to `clone(2)` for the child before it execs.
const CLONE_STACK_SIZE: usize = 1024 * 1024;

/// `PATH` used when the image does not define one.
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Launch Descriptor
// =============================================================================

/// Everything stage 2 needs to start the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    /// argv of the payload; never empty.
    pub command: Vec<String>,
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub hostname: String,
    /// Abort instead of warning when `user` cannot be switched to.
    #[serde(default)]
    pub strict_user: bool,
}

impl LaunchConfig {
    /// Resolves the launch descriptor from the image defaults.
    ///
    /// Explicit `args` replace the entrypoint. Without args the image
    /// entrypoint is used, and `Cmd` when there is no entrypoint.
    pub fn resolve(
        image: &str,
        config: &ContainerConfig,
        args: &[String],
        hostname: &str,
        strict_user: bool,
    ) -> Result<Self> {
        let non_empty = |v: &Option<Vec<String>>| v.clone().filter(|v| !v.is_empty());

        let command = if !args.is_empty() {
            args.to_vec()
        } else if let Some(entrypoint) = non_empty(&config.entrypoint) {
            entrypoint
        } else if let Some(cmd) = non_empty(&config.cmd) {
            cmd
        } else {
            return Err(Error::NoCommand(image.to_string()));
        };

        let mut env = config.env.clone().unwrap_or_default();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(DEFAULT_PATH.to_string());
        }

        Ok(Self {
            command,
            env,
            working_dir: config.working_dir.clone().filter(|d| !d.is_empty()),
            user: config.user.clone().filter(|u| !u.is_empty()),
            hostname: hostname.to_string(),
            strict_user,
        })
    }

    /// Program name recorded in metadata and matched by liveness checks.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Writes the descriptor readable by the owner only.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&serde_json::to_vec(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

/// Removes the launch descriptor when the run is over, however it ends.
struct LaunchFile(PathBuf);

impl Drop for LaunchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.0.display(), error = %e, "failed to remove launch file");
        }
    }
}

// =============================================================================
// Run Options
// =============================================================================

/// Parameters of `cask run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: String,
    /// Overrides the image entrypoint when non-empty.
    pub args: Vec<String>,
    pub name: Option<String>,
    pub interactive: bool,
    pub tty: bool,
    pub detach: bool,
    /// Remove metadata and sandbox once the container exits.
    pub remove: bool,
    /// Memory ceiling in bytes.
    pub memory: Option<u64>,
}

/// Where the child's standard streams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StdioPlan {
    stdin: bool,
    output: bool,
    foreground: bool,
}

impl StdioPlan {
    fn for_options(options: &RunOptions) -> Self {
        if options.detach {
            return Self {
                stdin: false,
                output: false,
                foreground: false,
            };
        }
        let attached = options.tty || options.interactive;
        // SAFETY: isatty only inspects the descriptor.
        let on_tty = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
        Self {
            stdin: options.interactive,
            output: attached,
            foreground: options.interactive && options.tty && on_tty,
        }
    }
}

/// How a container run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub container_id: String,
    pub name: String,
    /// Exit status of the payload, `128 + signal` when it was killed.
    pub exit_code: i32,
}

// =============================================================================
// Engine
// =============================================================================

/// The container engine: image store, layer cache, sandboxes, cgroups and
/// container metadata under one root.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) images: ImageStore,
    pub(crate) cache: LayerCache,
    pub(crate) builder: SandboxBuilder,
    pub(crate) cgroups: CgroupController,
    pub(crate) metadata: MetadataStore,
    source: Arc<dyn ManifestSource>,
    platform: Platform,
}

impl Engine {
    /// Opens the engine with anonymous HTTPS registry access.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_source(config, Arc::new(RegistryClient::new()))
    }

    /// Opens the engine with a custom manifest source.
    pub fn with_source(config: EngineConfig, source: Arc<dyn ManifestSource>) -> Result<Self> {
        let images = ImageStore::open(config.repository_dir(), config.policy)?;
        let cache = LayerCache::new(
            config.layer_cache_dir(),
            config.temp_dir(),
            images.blobs().clone(),
        )?;
        let builder = SandboxBuilder::new(config.clone(), cache.clone());
        let cgroups = CgroupController::new(config.cgroup_root.clone());
        let metadata = MetadataStore::new(config.metadata_file());

        Ok(Self {
            config,
            images,
            cache,
            builder,
            cgroups,
            metadata,
            source,
            platform: Platform::detect(),
        })
    }

    /// Overrides the platform used to select from multi-arch indexes.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn layer_cache(&self) -> &LayerCache {
        &self.cache
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn cgroups(&self) -> &CgroupController {
        &self.cgroups
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Pulls `reference`, replacing any local entry of the same name.
    pub async fn pull(&self, reference: &ImageReference) -> Result<Image> {
        registry::pull(self.source.as_ref(), &self.images, reference, &self.platform).await
    }

    /// Local image for `reference`, pulled when absent.
    pub async fn get_image(&self, reference: &ImageReference) -> Result<Image> {
        registry::get_image(self.source.as_ref(), &self.images, reference, &self.platform).await
    }

    /// Runs a container to completion.
    pub async fn run(&self, options: RunOptions, role: Role) -> Result<RunOutcome> {
        self.start(options, role).await?.wait().await
    }

    /// Stage 1 up to the point where the child is running.
    pub async fn start(&self, options: RunOptions, role: Role) -> Result<RunningContainer> {
        let span = info_span!("container", role = %role);
        self.start_inner(options).instrument(span).await
    }

    async fn start_inner(&self, options: RunOptions) -> Result<RunningContainer> {
        let reference = ImageReference::parse(&options.image)?;
        let image = self.get_image(&reference).await?;

        let container_id = uuid::Uuid::now_v7().simple().to_string();
        let name = match &options.name {
            Some(name) => {
                if self.metadata.find(name)?.is_some() {
                    return Err(Error::StartFailed {
                        id: container_id,
                        reason: format!("container name '{name}' is already in use"),
                    });
                }
                name.clone()
            }
            None => generate_name(&container_id),
        };

        let launch = LaunchConfig::resolve(
            &reference.canonical(),
            &image.config.container_config(),
            &options.args,
            &container_id[..12],
            self.config.policy.strict_user_switch,
        )?;

        let sandbox = self.builder.build(&image, &container_id)?;

        let mut meta = ContainerMeta {
            name,
            process_id: 0,
            container_id: container_id.clone(),
            image: reference.canonical(),
            command: launch.program().to_string(),
            created: chrono::Utc::now(),
            status: Status::Created,
            ports: String::new(),
            sandbox: sandbox.root.clone(),
            overlay: sandbox.overlay.clone(),
        };

        let stdio = StdioPlan::for_options(&options);
        let launch_file = match self.launch(&options, &launch, &mut meta, stdio) {
            Ok(launch_file) => launch_file,
            Err(e) => {
                warn!(container = %container_id, error = %e, "start failed, rolling back");
                if let Err(cleanup) =
                    crate::lifecycle::discard(&self.metadata, &self.cgroups, &meta)
                {
                    warn!(container = %container_id, error = %cleanup, "rollback incomplete");
                }
                return Err(e);
            }
        };

        info!(
            container = %container_id,
            name = %meta.name,
            pid = meta.process_id,
            image = %meta.image,
            "container started"
        );

        Ok(RunningContainer {
            meta,
            remove: options.remove,
            foreground: stdio.foreground,
            metadata: self.metadata.clone(),
            cgroups: self.cgroups.clone(),
            _launch_file: launch_file,
        })
    }

    /// Records the container, confines it and spawns the child.
    ///
    /// On error the caller discards the record, sandbox and cgroup; a child
    /// that was already spawned is killed here.
    fn launch(
        &self,
        options: &RunOptions,
        launch: &LaunchConfig,
        meta: &mut ContainerMeta,
        stdio: StdioPlan,
    ) -> Result<LaunchFile> {
        let container_id = meta.container_id.clone();

        let launch_path = self.config.launch_file(&container_id);
        launch.write(&launch_path)?;
        let launch_file = LaunchFile(launch_path);

        self.metadata.append(meta)?;

        self.cgroups.create(&container_id)?;
        if let Some(bytes) = options.memory {
            info!(container = %container_id, memory = bytes, "applying memory limit");
            self.cgroups.apply(&container_id, &[Limit::MaxMemory(bytes)])?;
        }

        let pid = spawn_reexec(&meta.sandbox, &launch_file.0, stdio).map_err(|e| {
            Error::StartFailed {
                id: container_id.clone(),
                reason: e.to_string(),
            }
        })?;

        let registered = self
            .cgroups
            .apply(&container_id, &[Limit::ProcessId(pid as u32)])
            .and_then(|()| {
                meta.process_id = pid;
                meta.status = Status::Running;
                self.metadata.update(meta)
            });
        if let Err(e) = registered {
            kill_child(pid);
            return Err(e);
        }

        Ok(launch_file)
    }
}

/// A started container the orchestrator is still responsible for.
pub struct RunningContainer {
    meta: ContainerMeta,
    remove: bool,
    foreground: bool,
    metadata: MetadataStore,
    cgroups: CgroupController,
    _launch_file: LaunchFile,
}

impl RunningContainer {
    pub fn id(&self) -> &str {
        &self.meta.container_id
    }

    pub fn meta(&self) -> &ContainerMeta {
        &self.meta
    }

    /// Blocks until the child exits, then releases the container's
    /// resources. A non-zero exit is a normal outcome, not an error.
    pub async fn wait(self) -> Result<RunOutcome> {
        let span = info_span!("container", role = %Role::Orchestrator);
        self.wait_inner().instrument(span).await
    }

    async fn wait_inner(self) -> Result<RunOutcome> {
        let pid = self.meta.process_id;
        let exit_code = tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))??;

        if self.foreground {
            reclaim_terminal();
        }

        info!(container = %self.meta.container_id, exit_code, "container exited");
        remove_quietly(&self.cgroups, &self.meta.container_id);

        if self.remove {
            crate::lifecycle::discard(&self.metadata, &self.cgroups, &self.meta)?;
        }

        Ok(RunOutcome {
            container_id: self.meta.container_id.clone(),
            name: self.meta.name.clone(),
            exit_code,
        })
    }
}

// =============================================================================
// Re-exec spawn
// =============================================================================

/// Arguments of the cloned child. Everything is prepared before `clone(2)`
/// so the child only makes async-signal-safe calls.
struct CloneArgs {
    program: CString,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    null_fd: libc::c_int,
    stdio: StdioPlan,
}

extern "C" fn child_main(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: `arg` points at the parent's CloneArgs, duplicated into this
    // address space by clone(2) and valid until exec or exit.
    let args = unsafe { &*(arg as *const CloneArgs) };

    // SAFETY: plain syscalls on descriptors and pointers owned by `args`.
    unsafe {
        libc::setpgid(0, 0);

        if !args.stdio.stdin {
            libc::dup2(args.null_fd, libc::STDIN_FILENO);
        }
        if !args.stdio.output {
            libc::dup2(args.null_fd, libc::STDOUT_FILENO);
            libc::dup2(args.null_fd, libc::STDERR_FILENO);
        }

        if args.stdio.foreground {
            libc::signal(libc::SIGTTOU, libc::SIG_IGN);
            libc::tcsetpgrp(libc::STDIN_FILENO, libc::getpgrp());
            libc::signal(libc::SIGTTOU, libc::SIG_DFL);
        }

        libc::execve(args.program.as_ptr(), args.argv.as_ptr(), args.envp.as_ptr());
        libc::_exit(127)
    }
}

fn cstring(bytes: Vec<u8>) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Clones a child into new mount, IPC, PID and UTS namespaces that
/// re-executes this binary as stage 2.
fn spawn_reexec(sandbox: &Path, launch_file: &Path, stdio: StdioPlan) -> io::Result<i32> {
    let exe = std::env::current_exe()?;

    let argv_owned = [
        exe.clone().into_os_string(),
        OsString::from(REEXEC_COMMAND),
        sandbox.as_os_str().to_owned(),
        launch_file.as_os_str().to_owned(),
    ]
    .into_iter()
    .map(|a| cstring(a.into_vec()))
    .collect::<io::Result<Vec<_>>>()?;

    let env_owned = std::env::vars_os()
        .map(|(k, v)| {
            let mut entry = k.into_vec();
            entry.push(b'=');
            entry.extend(v.into_vec());
            cstring(entry)
        })
        .collect::<io::Result<Vec<_>>>()?;

    let null = File::options().read(true).write(true).open("/dev/null")?;

    let terminated = |owned: &[CString]| {
        owned
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect::<Vec<_>>()
    };

    let mut args = CloneArgs {
        program: cstring(exe.into_os_string().into_vec())?,
        argv: terminated(&argv_owned),
        envp: terminated(&env_owned),
        null_fd: null.as_raw_fd(),
        stdio,
    };

    let mut stack = vec![0u8; CLONE_STACK_SIZE];
    // SAFETY: one past the end of the allocation, rounded down to the ABI
    // stack alignment.
    let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
    let top = ((top as usize) & !0xf) as *mut libc::c_void;

    let flags = libc::CLONE_NEWNS
        | libc::CLONE_NEWIPC
        | libc::CLONE_NEWPID
        | libc::CLONE_NEWUTS
        | libc::SIGCHLD;

    // SAFETY: the child runs on `stack` with its own copy of `args`,
    // `argv_owned` and `env_owned`, and only execs or exits.
    let pid = unsafe {
        libc::clone(
            child_main,
            top,
            flags,
            (&mut args as *mut CloneArgs).cast(),
        )
    };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    debug!(pid, sandbox = %sandbox.display(), "cloned stage-2 child");
    Ok(pid)
}

/// Waits for `pid`; returns its exit status or `128 + signal`.
/// Kills a child that never became a registered container and reaps it.
fn kill_child(pid: i32) {
    // SAFETY: signalling the process group the child leads.
    if unsafe { libc::kill(-pid, libc::SIGKILL) } != 0 {
        warn!(pid, error = %io::Error::last_os_error(), "failed to kill child");
    }
    if let Err(e) = wait_for_exit(pid) {
        warn!(pid, error = %e, "failed to reap child");
    }
}

fn wait_for_exit(pid: i32) -> Result<i32> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waitpid writes only to `status`.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(0)
    }
}

/// Makes the orchestrator's process group the terminal's foreground again.
fn reclaim_terminal() {
    // SAFETY: signal disposition and tcsetpgrp on our own terminal.
    unsafe {
        let previous = libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        if libc::tcsetpgrp(libc::STDIN_FILENO, libc::getpgrp()) != 0 {
            debug!(error = %io::Error::last_os_error(), "cannot reclaim terminal");
        }
        libc::signal(libc::SIGTTOU, previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(entrypoint: &[&str], cmd: &[&str]) -> ContainerConfig {
        let owned = |v: &[&str]| Some(v.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        ContainerConfig {
            entrypoint: owned(entrypoint),
            cmd: owned(cmd),
            env: Some(vec!["PATH=/bin".to_string(), "A=1".to_string()]),
            working_dir: Some("/srv".to_string()),
            user: Some(String::new()),
        }
    }

    #[test]
    fn test_args_override_entrypoint() {
        let args = vec!["echo".to_string(), "hi".to_string()];
        let launch =
            LaunchConfig::resolve("img", &config(&["/init"], &["serve"]), &args, "h", false)
                .unwrap();
        assert_eq!(launch.command, args);
        assert_eq!(launch.working_dir.as_deref(), Some("/srv"));
        assert_eq!(launch.user, None);
    }

    #[test]
    fn test_entrypoint_then_cmd() {
        let launch =
            LaunchConfig::resolve("img", &config(&["/init"], &["serve"]), &[], "h", false).unwrap();
        assert_eq!(launch.command, vec!["/init"]);

        let launch = LaunchConfig::resolve("img", &config(&[], &["sh"]), &[], "h", false).unwrap();
        assert_eq!(launch.command, vec!["sh"]);
        assert_eq!(launch.program(), "sh");

        let err = LaunchConfig::resolve("img", &config(&[], &[]), &[], "h", false).unwrap_err();
        assert!(matches!(err, Error::NoCommand(_)));
    }

    #[test]
    fn test_default_path_added() {
        let launch = LaunchConfig::resolve(
            "img",
            &ContainerConfig::default(),
            &["true".to_string()],
            "h",
            true,
        )
        .unwrap();
        assert_eq!(launch.env, vec![DEFAULT_PATH.to_string()]);
        assert!(launch.strict_user);
    }

    #[test]
    fn test_detach_forces_null_stdio() {
        let plan = StdioPlan::for_options(&RunOptions {
            interactive: true,
            tty: true,
            detach: true,
            ..Default::default()
        });
        assert!(!plan.stdin && !plan.output && !plan.foreground);

        let plan = StdioPlan::for_options(&RunOptions {
            tty: true,
            ..Default::default()
        });
        assert!(!plan.stdin && plan.output);
    }

    #[test]
    fn test_launch_file_roundtrip_and_mode() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("runtime/abc.json");
        let launch = LaunchConfig::resolve(
            "img",
            &ContainerConfig::default(),
            &["true".to_string()],
            "abc",
            false,
        )
        .unwrap();
        launch.write(&path).unwrap();
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(LaunchConfig::read(&path).unwrap(), launch);

        drop(LaunchFile(path.clone()));
        assert!(!path.exists());
    }
}
