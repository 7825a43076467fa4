//! # Engine Configuration
//!
//! Resolves where the engine keeps its state and which policies it runs
//! under. Configuration comes from three layers, later layers winning:
//!
//! | Source               | Example                       |
//! |----------------------|-------------------------------|
//! | Defaults             | root = current directory      |
//! | Environment          | `CASK_ROOT=/srv/cask`         |
//! | Command line         | `cask --root /srv/cask ps`    |
//!
//! Every on-disk path the engine touches is derived here, so tests can point
//! a whole engine at a temporary directory with [`EngineConfig::with_root`].

use crate::constants::{
    CGROUP_SLICE, CONTAINER_META_FILE, DEFAULT_CGROUP_ROOT, ENV_CGROUP_ROOT, ENV_ROOT,
    ENV_SANDBOX, ENV_STRICT, LAYER_CACHE_DIR, OVERLAY_UPPER_DIR, OVERLAY_WORK_DIR,
    REPOSITORY_DIR, RUNTIME_DIR, SANDBOX_DIR, TEMP_DIR,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

// =============================================================================
// Process Role
// =============================================================================

/// Which side of the re-exec boundary the current process is on.
///
/// Passed explicitly into the engine entry points and recorded on the
/// tracing span so every log line is attributable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Stage 1: resolves the image, builds the sandbox, supervises the child.
    Orchestrator,
    /// Stage 2: runs inside the new namespaces and execs the payload.
    Sandbox,
}

impl Role {
    /// Short tag used in log output.
    pub fn label(self) -> &'static str {
        match self {
            Role::Orchestrator => "main",
            Role::Sandbox => "cntr",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Strict/lenient switches for the engine's deliberate soft-fails.
///
/// The defaults are lenient: a missing layer blob counts as zero bytes in
/// listings and an unresolvable image user leaves the payload running as
/// the launching identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    /// Fail `image ls` when a layer size cannot be determined.
    pub strict_size_accounting: bool,
    /// Abort the container when the image user cannot be switched to.
    pub strict_user_switch: bool,
}

impl Policy {
    /// Both switches on.
    pub fn strict() -> Self {
        Self {
            strict_size_accounting: true,
            strict_user_switch: true,
        }
    }
}

// =============================================================================
// Sandbox Strategy
// =============================================================================

/// How the sandbox root filesystem is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxStrategy {
    /// Overlay when the capability check allows it, extraction otherwise.
    #[default]
    Auto,
    /// Always mount an overlay on top of the layer cache.
    Overlay,
    /// Always extract the image into a private directory.
    Extract,
}

impl FromStr for SandboxStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "overlay" => Ok(Self::Overlay),
            "extract" => Ok(Self::Extract),
            other => Err(format!("unknown sandbox strategy '{other}'")),
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory all `var/...` state lives under.
    pub root: PathBuf,
    /// cgroup v2 mount point.
    pub cgroup_root: PathBuf,
    /// Soft-fail policy.
    pub policy: Policy,
    /// Sandbox construction strategy.
    pub sandbox_strategy: SandboxStrategy,
}

impl EngineConfig {
    /// Configuration rooted at `root` with default cgroup root and policy.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            policy: Policy::default(),
            sandbox_strategy: SandboxStrategy::Auto,
        }
    }

    /// Builds the configuration from the environment.
    ///
    /// `root_override` (the `--root` flag) beats `CASK_ROOT`, which beats the
    /// current working directory. Unparseable values are logged and ignored.
    pub fn from_env(root_override: Option<PathBuf>) -> crate::Result<Self> {
        let root = match root_override.or_else(|| std::env::var_os(ENV_ROOT).map(PathBuf::from)) {
            Some(root) => std::path::absolute(root)?,
            None => std::env::current_dir()?,
        };

        let mut config = Self::with_root(root);

        if let Some(cgroup_root) = std::env::var_os(ENV_CGROUP_ROOT) {
            config.cgroup_root = PathBuf::from(cgroup_root);
        }

        if let Ok(value) = std::env::var(ENV_STRICT)
            && parse_flag(&value)
        {
            config.policy = Policy::strict();
        }

        if let Ok(value) = std::env::var(ENV_SANDBOX) {
            match value.parse() {
                Ok(strategy) => config.sandbox_strategy = strategy,
                Err(e) => warn!(variable = ENV_SANDBOX, "{e}, using auto"),
            }
        }

        Ok(config)
    }

    /// Sets the cgroup root.
    pub fn cgroup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroup_root = path.into();
        self
    }

    /// Sets the policy.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the sandbox strategy.
    pub fn sandbox_strategy(mut self, strategy: SandboxStrategy) -> Self {
        self.sandbox_strategy = strategy;
        self
    }

    // =========================================================================
    // Derived paths
    // =========================================================================

    pub fn repository_dir(&self) -> PathBuf {
        self.root.join(REPOSITORY_DIR)
    }

    pub fn layer_cache_dir(&self) -> PathBuf {
        self.root.join(LAYER_CACHE_DIR)
    }

    pub fn upper_dir(&self, id: &str) -> PathBuf {
        self.root.join(OVERLAY_UPPER_DIR).join(id)
    }

    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.root.join(OVERLAY_WORK_DIR).join(id)
    }

    pub fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.root.join(SANDBOX_DIR).join(id)
    }

    /// Parent of all sandbox roots, used by the overlay capability check.
    pub fn sandbox_base(&self) -> PathBuf {
        self.root.join(SANDBOX_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    /// Launch descriptor path for a container.
    pub fn launch_file(&self, id: &str) -> PathBuf {
        self.root.join(RUNTIME_DIR).join(format!("{id}.json"))
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(CONTAINER_META_FILE)
    }

    /// Slice directory holding every container scope.
    pub fn cgroup_slice(&self) -> PathBuf {
        self.cgroup_root.join(CGROUP_SLICE)
    }

    /// Root as a borrowed path.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_derived_from_root() {
        let config = EngineConfig::with_root("/srv/cask");
        assert_eq!(
            config.repository_dir(),
            PathBuf::from("/srv/cask/var/repositories")
        );
        assert_eq!(
            config.upper_dir("abc"),
            PathBuf::from("/srv/cask/var/overlay/upper/abc")
        );
        assert_eq!(
            config.launch_file("abc"),
            PathBuf::from("/srv/cask/var/runtime/abc.json")
        );
        assert_eq!(
            config.cgroup_slice(),
            PathBuf::from("/sys/fs/cgroup/container.slice")
        );
    }

    #[test]
    fn test_sandbox_strategy_parses_case_insensitively() {
        assert_eq!("Overlay".parse(), Ok(SandboxStrategy::Overlay));
        assert_eq!("extract".parse(), Ok(SandboxStrategy::Extract));
        assert!("tmpfs".parse::<SandboxStrategy>().is_err());
    }

    #[test]
    fn test_flags_accept_common_spellings() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_roles_have_log_labels() {
        assert_eq!(Role::Orchestrator.to_string(), "main");
        assert_eq!(Role::Sandbox.to_string(), "cntr");
    }
}
