//! # cask
//!
//! **Minimal OCI Container Engine**
//!
//! Pulls OCI images into a local content-addressed store, flattens their
//! layers into a shared cache, builds a root filesystem per container and
//! runs the payload in fresh mount, IPC, PID and UTS namespaces under a
//! cgroup v2 scope.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              cask CLI                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐    ┌───────────────────────────────────┐  │
//! │  │     Image Store      │◄───│         Remote Resolver           │  │
//! │  │  index.json + blobs  │    │  ManifestSource │ platform select │  │
//! │  │  tag │ save │ load   │    └───────────────────────────────────┘  │
//! │  └──────────┬───────────┘                                           │
//! │             │                                                       │
//! │  ┌──────────▼───────────┐    ┌───────────────────────────────────┐  │
//! │  │     Layer Cache      │───►│         Sandbox Builder           │  │
//! │  │  var/overlay/lower   │    │  overlay mount │ plain extraction │  │
//! │  └──────────────────────┘    └─────────────────┬─────────────────┘  │
//! │                                                │                    │
//! │  ┌─────────────────────────────────────────────▼─────────────────┐  │
//! │  │                     Execution Engine                          │  │
//! │  │  stage 1: metadata, cgroup, clone(2) │ stage 2: chroot, exec  │  │
//! │  └─────────────────────────────────────────────┬─────────────────┘  │
//! │                                                │                    │
//! │  ┌─────────────────────────────────────────────▼─────────────────┐  │
//! │  │                    Lifecycle Supervisor                       │  │
//! │  │  liveness │ ps │ stop (TERM, then KILL) │ rm                  │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌─────────┐  record   ┌─────────┐  clone   ┌─────────┐
//!   │ (none)  │ ────────► │  Exit   │ ───────► │ RUNNING │
//!   └─────────┘           └─────────┘          └────┬────┘
//!                                                   │ process gone
//!                                                   ▼
//!                         ┌─────────┐   rm     ┌─────────┐
//!                         │ removed │ ◄─────── │ Exited  │ (derived)
//!                         └─────────┘          └─────────┘
//! ```
//!
//! # On-disk Layout
//!
//! Everything lives under the engine root (the working directory unless
//! `--root` or `CASK_ROOT` says otherwise):
//!
//! | Path                       | Contents                              |
//! |----------------------------|---------------------------------------|
//! | `var/repositories`         | OCI image layout (index + blobs)      |
//! | `var/overlay/lower/<hex>`  | flattened image, one per manifest     |
//! | `var/overlay/upper/<id>`   | writable overlay layer                |
//! | `var/overlay/working/<id>` | overlay work directory                |
//! | `var/sandbox/<id>`         | container root filesystem             |
//! | `var/runtime/<id>.json`    | launch descriptor for stage 2         |
//! | `var/container.json`       | container records                     |
//!
//! # Security Properties
//!
//! - **Digest verification**: every blob is hashed before it is stored
//!   (see [`storage::BlobStore::put_blob`]).
//! - **Path traversal protection**: layer and archive entries with absolute
//!   paths or `..` components are rejected.
//! - **Bounded inputs**: manifest size, layer count and reference length
//!   are capped in [`constants`].
//! - **PID reuse**: a recorded pid only counts as the container while its
//!   argv[0] still matches (see [`lifecycle::is_alive`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use cask::{Engine, EngineConfig, Role, RunOptions};
//!
//! let engine = Engine::new(EngineConfig::from_env(None)?)?;
//! let outcome = engine
//!     .run(
//!         RunOptions {
//!             image: "alpine".into(),
//!             args: vec!["echo".into(), "hello".into()],
//!             tty: true,
//!             ..Default::default()
//!         },
//!         Role::Orchestrator,
//!     )
//!     .await?;
//! println!("exit code {}", outcome.exit_code);
//! ```

pub mod archive;
pub mod cgroup;
pub mod child;
pub mod config;
pub mod constants;
pub mod container;
pub mod error;
pub mod image;
pub mod layer;
pub mod lifecycle;
pub mod oci;
pub mod platform;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod storage;

pub use cgroup::{CgroupController, Limit, parse_byte_quantity};
pub use config::{EngineConfig, Policy, Role, SandboxStrategy};
pub use container::{ContainerMeta, MetadataStore, Status};
pub use error::{Error, Result};
pub use image::{Image, ImageStore, ImageSummary};
pub use layer::LayerCache;
pub use lifecycle::{BatchNotice, RemoveReport, StopReport, Termination};
pub use platform::Platform;
pub use reference::ImageReference;
pub use registry::{ManifestSource, RegistryClient, RemoteManifest};
pub use runtime::{Engine, LaunchConfig, RunOptions, RunOutcome, RunningContainer};
pub use sandbox::{Overlay, Sandbox, SandboxBuilder};
pub use storage::BlobStore;
