//! Container metadata and its flat-file store.
//!
//! Every container the engine has started is one record in a JSON array at
//! `<root>/var/container.json`. The file is rewritten whole on each change;
//! there is no locking, the last writer wins.

use crate::error::{Error, Result};
use crate::sandbox::Overlay;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Recorded state of a container.
///
/// `Exited` is never written by the engine. Listings derive it from a
/// failed liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Recorded, process not started yet.
    #[serde(rename = "Exit")]
    Created,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "Exited")]
    Exited,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "Exit",
            Status::Running => "RUNNING",
            Status::Exited => "Exited",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One container record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMeta {
    pub name: String,
    /// Process id of the stage-2 child, 0 before it is started.
    pub process_id: i32,
    pub container_id: String,
    /// Canonical image reference.
    pub image: String,
    /// argv[0] of the payload, checked against `/proc/<pid>/cmdline`.
    pub command: String,
    pub created: DateTime<Utc>,
    pub status: Status,
    #[serde(default)]
    pub ports: String,
    /// Root filesystem of the container.
    pub sandbox: PathBuf,
    #[serde(default)]
    pub overlay: Option<Overlay>,
}

impl ContainerMeta {
    /// True if `key` is this container's id or name.
    pub fn matches(&self, key: &str) -> bool {
        self.container_id == key || self.name == key
    }
}

/// The JSON array of [`ContainerMeta`] records.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records. A missing file is an empty list.
    pub fn list(&self) -> Result<Vec<ContainerMeta>> {
        match fs::read(&self.path) {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// The record whose id or name equals `key`.
    pub fn find(&self, key: &str) -> Result<Option<ContainerMeta>> {
        Ok(self.list()?.into_iter().find(|c| c.matches(key)))
    }

    pub fn append(&self, meta: &ContainerMeta) -> Result<()> {
        let mut records = self.list()?;
        records.push(meta.clone());
        self.write(&records)?;
        debug!(container = %meta.container_id, "appended container record");
        Ok(())
    }

    /// Replaces the record with the same container id. Unknown ids are
    /// ignored.
    pub fn update(&self, meta: &ContainerMeta) -> Result<()> {
        let mut records = self.list()?;
        if let Some(record) = records
            .iter_mut()
            .find(|c| c.container_id == meta.container_id)
        {
            *record = meta.clone();
            self.write(&records)?;
        }
        Ok(())
    }

    /// Drops the record with container id `id`.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut records = self.list()?;
        let before = records.len();
        records.retain(|c| c.container_id != id);
        if records.len() != before {
            self.write(&records)?;
            debug!(container = id, "removed container record");
        }
        Ok(())
    }

    fn write(&self, records: &[ContainerMeta]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}", uuid::Uuid::now_v7().simple()));
        fs::write(&tmp, serde_json::to_vec(records)?)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::Io(e)
        })
    }
}

// =============================================================================
// Names
// =============================================================================

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "keen", "lucid", "merry",
    "nimble", "proud", "quiet", "rapid", "sharp", "tidy", "vivid", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "badger", "heron", "lynx", "marten", "newt", "osprey", "panda", "quail",
    "raven", "salmon", "tapir", "urchin", "viper", "walrus", "yak", "zebra", "bison", "crane",
];

/// Generates a readable container name from the container id.
pub fn generate_name(container_id: &str) -> String {
    let seed = container_id
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
    let adjective = ADJECTIVES[(seed % ADJECTIVES.len() as u64) as usize];
    let noun = NOUNS[((seed / ADJECTIVES.len() as u64) % NOUNS.len() as u64) as usize];
    format!("{adjective}_{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&Status::Created).unwrap(), "\"Exit\"");
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"RUNNING\"");
        let status: Status = serde_json::from_str("\"Exited\"").unwrap();
        assert_eq!(status, Status::Exited);
    }

    #[test]
    fn test_generated_names_are_stable() {
        let a = generate_name("0190a1b2c3d4");
        assert_eq!(a, generate_name("0190a1b2c3d4"));
        assert!(a.contains('_'));
    }
}
