//! # Image References
//!
//! Parses user-supplied image names into a validated, immutable
//! [`ImageReference`] and renders the canonical name used as the
//! `org.opencontainers.image.ref.name` annotation in the local index.
//!
//! ## Normalization
//!
//! | Input                              | Canonical name                              |
//! |------------------------------------|---------------------------------------------|
//! | `alpine`                           | `docker.io/library/alpine:latest`           |
//! | `app:v1`                           | `docker.io/library/app:v1`                  |
//! | `bitnami/redis:7`                  | `docker.io/bitnami/redis:7`                 |
//! | `ghcr.io/org/tool`                 | `ghcr.io/org/tool:latest`                   |
//! | `localhost:5000/x@sha256:<hex>`    | `localhost:5000/x@sha256:<hex>`             |
//!
//! ## Security
//!
//! References are length-bounded by `MAX_IMAGE_REF_LEN` and restricted to
//! the `IMAGE_REF_VALID_CHARS` allowlist before any further parsing, so a
//! hostile name can never reach a registry URL or a filesystem path.

use crate::constants::{IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN, MAX_TAG_LEN};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Registry used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a reference names neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parses and validates a reference.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("empty reference"));
        }
        if input.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {MAX_IMAGE_REF_LEN} bytes")));
        }
        if !input.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
            return Err(invalid("contains invalid characters"));
        }

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (input, None),
        };

        // A ':' after the last '/' separates the tag; one before it is a
        // registry port.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], Some(&name[last_slash + i + 1..])),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        validate_repository(&repository).map_err(|r| invalid(&r))?;
        if let Some(tag) = tag {
            validate_tag(tag).map_err(|r| invalid(&r))?;
        }
        if let Some(digest) = digest {
            validate_digest(digest).map_err(|r| invalid(&r))?;
        }

        let tag = match (tag, digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest: digest.map(str::to_string),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `registry/repository` without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Canonical name stored as the ref-name annotation.
    ///
    /// A digest wins over a tag when both are present.
    pub fn canonical(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{}@{}", self.name(), digest),
            (None, Some(tag)) => format!("{}:{}", self.name(), tag),
            (None, None) => self.name(),
        }
    }

    /// Splits a stored canonical name into `(repository, tag)` for display.
    ///
    /// Digest references show the digest in the tag column.
    pub fn split_ref_name(ref_name: &str) -> (String, String) {
        if let Some((name, digest)) = ref_name.split_once('@') {
            return (name.to_string(), digest.to_string());
        }
        let last_slash = ref_name.rfind('/').map_or(0, |i| i + 1);
        match ref_name[last_slash..].rfind(':') {
            Some(i) => (
                ref_name[..last_slash + i].to_string(),
                ref_name[last_slash + i + 1..].to_string(),
            ),
            None => (ref_name.to_string(), String::new()),
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("empty repository".into());
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err("empty path component".into());
        }
        if !component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        {
            return Err(format!("repository component '{component}' must be lowercase"));
        }
        if !component.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(format!(
                "repository component '{component}' must start with a letter or digit"
            ));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return Err(format!("tag must be 1-{MAX_TAG_LEN} characters"));
    }
    if tag.starts_with(['.', '-']) {
        return Err("tag must not start with '.' or '-'".into());
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
    {
        return Err(format!("invalid tag '{tag}'"));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let Some((algo, hex)) = digest.split_once(':') else {
        return Err("digest must be algorithm:hex".into());
    };
    let expected_len = match algo {
        "sha256" => 64,
        "sha384" => 96,
        "sha512" => 128,
        _ => return Err(format!("unsupported digest algorithm '{algo}'")),
    };
    if hex.len() != expected_len
        || !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err("malformed digest hex".into());
    }
    Ok(())
}
