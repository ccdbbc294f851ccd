//! Core domain types for Conveyor builds.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConveyorError, Result};

// ---------------------------------------------------------------------------
// BuildId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for build identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub Uuid);

impl BuildId {
    /// Generate a new time-sortable build identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BuildId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// BuildOptions
// ---------------------------------------------------------------------------

/// Everything that identifies one build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Unique identifier for this attempt.
    pub id: BuildId,
    /// GitHub repository in `owner/name` form.
    pub repository: String,
    /// Commit SHA to build.
    pub sha: String,
    /// Branch the commit was pushed to.
    pub branch: String,
    /// Skip pulling cached layers.
    #[serde(default)]
    pub no_cache: bool,
}

impl BuildOptions {
    /// Split the repository into `(owner, name)`.
    pub fn owner_and_name(&self) -> Result<(&str, &str)> {
        split_repository(&self.repository)
    }
}

/// Split an `owner/name` repository string.
pub fn split_repository(repository: &str) -> Result<(&str, &str)> {
    match repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(ConveyorError::validation(format!(
            "repository '{repository}' is not in owner/name form"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// A fully qualified container image reference produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Image(pub String);

impl Image {
    /// `<repository>:<tag>`.
    pub fn new(repository: &str, tag: &str) -> Self {
        Self(format!("{repository}:{tag}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_roundtrip() {
        let id = BuildId::new();
        let parsed: BuildId = id.to_string().parse().expect("parse BuildId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn repository_split() {
        assert_eq!(split_repository("remind101/acme-inc").unwrap(), ("remind101", "acme-inc"));
        assert!(split_repository("acme-inc").is_err());
        assert!(split_repository("/acme").is_err());
        assert!(split_repository("a/b/c").is_err());
    }

    #[test]
    fn options_deserialize_without_no_cache() {
        let json = format!(
            r#"{{"id":"{}","repository":"remind101/acme-inc","sha":"abc","branch":"master"}}"#,
            BuildId::new()
        );
        let opts: BuildOptions = serde_json::from_str(&json).expect("deserialize");
        assert!(!opts.no_cache);
        assert_eq!(opts.branch, "master");
    }

    #[test]
    fn image_formatting() {
        let image = Image::new("remind101/acme-inc", "abc123");
        assert_eq!(image.to_string(), "remind101/acme-inc:abc123");
    }
}
