//! GitHub `push` webhook payloads.

use serde::Deserialize;

use conveyor_shared::{BuildId, BuildOptions, ConveyorError, Result};

const BRANCH_PREFIX: &str = "refs/heads/";

/// The parts of a GitHub push event Conveyor uses.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// SHA the ref points to after the push.
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    pub repository: PushRepository,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

impl PushEvent {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| ConveyorError::validation(format!("invalid push event: {e}")))
    }

    /// Branch name, or `None` for tag pushes.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix(BRANCH_PREFIX)
    }

    fn sha(&self) -> &str {
        self.head_commit
            .as_ref()
            .map(|c| c.id.as_str())
            .unwrap_or(&self.after)
    }

    /// Options for building this push, or `None` if it should not be built
    /// (branch deletions and tag pushes).
    pub fn build_options(&self, id: BuildId) -> Option<BuildOptions> {
        if self.deleted {
            return None;
        }
        let branch = self.branch()?;
        Some(BuildOptions {
            id,
            repository: self.repository.full_name.clone(),
            sha: self.sha().to_string(),
            branch: branch.to_string(),
            no_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH: &str = r#"{
        "ref": "refs/heads/feature/login",
        "before": "0000000000000000000000000000000000000000",
        "after": "827fecd2d36ebeaa2fd05aa8ef3eed1e56a8cd57",
        "deleted": false,
        "repository": {"id": 1, "full_name": "remind101/acme-inc"},
        "head_commit": {"id": "827fecd2d36ebeaa2fd05aa8ef3eed1e56a8cd57", "message": "Add login"}
    }"#;

    #[test]
    fn branch_push_builds() {
        let event = PushEvent::parse(PUSH.as_bytes()).unwrap();
        let id = BuildId::new();
        let opts = event.build_options(id.clone()).unwrap();
        assert_eq!(opts.id, id);
        assert_eq!(opts.repository, "remind101/acme-inc");
        assert_eq!(opts.branch, "feature/login");
        assert_eq!(opts.sha, "827fecd2d36ebeaa2fd05aa8ef3eed1e56a8cd57");
    }

    #[test]
    fn deleted_branch_is_skipped() {
        let json = r#"{"ref": "refs/heads/old", "after": "0000", "deleted": true,
                       "repository": {"full_name": "remind101/acme-inc"}, "head_commit": null}"#;
        let event = PushEvent::parse(json.as_bytes()).unwrap();
        assert!(event.build_options(BuildId::new()).is_none());
    }

    #[test]
    fn tag_push_is_skipped() {
        let json = r#"{"ref": "refs/tags/v1.0.0", "after": "abc",
                       "repository": {"full_name": "remind101/acme-inc"}}"#;
        let event = PushEvent::parse(json.as_bytes()).unwrap();
        assert_eq!(event.branch(), None);
        assert!(event.build_options(BuildId::new()).is_none());
    }

    #[test]
    fn malformed_payload_is_validation_error() {
        let err = PushEvent::parse(b"{}").unwrap_err();
        assert!(matches!(err, ConveyorError::Validation { .. }));
    }
}
