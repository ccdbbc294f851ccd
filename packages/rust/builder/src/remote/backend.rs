//! The managed build service seam.

use async_trait::async_trait;

use conveyor_shared::Result;

/// Remote build progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }
}

/// One status observation of a remote build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBuildStatus {
    pub state: PollState,
    pub log_group: Option<String>,
    pub log_stream: Option<String>,
    /// Why the build failed, when the backend says.
    pub description: Option<String>,
}

impl RemoteBuildStatus {
    pub fn new(state: PollState) -> Self {
        Self {
            state,
            log_group: None,
            log_stream: None,
            description: None,
        }
    }

    pub fn with_logs(mut self, group: impl Into<String>, stream: impl Into<String>) -> Self {
        self.log_group = Some(group.into());
        self.log_stream = Some(stream.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An environment variable handed to the build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    /// `value` names a secret rather than holding the value itself.
    pub secret: bool,
}

impl EnvVar {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secret: true,
        }
    }
}

/// Request to start a build of an existing project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartBuild {
    pub project: String,
    pub source_version: String,
    pub env: Vec<EnvVar>,
}

/// Everything needed to create a build project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec {
    pub name: String,
    /// Clone URL of the source repository.
    pub source_location: String,
    pub buildspec: String,
    pub compute_type: String,
    pub image: String,
    pub service_role: String,
    pub env: Vec<EnvVar>,
}

/// A managed build service.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Start a build and return its remote ID.
    ///
    /// Fails with [`ConveyorError::ProjectNotFound`](conveyor_shared::ConveyorError::ProjectNotFound)
    /// when the project does not exist.
    async fn start_build(&self, req: &StartBuild) -> Result<String>;

    async fn create_project(&self, spec: &ProjectSpec) -> Result<()>;

    /// Fails with [`ConveyorError::Throttled`](conveyor_shared::ConveyorError::Throttled)
    /// when the service is rate limiting.
    async fn get_build(&self, remote_id: &str) -> Result<RemoteBuildStatus>;

    /// Ask the service to stop a build. Returns before it has stopped.
    async fn stop_build(&self, remote_id: &str) -> Result<()>;
}
