//! CodeBuild implementation of [`BuildBackend`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use conveyor_shared::aws::{ApiError, AwsJsonClient};
use conveyor_shared::{ConveyorError, Result};

use super::backend::{BuildBackend, EnvVar, PollState, ProjectSpec, RemoteBuildStatus, StartBuild};

const TARGET_PREFIX: &str = "CodeBuild_20161006";

/// Builds run by AWS CodeBuild.
#[derive(Debug, Clone)]
pub struct CodeBuildBackend {
    client: AwsJsonClient,
}

impl CodeBuildBackend {
    pub fn new(endpoint: Url) -> Result<Self> {
        Ok(Self {
            client: AwsJsonClient::new(endpoint, TARGET_PREFIX, Duration::from_secs(30))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WireEnvVar<'a> {
    name: &'a str,
    value: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> From<&'a EnvVar> for WireEnvVar<'a> {
    fn from(var: &'a EnvVar) -> Self {
        Self {
            name: &var.name,
            value: &var.value,
            kind: if var.secret {
                "SECRETS_MANAGER"
            } else {
                "PLAINTEXT"
            },
        }
    }
}

fn wire_env(env: &[EnvVar]) -> Vec<WireEnvVar<'_>> {
    env.iter().map(WireEnvVar::from).collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBuildRequest<'a> {
    project_name: &'a str,
    source_version: &'a str,
    environment_variables_override: Vec<WireEnvVar<'a>>,
}

#[derive(Deserialize)]
struct StartBuildResponse {
    build: WireBuild,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest<'a> {
    name: &'a str,
    source: WireSource<'a>,
    artifacts: WireArtifacts,
    environment: WireEnvironment<'a>,
    service_role: &'a str,
}

#[derive(Serialize)]
struct WireSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    location: &'a str,
    buildspec: &'a str,
}

#[derive(Serialize)]
struct WireArtifacts {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvironment<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    image: &'a str,
    compute_type: &'a str,
    privileged_mode: bool,
    environment_variables: Vec<WireEnvVar<'a>>,
}

#[derive(Serialize)]
struct BatchGetBuildsRequest<'a> {
    ids: [&'a str; 1],
}

#[derive(Deserialize)]
struct BatchGetBuildsResponse {
    #[serde(default)]
    builds: Vec<WireBuild>,
}

#[derive(Serialize)]
struct StopBuildRequest<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBuild {
    id: String,
    #[serde(default)]
    build_status: Option<String>,
    #[serde(default)]
    current_phase: Option<String>,
    #[serde(default)]
    logs: Option<WireLogs>,
    #[serde(default)]
    phases: Vec<WirePhase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLogs {
    group_name: Option<String>,
    stream_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePhase {
    #[serde(default)]
    phase_type: Option<String>,
    #[serde(default)]
    phase_status: Option<String>,
    #[serde(default)]
    contexts: Vec<WirePhaseContext>,
}

#[derive(Debug, Deserialize)]
struct WirePhaseContext {
    #[serde(default)]
    message: Option<String>,
}

impl WireBuild {
    fn poll_state(&self) -> PollState {
        match self.build_status.as_deref() {
            Some("SUCCEEDED") => PollState::Succeeded,
            Some("FAILED" | "FAULT" | "TIMED_OUT") => PollState::Failed,
            Some("STOPPED") => PollState::Stopped,
            _ if self.current_phase.as_deref() == Some("SUBMITTED") => PollState::Submitted,
            _ => PollState::Running,
        }
    }

    /// First failure message reported by a phase, or the raw status.
    fn failure_description(&self) -> Option<String> {
        let from_phase = self
            .phases
            .iter()
            .filter(|p| !matches!(p.phase_status.as_deref(), None | Some("SUCCEEDED")))
            .find_map(|p| {
                let message = p.contexts.iter().find_map(|c| c.message.clone())?;
                let phase = p.phase_type.as_deref().unwrap_or("UNKNOWN");
                Some(format!("{phase}: {message}"))
            });
        from_phase.or_else(|| self.build_status.as_ref().map(|s| format!("build {s}")))
    }

    fn into_status(self) -> RemoteBuildStatus {
        let state = self.poll_state();
        let description = match state {
            PollState::Failed | PollState::Stopped => self.failure_description(),
            _ => None,
        };
        let (log_group, log_stream) = match self.logs {
            Some(logs) => (logs.group_name, logs.stream_name),
            None => (None, None),
        };
        RemoteBuildStatus {
            state,
            log_group,
            log_stream,
            description,
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn backend_error(operation: &str, err: ApiError) -> ConveyorError {
    if err.is_throttling() {
        ConveyorError::Throttled(format!("{operation}: {err}"))
    } else {
        ConveyorError::Backend(format!("{operation}: {err}"))
    }
}

#[async_trait]
impl BuildBackend for CodeBuildBackend {
    async fn start_build(&self, req: &StartBuild) -> Result<String> {
        let body = StartBuildRequest {
            project_name: &req.project,
            source_version: &req.source_version,
            environment_variables_override: wire_env(&req.env),
        };
        match self
            .client
            .call::<_, StartBuildResponse>("StartBuild", &body)
            .await
        {
            Ok(resp) => Ok(resp.build.id),
            Err(e) if e.code() == Some("ResourceNotFoundException") => {
                Err(ConveyorError::ProjectNotFound {
                    project: req.project.clone(),
                })
            }
            Err(e) => Err(backend_error("StartBuild", e)),
        }
    }

    async fn create_project(&self, spec: &ProjectSpec) -> Result<()> {
        let body = CreateProjectRequest {
            name: &spec.name,
            source: WireSource {
                kind: "GITHUB",
                location: &spec.source_location,
                buildspec: &spec.buildspec,
            },
            artifacts: WireArtifacts {
                kind: "NO_ARTIFACTS",
            },
            environment: WireEnvironment {
                kind: "LINUX_CONTAINER",
                image: &spec.image,
                compute_type: &spec.compute_type,
                privileged_mode: true,
                environment_variables: wire_env(&spec.env),
            },
            service_role: &spec.service_role,
        };
        match self
            .client
            .call::<_, serde_json::Value>("CreateProject", &body)
            .await
        {
            Ok(_) => Ok(()),
            // Another worker created it first.
            Err(e) if e.code() == Some("ResourceAlreadyExistsException") => {
                debug!(project = %spec.name, "project already exists");
                Ok(())
            }
            Err(e) => Err(backend_error("CreateProject", e)),
        }
    }

    async fn get_build(&self, remote_id: &str) -> Result<RemoteBuildStatus> {
        let body = BatchGetBuildsRequest { ids: [remote_id] };
        let resp = self
            .client
            .call::<_, BatchGetBuildsResponse>("BatchGetBuilds", &body)
            .await
            .map_err(|e| backend_error("BatchGetBuilds", e))?;

        resp.builds
            .into_iter()
            .find(|b| b.id == remote_id)
            .map(WireBuild::into_status)
            .ok_or_else(|| ConveyorError::Backend(format!("BatchGetBuilds: build {remote_id} not found")))
    }

    async fn stop_build(&self, remote_id: &str) -> Result<()> {
        self.client
            .call::<_, serde_json::Value>("StopBuild", &StopBuildRequest { id: remote_id })
            .await
            .map(|_| ())
            .map_err(|e| backend_error("StopBuild", e))
    }
}
