//! GitHub commit status API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use url::Url;

use conveyor_shared::{ConveyorError, Result};

use crate::status::{CommitStatus, StatusSink, StatusState};

/// User-Agent string for GitHub API requests.
const USER_AGENT: &str = concat!("Conveyor/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct StatusRequest<'a> {
    state: StatusState,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
    description: &'a str,
    context: &'a str,
}

/// Publishes commit statuses through the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubStatusClient {
    client: Client,
    api_base: Url,
    token: String,
    context: String,
}

impl GitHubStatusClient {
    pub fn new(api_base: Url, token: impl Into<String>, context: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConveyorError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base,
            token: token.into(),
            context: context.into(),
        })
    }

    fn statuses_url(&self, status: &CommitStatus) -> String {
        format!(
            "{}/repos/{}/{}/statuses/{}",
            self.api_base.as_str().trim_end_matches('/'),
            status.owner,
            status.repo,
            status.sha
        )
    }
}

#[async_trait]
impl StatusSink for GitHubStatusClient {
    async fn set_status(&self, status: &CommitStatus) -> Result<()> {
        let url = self.statuses_url(status);
        debug!(%url, state = %status.state, "setting commit status");

        let body = StatusRequest {
            state: status.state,
            target_url: status.target_url.as_deref(),
            description: &status.description,
            context: &self.context,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ConveyorError::Status(format!("{url}: {e}")))?;

        let code = response.status();
        if !code.is_success() {
            return Err(ConveyorError::Status(format!("{url}: HTTP {code}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn status(state: StatusState) -> CommitStatus {
        CommitStatus {
            owner: "remind101".into(),
            repo: "acme-inc".into(),
            sha: "abcdef".into(),
            state,
            description: "Image building.".into(),
            target_url: Some("https://conveyor.example.com/logs/1".into()),
        }
    }

    #[tokio::test]
    async fn posts_status_with_context_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/remind101/acme-inc/statuses/abcdef"))
            .and(header("Authorization", "Bearer s3cret"))
            .and(body_json(serde_json::json!({
                "state": "pending",
                "target_url": "https://conveyor.example.com/logs/1",
                "description": "Image building.",
                "context": "container/docker",
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = GitHubStatusClient::new(
            Url::parse(&server.uri()).unwrap(),
            "s3cret",
            "container/docker",
        )
        .unwrap();
        client.set_status(&status(StatusState::Pending)).await.unwrap();
    }

    #[tokio::test]
    async fn http_error_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let client =
            GitHubStatusClient::new(Url::parse(&server.uri()).unwrap(), "t", "ctx").unwrap();
        let err = client
            .set_status(&status(StatusState::Failure))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Status(_)));
    }
}
