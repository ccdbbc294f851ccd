//! Minimal client for AWS JSON-protocol services (CodeBuild, CloudWatch Logs).
//!
//! Requests are plain `POST /` calls with an `X-Amz-Target` header naming the
//! operation. Conveyor sends them to a SigV4 signing proxy configured as the
//! endpoint, so no request signing happens here.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{ConveyorError, Result};

/// User-Agent string for outbound API requests.
const USER_AGENT: &str = concat!("Conveyor/", env!("CARGO_PKG_VERSION"));

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Error codes AWS services use to signal throttling.
const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "ThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
];

/// Failure of a single API call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The service answered with a typed error.
    #[error("{code}: {message}")]
    Service { code: String, message: String },
    /// The request never produced a usable response.
    #[error("{0}")]
    Transport(String),
}

impl ApiError {
    /// The service error code, without the `namespace#` prefix.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            Self::Transport(_) => None,
        }
    }

    pub fn is_throttling(&self) -> bool {
        self.code().is_some_and(|c| THROTTLING_CODES.contains(&c))
    }
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: Option<String>,
    #[serde(alias = "Message", default)]
    message: Option<String>,
}

/// JSON-protocol client bound to one service endpoint.
#[derive(Debug, Clone)]
pub struct AwsJsonClient {
    client: Client,
    endpoint: Url,
    target_prefix: String,
}

impl AwsJsonClient {
    /// Create a client for `endpoint`, prefixing operations with
    /// `target_prefix` (e.g. `CodeBuild_20161006`).
    pub fn new(endpoint: Url, target_prefix: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ConveyorError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            target_prefix: target_prefix.into(),
        })
    }

    /// Invoke `operation` with `body` and decode the JSON response.
    pub async fn call<Req, Resp>(
        &self,
        operation: &str,
        body: &Req,
    ) -> std::result::Result<Resp, ApiError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(body).map_err(|e| ApiError::Transport(format!("encode: {e}")))?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("X-Amz-Target", format!("{}.{operation}", self.target_prefix))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(payload)
            .send()
            .await
            .map_err(|e| ApiError::Transport(format!("{operation}: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(format!("{operation}: failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(decode_error(operation, status.as_u16(), &bytes));
        }

        // Some operations (StopBuild, PutLogEvents) may answer with an empty body.
        let bytes: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(bytes)
            .map_err(|e| ApiError::Transport(format!("{operation}: invalid response: {e}")))
    }
}

fn decode_error(operation: &str, status: u16, body: &[u8]) -> ApiError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody {
            kind: Some(kind),
            message,
        }) => {
            let code = kind.rsplit('#').next().unwrap_or(&kind).to_string();
            ApiError::Service {
                code,
                message: message.unwrap_or_default(),
            }
        }
        _ => ApiError::Transport(format!("{operation}: HTTP {status}")),
    }
}
