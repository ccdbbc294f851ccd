//! CloudWatch Logs transport.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use conveyor_shared::aws::{ApiError, AwsJsonClient};
use conveyor_shared::{ConveyorError, Result};

use crate::transport::{EventPage, LogTransport, StreamName};

const TARGET_PREFIX: &str = "Logs_20140328";

/// Log streams stored in CloudWatch Logs.
///
/// Events are stored as UTF-8 messages; non-UTF-8 bytes are replaced.
#[derive(Debug, Clone)]
pub struct CloudWatchTransport {
    client: AwsJsonClient,
}

impl CloudWatchTransport {
    pub fn new(endpoint: Url) -> Result<Self> {
        Ok(Self {
            client: AwsJsonClient::new(endpoint, TARGET_PREFIX, Duration::from_secs(30))?,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStream<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEvents<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: Vec<InputLogEvent>,
}

#[derive(Serialize)]
struct InputLogEvent {
    timestamp: i64,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetLogEvents<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    start_from_head: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetLogEventsResponse {
    #[serde(default)]
    events: Vec<OutputLogEvent>,
    next_forward_token: Option<String>,
}

#[derive(Deserialize)]
struct OutputLogEvent {
    #[serde(default)]
    message: String,
}

fn transport_error(name: &StreamName, err: ApiError) -> ConveyorError {
    ConveyorError::LogTransport(format!("{name}: {err}"))
}

#[async_trait]
impl LogTransport for CloudWatchTransport {
    async fn create_stream(&self, name: &StreamName) -> Result<()> {
        let req = CreateLogStream {
            log_group_name: &name.group,
            log_stream_name: &name.stream,
        };
        match self
            .client
            .call::<_, serde_json::Value>("CreateLogStream", &req)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("ResourceAlreadyExistsException") => {
                debug!(stream = %name, "log stream already exists");
                Ok(())
            }
            Err(e) => Err(transport_error(name, e)),
        }
    }

    async fn put_events(&self, name: &StreamName, events: &[Vec<u8>]) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let log_events = events
            .iter()
            .map(|e| InputLogEvent {
                timestamp,
                message: String::from_utf8_lossy(e).into_owned(),
            })
            .collect();
        let req = PutLogEvents {
            log_group_name: &name.group,
            log_stream_name: &name.stream,
            log_events,
        };
        self.client
            .call::<_, serde_json::Value>("PutLogEvents", &req)
            .await
            .map(|_| ())
            .map_err(|e| transport_error(name, e))
    }

    async fn get_events(&self, name: &StreamName, token: Option<&str>) -> Result<EventPage> {
        let req = GetLogEvents {
            log_group_name: &name.group,
            log_stream_name: &name.stream,
            start_from_head: true,
            next_token: token,
        };
        match self
            .client
            .call::<_, GetLogEventsResponse>("GetLogEvents", &req)
            .await
        {
            Ok(resp) => Ok(EventPage {
                events: resp
                    .events
                    .into_iter()
                    .map(|e| e.message.into_bytes())
                    .collect(),
                next_token: resp.next_forward_token,
            }),
            // Remote builds report their stream before the first line lands.
            Err(e) if e.code() == Some("ResourceNotFoundException") => Ok(EventPage::default()),
            Err(e) => Err(transport_error(name, e)),
        }
    }
}
