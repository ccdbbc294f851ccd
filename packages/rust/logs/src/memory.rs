//! In-process log transport.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use conveyor_shared::{ConveyorError, Result};

use crate::transport::{EventPage, LogTransport, StreamName};

/// Log streams held in memory. Tokens are event offsets.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    streams: Mutex<HashMap<StreamName, Vec<Vec<u8>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes written to `name` so far, concatenated.
    pub fn contents(&self, name: &StreamName) -> Vec<u8> {
        self.lock().get(name).map(|e| e.concat()).unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamName, Vec<Vec<u8>>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LogTransport for MemoryTransport {
    async fn create_stream(&self, name: &StreamName) -> Result<()> {
        self.lock().entry(name.clone()).or_default();
        Ok(())
    }

    async fn put_events(&self, name: &StreamName, events: &[Vec<u8>]) -> Result<()> {
        self.lock()
            .entry(name.clone())
            .or_default()
            .extend(events.iter().cloned());
        Ok(())
    }

    async fn get_events(&self, name: &StreamName, token: Option<&str>) -> Result<EventPage> {
        let offset = match token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| ConveyorError::LogTransport(format!("invalid token '{t}'")))?,
            None => 0,
        };

        let streams = self.lock();
        let Some(events) = streams.get(name) else {
            return Ok(EventPage::default());
        };

        let start = offset.min(events.len());
        Ok(EventPage {
            events: events[start..].to_vec(),
            next_token: Some(events.len().to_string()),
        })
    }
}
