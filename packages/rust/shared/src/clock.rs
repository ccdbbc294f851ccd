//! Injectable time and identifier sources.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::BuildId;

/// Source of wall-clock time for duration reporting.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Time elapsed since `start`, clamped at zero.
    fn since(&self, start: DateTime<Utc>) -> Duration {
        (self.now() - start).to_std().unwrap_or_default()
    }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of build identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> BuildId;
}

/// Time-sortable UUID v7 identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> BuildId {
        BuildId::new()
    }
}

/// Format a duration the way build summaries show it (`1m2s`, `850ms`).
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m{s}s"),
        _ => format!("{h}h{m}m{s}s"),
    }
}
