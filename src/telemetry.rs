use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::model::{TenantId, UnixTimeMs};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub queue_depth: u64,
    pub last_flush_at: Option<UnixTimeMs>,
    /// Items delivered by the last completed flush.
    pub last_flush_succeeded: u64,
    /// Items whose upload failed in the last completed flush.
    pub last_flush_failed: u64,
    /// Never decreases.
    pub permanent_failures: u64,
    pub evicted_total: u64,
    pub malformed_total: u64,
    pub flushing: bool,
}

/// Observational queue health. Depth is refreshed after every enqueue and
/// flush but is not transactionally tied to the store.
#[derive(Debug)]
pub struct QueueTelemetry {
    state: watch::Sender<TelemetrySnapshot>,
}

impl Default for QueueTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueTelemetry {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TelemetrySnapshot::default());
        Self { state }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.state.subscribe()
    }

    pub(crate) fn set_depth(&self, depth: u64) {
        self.state.send_if_modified(|s| {
            let changed = s.queue_depth != depth;
            s.queue_depth = depth;
            changed
        });
    }

    pub(crate) fn record_evicted(&self, count: u64) {
        if count > 0 {
            self.state.send_modify(|s| s.evicted_total += count);
        }
    }

    pub(crate) fn record_permanent_failures(&self, count: u64) {
        if count > 0 {
            self.state.send_modify(|s| s.permanent_failures += count);
        }
    }

    pub(crate) fn record_malformed(&self, count: u64) {
        if count > 0 {
            self.state.send_modify(|s| s.malformed_total += count);
        }
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.flushing != flushing;
            s.flushing = flushing;
            changed
        });
    }

    pub(crate) fn record_flush(&self, at: UnixTimeMs, succeeded: u64, failed: u64) {
        self.state.send_modify(|s| {
            s.last_flush_at = Some(at);
            s.last_flush_succeeded = succeeded;
            s.last_flush_failed = failed;
        });
    }
}

/// Periodic queue health report sent to the remote telemetry endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub organization_id: String,
    pub device_name: String,
    pub app_version: String,
    pub queue_depth: u64,
    pub last_flush_succeeded: u64,
    pub last_flush_failed: u64,
    pub permanent_failure_count: u64,
    pub timestamp_ms: u64,
}

impl TelemetryReport {
    pub fn from_snapshot(
        snapshot: &TelemetrySnapshot,
        organization: &TenantId,
        device_name: impl Into<String>,
        app_version: impl Into<String>,
        now: UnixTimeMs,
    ) -> Self {
        Self {
            organization_id: organization.as_str().to_string(),
            device_name: device_name.into(),
            app_version: app_version.into(),
            queue_depth: snapshot.queue_depth,
            last_flush_succeeded: snapshot.last_flush_succeeded,
            last_flush_failed: snapshot.last_flush_failed,
            permanent_failure_count: snapshot.permanent_failures,
            timestamp_ms: now.0,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
