use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::event::TagRead;
use crate::model::{CorrelationKey, Destination};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UploadErrorKind {
    Network,
    Timeout,
    /// 5xx or an unreadable response.
    Server,
    /// The endpoint refused the batch (4xx).
    Rejected,
    Offline,
}

impl fmt::Display for UploadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadErrorKind::Network => "network",
            UploadErrorKind::Timeout => "timeout",
            UploadErrorKind::Server => "server",
            UploadErrorKind::Rejected => "rejected",
            UploadErrorKind::Offline => "offline",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct UploadError {
    pub kind: UploadErrorKind,
    pub message: String,
}

impl UploadError {
    /// Messages end up in the queue row's `last_error`, so they are bounded.
    pub const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self { kind, message }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::Timeout, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            UploadErrorKind::Server,
            format!("HTTP {status}: {}", message.into()),
        )
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            UploadErrorKind::Rejected,
            format!("HTTP {status}: {}", message.into()),
        )
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Acknowledgement of a delivered batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct UploadAck {
    pub accepted: usize,
}

/// One upload call's worth of events, all sharing a correlation key.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadBatch {
    pub correlation_key: CorrelationKey,
    pub events: Vec<TagRead>,
}

#[derive(Serialize)]
struct BatchInsertBody<'a> {
    organization_id: &'a str,
    session_id: Option<&'a str>,
    scans: Vec<ScanRecord<'a>>,
}

#[derive(Serialize)]
struct ScanRecord<'a> {
    id: String,
    rfid_tag: &'a str,
    rssi: i16,
    timestamp_ms: u64,
    location_id: Option<&'a str>,
    processed: bool,
    metadata: &'a BTreeMap<String, String>,
}

impl UploadBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The JSON body expected by the batch-insert endpoint.
    pub fn to_request_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        let body = BatchInsertBody {
            organization_id: self.correlation_key.tenant_id.as_str(),
            session_id: self.correlation_key.session_id.as_ref().map(|s| s.as_str()),
            scans: self
                .events
                .iter()
                .map(|event| ScanRecord {
                    id: event.id.to_string(),
                    rfid_tag: &event.tag_id,
                    rssi: event.rssi,
                    timestamp_ms: event.captured_at.0,
                    location_id: event.location_id.as_deref(),
                    processed: false,
                    metadata: &event.metadata,
                })
                .collect(),
        };
        serde_json::to_vec(&body)
    }
}

/// Delivers one batch. `Ok` acknowledges every event in it, any `Err` fails
/// every event.
#[async_trait::async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        destination: &Destination,
        batch: &UploadBatch,
    ) -> Result<UploadAck, UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionId, TenantId, UnixTimeMs};

    #[test]
    fn message_truncation_respects_char_boundaries() {
        let err = UploadError::network("é".repeat(400));
        assert!(err.message.len() <= UploadError::MAX_MESSAGE_LENGTH);
        assert!(err.message.chars().all(|c| c == 'é'));

        let short = UploadError::timeout("deadline exceeded");
        assert_eq!(short.message, "deadline exceeded");
        assert_eq!(short.to_string(), "timeout error: deadline exceeded");
    }

    #[test]
    fn status_helpers_prefix_code() {
        assert_eq!(UploadError::server(503, "busy").message, "HTTP 503: busy");
        assert_eq!(
            UploadError::rejected(422, "bad scan").kind,
            UploadErrorKind::Rejected
        );
    }

    #[test]
    fn request_body_matches_endpoint_contract() {
        let read = TagRead::new("e2801160", -42, UnixTimeMs(1_700_000_000_123))
            .unwrap()
            .with_location("dock-3")
            .unwrap()
            .with_metadata("antenna", "1")
            .unwrap();
        let batch = UploadBatch {
            correlation_key: CorrelationKey::new(
                TenantId::new("org-9").unwrap(),
                Some(SessionId::new("count-7").unwrap()),
            ),
            events: vec![read.clone()],
        };

        let body: serde_json::Value =
            serde_json::from_slice(&batch.to_request_body().unwrap()).unwrap();
        assert_eq!(body["organization_id"], "org-9");
        assert_eq!(body["session_id"], "count-7");
        let scan = &body["scans"][0];
        assert_eq!(scan["id"], read.id.to_string());
        assert_eq!(scan["rfid_tag"], "E2801160");
        assert_eq!(scan["rssi"], -42);
        assert_eq!(scan["timestamp_ms"], 1_700_000_000_123u64);
        assert_eq!(scan["location_id"], "dock-3");
        assert_eq!(scan["processed"], false);
        assert_eq!(scan["metadata"]["antenna"], "1");
    }

    #[test]
    fn tenant_only_batch_has_null_session() {
        let batch = UploadBatch {
            correlation_key: CorrelationKey::tenant(TenantId::new("org").unwrap()),
            events: vec![],
        };
        let body: serde_json::Value =
            serde_json::from_slice(&batch.to_request_body().unwrap()).unwrap();
        assert!(body["session_id"].is_null());
        assert_eq!(body["scans"].as_array().unwrap().len(), 0);
    }
}
