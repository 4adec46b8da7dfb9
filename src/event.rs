use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::model::UnixTimeMs;

pub const MAX_TAG_ID_LENGTH: usize = 128;
pub const MAX_LOCATION_ID_LENGTH: usize = 128;
pub const MAX_METADATA_ENTRIES: usize = 32;
pub const MAX_METADATA_VALUE_LENGTH: usize = 512;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("invalid tag id {tag_id:?}: {reason}")]
    InvalidTagId { tag_id: String, reason: &'static str },

    #[error("invalid location id: {0}")]
    InvalidLocation(&'static str),

    #[error("too many metadata entries: {count}, max {max}")]
    TooMuchMetadata { count: usize, max: usize },

    #[error("metadata value for {key:?} exceeds {max} bytes")]
    MetadataValueTooLong { key: String, max: usize },
}

/// Per-read identifier, generated on the device so the remote side can
/// de-duplicate redelivered batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single RFID tag read, as produced by the reader integration.
///
/// Unknown fields are rejected on decode so that a payload written by an
/// incompatible build surfaces as malformed rather than half-parsed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagRead {
    pub id: EventId,
    /// EPC in hex, e.g. `E280689400004006A12BC123`.
    pub tag_id: String,
    /// Signal strength in dBm.
    pub rssi: i16,
    pub captured_at: UnixTimeMs,
    pub location_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl TagRead {
    pub fn new(
        tag_id: impl Into<String>,
        rssi: i16,
        captured_at: UnixTimeMs,
    ) -> Result<Self, EventError> {
        let tag_id = tag_id.into().trim().to_ascii_uppercase();
        Self::validate_tag_id(&tag_id)?;
        Ok(Self {
            id: EventId::generate(),
            tag_id,
            rssi,
            captured_at,
            location_id: None,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_location(mut self, location_id: impl Into<String>) -> Result<Self, EventError> {
        let location_id = location_id.into();
        if location_id.trim().is_empty() {
            return Err(EventError::InvalidLocation("cannot be empty"));
        }
        if location_id.len() > MAX_LOCATION_ID_LENGTH {
            return Err(EventError::InvalidLocation("too long"));
        }
        self.location_id = Some(location_id);
        Ok(self)
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, EventError> {
        let key = key.into();
        let value = value.into();
        if value.len() > MAX_METADATA_VALUE_LENGTH {
            return Err(EventError::MetadataValueTooLong {
                key,
                max: MAX_METADATA_VALUE_LENGTH,
            });
        }
        if !self.metadata.contains_key(&key) && self.metadata.len() >= MAX_METADATA_ENTRIES {
            return Err(EventError::TooMuchMetadata {
                count: self.metadata.len() + 1,
                max: MAX_METADATA_ENTRIES,
            });
        }
        self.metadata.insert(key, value);
        Ok(self)
    }

    /// Returns true for reads stronger than -50 dBm.
    pub fn is_strong_signal(&self) -> bool {
        self.rssi > -50
    }

    fn validate_tag_id(tag_id: &str) -> Result<(), EventError> {
        if tag_id.is_empty() {
            return Err(EventError::InvalidTagId {
                tag_id: tag_id.to_string(),
                reason: "cannot be empty",
            });
        }
        if tag_id.len() > MAX_TAG_ID_LENGTH {
            return Err(EventError::InvalidTagId {
                tag_id: tag_id.chars().take(32).collect::<String>() + "...",
                reason: "too long",
            });
        }
        if !tag_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EventError::InvalidTagId {
                tag_id: tag_id.to_string(),
                reason: "must be hexadecimal",
            });
        }
        Ok(())
    }
}
