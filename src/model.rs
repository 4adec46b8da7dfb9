use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const MAX_DESTINATION_LENGTH: usize = 2048;
pub const MAX_CORRELATION_ID_LENGTH: usize = 128;

/// Explicit timestamp unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn saturating_add(self, delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(ms))
    }

    pub(crate) fn as_sql(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub(crate) fn from_sql(raw: i64) -> Self {
        Self(u64::try_from(raw).unwrap_or(0))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid {field}: {reason}")]
    InvalidId { field: &'static str, reason: String },

    #[error("invalid destination {url}: {reason}")]
    InvalidDestination { url: String, reason: String },
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident, $field:literal) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, ModelError> {
                let s = s.into().trim().to_string();
                validate_correlation_id($field, &s)?;
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub(crate) fn from_stored(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(TenantId, "tenant id");
typed_id!(SessionId, "session id");

fn validate_correlation_id(field: &'static str, id: &str) -> Result<(), ModelError> {
    if id.is_empty() {
        return Err(ModelError::InvalidId {
            field,
            reason: "cannot be empty".into(),
        });
    }
    if id.len() > MAX_CORRELATION_ID_LENGTH {
        return Err(ModelError::InvalidId {
            field,
            reason: format!("exceeds {MAX_CORRELATION_ID_LENGTH} characters"),
        });
    }
    if id.chars().any(char::is_control) {
        return Err(ModelError::InvalidId {
            field,
            reason: "contains control characters".into(),
        });
    }
    Ok(())
}

/// Row identifier assigned by the store. Monotonic for the lifetime of the
/// queue file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The (tenant, session) pair an upload is scoped to. The remote endpoint
/// binds a whole batch to exactly one of these.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub tenant_id: TenantId,
    pub session_id: Option<SessionId>,
}

impl CorrelationKey {
    pub fn new(tenant_id: TenantId, session_id: Option<SessionId>) -> Self {
        Self {
            tenant_id,
            session_id,
        }
    }

    pub fn tenant(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, None)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session) => write!(f, "{}/{}", self.tenant_id, session),
            None => write!(f, "{}/-", self.tenant_id),
        }
    }
}

/// Logical upload target: an absolute http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Destination(String);

impl Destination {
    pub fn new(url: impl Into<String>) -> Result<Self, ModelError> {
        let url = url.into();
        if url.is_empty() {
            return Err(ModelError::InvalidDestination {
                url,
                reason: "URL cannot be empty".into(),
            });
        }
        if url.len() > MAX_DESTINATION_LENGTH {
            return Err(ModelError::InvalidDestination {
                url: url.chars().take(50).collect::<String>() + "...",
                reason: format!("URL exceeds maximum length of {MAX_DESTINATION_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(&url).map_err(|e| ModelError::InvalidDestination {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ModelError::InvalidDestination {
                    url,
                    reason: format!("unsupported scheme {other}"),
                })
            }
        }
        if parsed.host_str().is_none() {
            return Err(ModelError::InvalidDestination {
                url,
                reason: "missing host".into(),
            });
        }

        Ok(Self(parsed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rows are only ever written from validated destinations.
    pub(crate) fn from_stored(url: String) -> Self {
        Self(url)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the store needs to persist a new item.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub payload: Vec<u8>,
    pub correlation_key: CorrelationKey,
    pub destination: Destination,
    /// Capture time; drives FIFO delivery and eviction order.
    pub created_at: UnixTimeMs,
    /// Earliest time the first delivery may be attempted.
    pub schedule_at: UnixTimeMs,
}

/// A persisted, retry-tracked unit of undelivered data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: ItemId,
    pub created_at: UnixTimeMs,
    pub attempt_count: u32,
    pub next_attempt_at: UnixTimeMs,
    pub payload: Vec<u8>,
    pub correlation_key: CorrelationKey,
    pub destination: Destination,
    pub last_error: Option<String>,
}
