#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod backoff;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod event;
pub mod grouper;
pub mod ingest;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod uploader;

use thiserror::Error;

pub use backoff::{BackoffPolicy, JitterSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode_event, encode_event, PayloadError};
pub use config::{BackoffConfig, ConfigError, SyncConfig, MAX_REMOTE_BATCH_SIZE};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use engine::{FlushOutcome, FlushReport, SkipReason, SyncEngine};
pub use event::{EventError, EventId, TagRead};
pub use grouper::{DeliveryChunk, DeliveryGrouper, DeliveryItem};
pub use ingest::{run_ingest, IngestMessage, IngestSummary};
pub use model::{
    CorrelationKey, Destination, ItemId, ModelError, QueueItem, SessionId, TenantId, UnixTimeMs,
};
pub use scheduler::{AppLifecycle, SchedulerHandle, SchedulerMessage, SyncScheduler};
pub use store::{DurableStore, EnqueueOutcome, QueueError};
pub use telemetry::{QueueTelemetry, TelemetryReport, TelemetrySnapshot};
pub use uploader::{UploadAck, UploadBatch, UploadError, UploadErrorKind, Uploader};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("invalid tag read: {0}")]
    Event(#[from] EventError),

    #[error("invalid input: {0}")]
    Model(#[from] ModelError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("scheduler is no longer running")]
    SchedulerStopped,
}
