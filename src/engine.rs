use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{BackoffPolicy, JitterSource};
use crate::clock::Clock;
use crate::codec::{decode_event, encode_event};
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::event::TagRead;
use crate::grouper::{DeliveryChunk, DeliveryGrouper, DeliveryItem};
use crate::model::{CorrelationKey, Destination, ItemId, PendingItem, QueueItem};
use crate::store::{DurableStore, EnqueueOutcome, QueueError};
use crate::telemetry::QueueTelemetry;
use crate::uploader::{UploadBatch, UploadError, Uploader};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyFlushing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    Completed(FlushReport),
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            FlushOutcome::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Fetch-and-deliver passes that found ready items.
    pub passes: u32,
    pub chunks_attempted: u32,
    pub delivered: u64,
    /// Items in chunks whose upload failed, retried or not.
    pub failed: u64,
    pub rescheduled: u64,
    pub permanently_failed: u64,
    pub malformed: u64,
    pub store_errors: u32,
    /// The cycle stopped early because connectivity dropped.
    pub halted_offline: bool,
}

/// Drains ready items from the [`DurableStore`] in passes: decode, group,
/// upload chunk by chunk, then write each chunk's outcome back. Failures
/// inside a cycle are logged and folded into the [`FlushReport`].
pub struct SyncEngine {
    store: DurableStore,
    config: SyncConfig,
    backoff: BackoffPolicy,
    jitter: JitterSource,
    grouper: DeliveryGrouper,
    uploader: Arc<dyn Uploader>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<QueueTelemetry>,
    flushing: AtomicBool,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("flushing", &self.flushing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: DurableStore,
        uploader: Arc<dyn Uploader>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let backoff = BackoffPolicy::from_config(&config.backoff)?;
        let grouper = DeliveryGrouper::new(config.max_batch_size)?;
        let jitter = match config.jitter_seed {
            Some(seed) => JitterSource::seeded(seed),
            None => JitterSource::from_entropy(),
        };
        if store.capacity() != config.capacity {
            warn!(
                store_capacity = store.capacity(),
                configured = config.capacity,
                "store capacity differs from configured capacity"
            );
        }

        Ok(Self {
            store,
            config,
            backoff,
            jitter,
            grouper,
            uploader,
            connectivity,
            clock,
            telemetry: Arc::new(QueueTelemetry::new()),
            flushing: AtomicBool::new(false),
        })
    }

    /// Opens the queue file at `path` with the configured capacity.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        config: SyncConfig,
        uploader: Arc<dyn Uploader>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let store = DurableStore::open(path, config.capacity)?;
        Self::new(config, store, uploader, connectivity, clock)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn telemetry(&self) -> &Arc<QueueTelemetry> {
        &self.telemetry
    }

    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Persists a tag read for later delivery.
    ///
    /// A read that cannot be admitted even after eviction is dropped and
    /// reported through the outcome, not as an error.
    #[instrument(skip(self, event, destination), fields(correlation = %correlation_key, tag = %event.tag_id))]
    pub async fn enqueue(
        &self,
        event: &TagRead,
        correlation_key: CorrelationKey,
        destination: Destination,
    ) -> Result<EnqueueOutcome, SyncError> {
        let payload = encode_event(event)?;
        let outcome = self
            .store
            .enqueue(PendingItem {
                payload,
                correlation_key,
                destination,
                created_at: event.captured_at,
                schedule_at: self.clock.now(),
            })
            .await?;

        self.telemetry.record_evicted(outcome.evicted);
        if outcome.was_dropped() {
            warn!(event_id = %event.id, "queue full, tag read dropped");
        }
        self.refresh_depth_logged().await;
        Ok(outcome)
    }

    /// Re-reads the queue depth from the store into telemetry.
    pub async fn refresh_depth(&self) -> Result<u64, QueueError> {
        let depth = self.store.count_all().await?;
        self.telemetry.set_depth(depth);
        Ok(depth)
    }

    async fn refresh_depth_logged(&self) -> Option<u64> {
        match self.refresh_depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(error = %e, "could not refresh queue depth");
                None
            }
        }
    }

    /// Drops every queued item.
    #[instrument(skip(self))]
    pub async fn clear_queue(&self) -> Result<u64, SyncError> {
        let removed = self.store.clear().await?;
        self.telemetry.set_depth(0);
        Ok(removed)
    }

    /// Runs one flush cycle unless offline or another flush is running.
    pub async fn flush(&self) -> FlushOutcome {
        if !self.connectivity.is_reachable() {
            debug!("flush skipped: offline");
            return FlushOutcome::Skipped(SkipReason::Offline);
        }
        let Some(_guard) = FlushGuard::acquire(&self.flushing, &self.telemetry) else {
            debug!("flush skipped: already flushing");
            return FlushOutcome::Skipped(SkipReason::AlreadyFlushing);
        };

        FlushOutcome::Completed(self.run_cycle().await)
    }

    #[instrument(skip(self))]
    async fn run_cycle(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let limit = self.config.fetch_limit;

        self.purge_exhausted(&mut report).await;

        'passes: loop {
            if !self.connectivity.is_reachable() {
                report.halted_offline = true;
                break;
            }

            let ready = match self
                .store
                .fetch_ready(limit, self.clock.now(), self.config.max_attempts)
                .await
            {
                Ok(ready) => ready,
                Err(e) => {
                    error!(error = %e, "failed to fetch ready items");
                    report.store_errors += 1;
                    break;
                }
            };
            if ready.is_empty() {
                break;
            }
            report.passes += 1;
            let fetched = ready.len();

            let (items, mut progressed) = self.decode_ready(ready, &mut report).await;

            for chunk in self.grouper.group(items) {
                if !self.connectivity.is_reachable() {
                    info!(
                        delivered = report.delivered,
                        "connectivity lost, stopping flush before next chunk"
                    );
                    report.halted_offline = true;
                    break 'passes;
                }
                progressed |= self.deliver_chunk(chunk, &mut report).await;
            }

            if fetched < limit {
                break;
            }
            if !progressed {
                warn!("flush pass made no progress, ending cycle");
                break;
            }
        }

        let depth = self.refresh_depth_logged().await;
        self.telemetry
            .record_flush(self.clock.now(), report.delivered, report.failed);
        info!(
            delivered = report.delivered,
            failed = report.failed,
            permanently_failed = report.permanently_failed,
            malformed = report.malformed,
            queue_depth = ?depth,
            "flush cycle finished"
        );
        report
    }

    async fn purge_exhausted(&self, report: &mut FlushReport) {
        match self.store.purge_exhausted(self.config.max_attempts).await {
            Ok(purged) => {
                for item in &purged {
                    error!(
                        item_id = %item.id,
                        attempts = item.attempt_count,
                        max_attempts = self.config.max_attempts,
                        last_error = item.last_error.as_deref().unwrap_or("none"),
                        correlation = %item.correlation_key,
                        "dropping item that already exhausted its delivery attempts"
                    );
                }
                let count = purged.len() as u64;
                report.permanently_failed += count;
                self.telemetry.record_permanent_failures(count);
            }
            Err(e) => {
                error!(error = %e, "failed to purge exhausted items");
                report.store_errors += 1;
            }
        }
    }

    /// Decodes payloads, deleting the ones that cannot be read. Returns the
    /// decoded items and whether anything was removed from the store.
    async fn decode_ready(
        &self,
        ready: Vec<QueueItem>,
        report: &mut FlushReport,
    ) -> (Vec<DeliveryItem>, bool) {
        let mut items = Vec::with_capacity(ready.len());
        let mut malformed = Vec::new();

        for item in ready {
            match decode_event(&item.payload) {
                Ok(event) => items.push(DeliveryItem {
                    id: item.id,
                    attempt_count: item.attempt_count,
                    last_error: item.last_error,
                    correlation_key: item.correlation_key,
                    destination: item.destination,
                    event,
                }),
                Err(e) => {
                    error!(
                        item_id = %item.id,
                        correlation = %item.correlation_key,
                        payload_bytes = item.payload.len(),
                        error = %e,
                        "dropping malformed payload"
                    );
                    malformed.push(item.id);
                }
            }
        }

        if malformed.is_empty() {
            return (items, false);
        }
        let count = malformed.len() as u64;
        match self.store.delete(malformed).await {
            Ok(_) => {
                report.malformed += count;
                self.telemetry.record_malformed(count);
                (items, true)
            }
            Err(e) => {
                error!(error = %e, count, "failed to delete malformed items");
                report.store_errors += 1;
                (items, false)
            }
        }
    }

    /// Uploads one chunk and applies the result. Returns whether the store
    /// changed.
    #[instrument(skip_all, fields(correlation = %chunk.correlation_key, size = chunk.len()))]
    async fn deliver_chunk(&self, chunk: DeliveryChunk, report: &mut FlushReport) -> bool {
        report.chunks_attempted += 1;
        let batch = UploadBatch {
            correlation_key: chunk.correlation_key.clone(),
            events: chunk.events(),
        };
        let size = chunk.len() as u64;

        match self.uploader.upload(&chunk.destination, &batch).await {
            Ok(ack) => {
                report.delivered += size;
                match self.store.delete(chunk.ids()).await {
                    Ok(_) => {
                        debug!(accepted = ack.accepted, "chunk delivered");
                        true
                    }
                    Err(e) => {
                        error!(error = %e, "delivered chunk could not be removed and will be sent again");
                        report.store_errors += 1;
                        false
                    }
                }
            }
            Err(err) => {
                report.failed += size;
                self.apply_failure(chunk, &err, report).await
            }
        }
    }

    async fn apply_failure(
        &self,
        chunk: DeliveryChunk,
        err: &UploadError,
        report: &mut FlushReport,
    ) -> bool {
        let max_attempts = self.config.max_attempts;
        let (exhausted, retryable): (Vec<_>, Vec<_>) = chunk
            .items
            .into_iter()
            .partition(|item| item.attempt_count.saturating_add(1) >= max_attempts);

        let mut progressed = false;

        if !exhausted.is_empty() {
            let ids: Vec<ItemId> = exhausted.iter().map(|item| item.id).collect();
            match self.store.delete(ids).await {
                Ok(_) => {
                    let depth = self.store.count_all().await.ok();
                    for item in &exhausted {
                        error!(
                            item_id = %item.id,
                            event_id = %item.event.id,
                            attempts = item.attempt_count.saturating_add(1),
                            max_attempts,
                            last_error = item.last_error.as_deref().unwrap_or("none"),
                            error = %err,
                            destination = %chunk.destination,
                            queue_depth = ?depth,
                            "delivery attempts exhausted, dropping tag read"
                        );
                    }
                    let count = exhausted.len() as u64;
                    report.permanently_failed += count;
                    self.telemetry.record_permanent_failures(count);
                    progressed = true;
                }
                Err(e) => {
                    error!(error = %e, "failed to drop exhausted items");
                    report.store_errors += 1;
                }
            }
        }

        if !retryable.is_empty() {
            let attempt = retryable
                .iter()
                .map(|item| item.attempt_count)
                .max()
                .unwrap_or_default();
            let delay = self.jitter.next_delay(&self.backoff, attempt);
            let next_attempt_at = self.clock.now().saturating_add(delay);
            let ids: Vec<ItemId> = retryable.iter().map(|item| item.id).collect();
            let count = ids.len() as u64;

            match self
                .store
                .mark_failed(ids, err.to_string(), next_attempt_at)
                .await
            {
                Ok(_) => {
                    warn!(
                        count,
                        attempt = attempt.saturating_add(1),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "upload failed, rescheduling"
                    );
                    report.rescheduled += count;
                    progressed = true;
                }
                Err(e) => {
                    error!(error = %e, "failed to reschedule items");
                    report.store_errors += 1;
                }
            }
        }

        progressed
    }
}

/// Holds the single-flight flag for the duration of a cycle. Dropping it,
/// including on unwind or cancellation, returns the engine to idle.
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
    telemetry: &'a QueueTelemetry,
}

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool, telemetry: &'a QueueTelemetry) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        telemetry.set_flushing(true);
        Some(Self { flag, telemetry })
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.telemetry.set_flushing(false);
    }
}
