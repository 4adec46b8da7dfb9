use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::engine::SyncEngine;
use crate::event::TagRead;
use crate::model::{CorrelationKey, Destination};

/// A tag read as handed over by the reader integration.
#[derive(Debug, Clone)]
pub struct IngestMessage {
    pub event: TagRead,
    pub correlation_key: CorrelationKey,
    pub destination: Destination,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub enqueued: u64,
    pub dropped: u64,
    pub rejected: u64,
}

/// Drains `reads` into the engine until every sender is gone.
///
/// Enqueue errors are logged per read and never stop the loop.
pub async fn run_ingest(
    engine: Arc<SyncEngine>,
    mut reads: mpsc::Receiver<IngestMessage>,
) -> IngestSummary {
    let mut summary = IngestSummary::default();

    while let Some(message) = reads.recv().await {
        match engine
            .enqueue(&message.event, message.correlation_key, message.destination)
            .await
        {
            Ok(outcome) if outcome.was_dropped() => summary.dropped += 1,
            Ok(_) => summary.enqueued += 1,
            Err(e) => {
                error!(event_id = %message.event.id, error = %e, "failed to enqueue tag read");
                summary.rejected += 1;
            }
        }
    }

    info!(
        enqueued = summary.enqueued,
        dropped = summary.dropped,
        rejected = summary.rejected,
        "ingest channel closed"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::connectivity::ConnectivityMonitor;
    use crate::model::{TenantId, UnixTimeMs};
    use crate::store::DurableStore;
    use crate::uploader::{UploadAck, UploadBatch, UploadError, Uploader};

    struct NeverCalled;

    #[async_trait::async_trait]
    impl Uploader for NeverCalled {
        async fn upload(
            &self,
            _destination: &Destination,
            _batch: &UploadBatch,
        ) -> Result<UploadAck, UploadError> {
            panic!("ingest must not upload");
        }
    }

    #[tokio::test]
    async fn drains_channel_into_store() {
        let engine = Arc::new(
            SyncEngine::new(
                SyncConfig {
                    capacity: 100,
                    ..Default::default()
                },
                DurableStore::open_in_memory(100).unwrap(),
                Arc::new(NeverCalled),
                Arc::new(ConnectivityMonitor::new(false)),
                Arc::new(ManualClock::new(UnixTimeMs(0))),
            )
            .unwrap(),
        );
        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run_ingest(engine.clone(), rx));

        let key = CorrelationKey::tenant(TenantId::new("org").unwrap());
        let destination = Destination::new("https://ingest.test/batch").unwrap();
        for i in 0..5u64 {
            tx.send(IngestMessage {
                event: TagRead::new("00FF", -60, UnixTimeMs(i)).unwrap(),
                correlation_key: key.clone(),
                destination: destination.clone(),
            })
            .await
            .unwrap();
        }
        drop(tx);

        let summary = worker.await.unwrap();
        assert_eq!(summary.enqueued, 5);
        assert_eq!(summary.dropped, 0);
        assert_eq!(engine.store().count_all().await.unwrap(), 5);
        assert_eq!(engine.telemetry().snapshot().queue_depth, 5);
    }
}
