#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tag_uplink::{
    BackoffConfig, CorrelationKey, ConnectivityMonitor, Destination, DurableStore, ManualClock,
    SessionId, SyncConfig, SyncEngine, TagRead, TenantId, UnixTimeMs, UploadAck, UploadBatch,
    UploadError, Uploader,
};
use tokio::sync::Notify;

pub const START: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(tenant: &str, session: Option<&str>) -> CorrelationKey {
    CorrelationKey::new(
        TenantId::new(tenant).unwrap(),
        session.map(|s| SessionId::new(s).unwrap()),
    )
}

pub fn destination() -> Destination {
    Destination::new("https://ingest.test/functions/v1/batch_insert_scans").unwrap()
}

pub fn read(captured_at: u64) -> TagRead {
    TagRead::new(format!("E2806894{captured_at:08X}"), -55, UnixTimeMs(captured_at)).unwrap()
}

/// Deterministic config: no jitter, 1s base delay.
pub fn config() -> SyncConfig {
    SyncConfig {
        capacity: 100,
        max_attempts: 3,
        fetch_limit: 200,
        max_batch_size: 50,
        flush_interval_ms: 60_000,
        backoff: BackoffConfig {
            base_ms: 1_000,
            max_ms: 1_000_000,
            jitter_ratio: 0.0,
        },
        jitter_seed: Some(7),
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub destination: Destination,
    pub correlation_key: CorrelationKey,
    pub events: Vec<TagRead>,
}

type AfterCall = Box<dyn Fn(usize) + Send + Sync>;

/// Uploader that answers from a script and records every call. Once the
/// script runs out every upload succeeds.
#[derive(Default)]
pub struct ScriptedUploader {
    responses: Mutex<VecDeque<Result<(), UploadError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    after_call: Mutex<Option<AfterCall>>,
}

impl ScriptedUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, times: usize, error: UploadError) {
        let mut responses = self.responses.lock().unwrap();
        for _ in 0..times {
            responses.push_back(Err(error.clone()));
        }
    }

    /// Runs `hook` with the 1-based call number after each upload is
    /// recorded.
    pub fn after_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.after_call.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Uploader for ScriptedUploader {
    async fn upload(
        &self,
        destination: &Destination,
        batch: &UploadBatch,
    ) -> Result<UploadAck, UploadError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(RecordedCall {
                destination: destination.clone(),
                correlation_key: batch.correlation_key.clone(),
                events: batch.events.clone(),
            });
            calls.len()
        };
        if let Some(hook) = self.after_call.lock().unwrap().as_ref() {
            hook(call);
        }
        match self.responses.lock().unwrap().pop_front() {
            Some(Err(e)) => Err(e),
            Some(Ok(())) | None => Ok(UploadAck {
                accepted: batch.len(),
            }),
        }
    }
}

/// Uploader that parks inside `upload` until released.
#[derive(Default)]
pub struct GatedUploader {
    pub entered: Notify,
    pub release: Notify,
    calls: AtomicUsize,
}

impl GatedUploader {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Uploader for GatedUploader {
    async fn upload(
        &self,
        _destination: &Destination,
        batch: &UploadBatch,
    ) -> Result<UploadAck, UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(UploadAck {
            accepted: batch.len(),
        })
    }
}

/// Uploader whose first call panics; later calls succeed.
#[derive(Default)]
pub struct PanicOnceUploader {
    calls: AtomicUsize,
}

impl PanicOnceUploader {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Uploader for PanicOnceUploader {
    async fn upload(
        &self,
        _destination: &Destination,
        batch: &UploadBatch,
    ) -> Result<UploadAck, UploadError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("uploader blew up");
        }
        Ok(UploadAck {
            accepted: batch.len(),
        })
    }
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(config: SyncConfig, uploader: Arc<dyn Uploader>, online: bool) -> Harness {
    let store = DurableStore::open_in_memory(config.capacity).unwrap();
    harness_with_store(config, store, uploader, online)
}

pub fn harness_with_store(
    config: SyncConfig,
    store: DurableStore,
    uploader: Arc<dyn Uploader>,
    online: bool,
) -> Harness {
    init_tracing();
    let connectivity = Arc::new(ConnectivityMonitor::new(online));
    let clock = Arc::new(ManualClock::new(START));
    let engine = SyncEngine::new(
        config,
        store,
        uploader,
        connectivity.clone(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        engine: Arc::new(engine),
        connectivity,
        clock,
    }
}

impl Harness {
    pub async fn enqueue(&self, captured_at: u64, key: CorrelationKey) {
        let outcome = self
            .engine
            .enqueue(&read(captured_at), key, destination())
            .await
            .unwrap();
        assert!(!outcome.was_dropped());
    }

    pub async fn depth(&self) -> u64 {
        self.engine.store().count_all().await.unwrap()
    }

    pub async fn wait_for_depth(&self, depth: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.depth().await != depth {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
