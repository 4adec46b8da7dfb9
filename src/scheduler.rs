use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::SyncError;

const INBOX_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMessage {
    FlushNow,
    Lifecycle(AppLifecycle),
    Shutdown,
}

/// Decides when to flush: connectivity coming back, a periodic timer while
/// foregrounded and online, returning to the foreground with queued items,
/// and explicit requests. Overlapping triggers collapse in the engine.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    inbox: mpsc::Receiver<SchedulerMessage>,
    flushes: JoinSet<()>,
    online: bool,
    foreground: bool,
}

/// Control surface for a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    messages: mpsc::Sender<SchedulerMessage>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn request_flush(&self) -> Result<(), SyncError> {
        self.send(SchedulerMessage::FlushNow).await
    }

    pub async fn set_lifecycle(&self, state: AppLifecycle) -> Result<(), SyncError> {
        self.send(SchedulerMessage::Lifecycle(state)).await
    }

    /// Stops the scheduler and waits for any flush it started.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        self.send(SchedulerMessage::Shutdown).await?;
        self.task.await.map_err(|_| SyncError::SchedulerStopped)
    }

    async fn send(&self, message: SchedulerMessage) -> Result<(), SyncError> {
        self.messages
            .send(message)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }
}

impl SyncScheduler {
    /// Starts the trigger loop on the current tokio runtime.
    pub fn spawn(engine: Arc<SyncEngine>) -> SchedulerHandle {
        let (messages, inbox) = mpsc::channel(INBOX_CAPACITY);
        let scheduler = Self {
            engine,
            inbox,
            flushes: JoinSet::new(),
            online: false,
            foreground: true,
        };
        let task = tokio::spawn(scheduler.run());
        SchedulerHandle { messages, task }
    }

    async fn run(mut self) {
        let mut reachability = self.engine.connectivity().subscribe();
        let mut watching = true;
        self.online = *reachability.borrow_and_update();

        let period = self.engine.config().flush_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(online = self.online, interval_ms = period.as_millis() as u64, "sync scheduler started");
        if self.online {
            self.spawn_flush("startup");
        }

        loop {
            tokio::select! {
                changed = reachability.changed(), if watching => {
                    if changed.is_err() {
                        warn!("connectivity source closed, relying on timer and requests");
                        watching = false;
                        continue;
                    }
                    let online = *reachability.borrow_and_update();
                    let came_online = online && !self.online;
                    self.online = online;
                    debug!(online, "connectivity changed");
                    if came_online {
                        self.spawn_flush("connectivity restored");
                    }
                }
                _ = ticker.tick(), if self.foreground => {
                    if self.online && !self.engine.is_flushing() {
                        self.spawn_flush("timer");
                    }
                }
                message = self.inbox.recv() => match message {
                    Some(SchedulerMessage::FlushNow) => self.spawn_flush("requested"),
                    Some(SchedulerMessage::Lifecycle(AppLifecycle::Background)) => {
                        debug!("app backgrounded, pausing timer");
                        self.foreground = false;
                    }
                    Some(SchedulerMessage::Lifecycle(AppLifecycle::Foreground)) => {
                        let resumed = !self.foreground;
                        self.foreground = true;
                        ticker.reset();
                        if resumed && self.has_queued_items().await {
                            self.spawn_flush("foreground");
                        }
                    }
                    Some(SchedulerMessage::Shutdown) | None => break,
                },
                Some(joined) = self.flushes.join_next(), if !self.flushes.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "flush task failed");
                    }
                }
            }
        }

        while let Some(joined) = self.flushes.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "flush task failed");
            }
        }
        info!("sync scheduler stopped");
    }

    async fn has_queued_items(&self) -> bool {
        match self.engine.refresh_depth().await {
            Ok(depth) => depth > 0,
            Err(e) => {
                warn!(error = %e, "could not read queue depth");
                true
            }
        }
    }

    fn spawn_flush(&mut self, trigger: &'static str) {
        debug!(trigger, "scheduling flush");
        let engine = Arc::clone(&self.engine);
        self.flushes.spawn(async move {
            engine.flush().await;
        });
    }
}
