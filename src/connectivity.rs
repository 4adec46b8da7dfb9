use tokio::sync::watch;

/// Network reachability as seen by the sync engine.
pub trait Connectivity: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// A receiver that observes every reachability change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity fed by the host platform's network monitor.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(reachable: bool) -> Self {
        let (state, _) = watch::channel(reachable);
        Self { state }
    }

    /// Records a reachability change. Subscribers are only woken when the
    /// value actually flips.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
