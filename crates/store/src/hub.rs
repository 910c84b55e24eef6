use std::collections::VecDeque;

use keel_core::config::Tunables;
use keel_core::Watch;
use metrics::counter;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{Revision, StoreError, StoreEvent, StoreResult, StoreWatch};

/// Bounded event history plus live fan-out for one store.
///
/// Callers must serialize `publish` and `subscribe` under the same lock that
/// guards the store's data, so a subscriber sees every event exactly once.
pub struct WatchHub {
    history: VecDeque<StoreEvent>,
    cap: usize,
    tx: broadcast::Sender<StoreEvent>,
    queue_cap: usize,
}

impl WatchHub {
    pub fn new(t: &Tunables) -> Self {
        let (tx, _) = broadcast::channel(t.watch_broadcast_cap.max(1));
        Self { history: VecDeque::with_capacity(t.watch_history.min(1024)), cap: t.watch_history.max(1), tx, queue_cap: t.queue_cap.max(1) }
    }

    pub fn publish(&mut self, ev: StoreEvent) {
        if self.history.len() >= self.cap {
            self.history.pop_front();
        }
        self.history.push_back(ev.clone());
        // No receivers is fine.
        let _ = self.tx.send(ev);
    }

    /// Oldest revision still replayable.
    pub fn oldest(&self) -> Option<Revision> {
        self.history.front().map(|e| e.revision)
    }

    /// Live subscribers, counting each running forwarder once.
    pub fn watchers(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self, prefix: &str, from: Revision, current: Revision) -> StoreResult<Subscription> {
        let rx = self.tx.subscribe();
        let mut backlog = Vec::new();
        let after = if from == 0 || from >= current {
            from.max(current)
        } else {
            let oldest = self.oldest().unwrap_or(current + 1);
            if from + 1 < oldest {
                return Err(StoreError::Compacted { requested: from, oldest });
            }
            backlog.extend(self.history.iter().filter(|e| e.revision > from && e.key.starts_with(prefix)).cloned());
            current
        };
        Ok(Subscription { prefix: prefix.to_string(), backlog, rx, after, queue_cap: self.queue_cap })
    }
}

/// A registered watcher, not yet running.
pub struct Subscription {
    prefix: String,
    backlog: Vec<StoreEvent>,
    rx: broadcast::Receiver<StoreEvent>,
    after: Revision,
    queue_cap: usize,
}

impl Subscription {
    /// Spawn the forwarding task: replayed backlog first, then live events.
    pub fn spawn(self) -> StoreWatch {
        let Subscription { prefix, backlog, mut rx, after, queue_cap } = self;
        let (tx, out) = mpsc::channel(queue_cap);
        let task = tokio::spawn(async move {
            debug!(prefix = %prefix, after, replay = backlog.len(), "store: watch started");
            for ev in backlog {
                if tx.send(Ok(ev)).await.is_err() {
                    return;
                }
            }
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if ev.revision <= after || !ev.key.starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(Ok(ev)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(prefix = %prefix, missed = n, "store: watcher lagged; closing");
                        counter!("watch_lagged_total", 1u64);
                        let _ = tx.send(Err(StoreError::Lagged(n))).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(prefix = %prefix, "store: watch ended");
        });
        Watch::new(out, task)
    }
}
