//! Work queue and driver for running the reconciler against a
//! [`MemoryStore`](crate::store::MemoryStore) event stream.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ReconcileErr, Reconciler, pod_to_models};
use crate::registry::KindRegistry;
use crate::store::{ObjectKey, StoreEvent};

/// FIFO of reconciliation keys; a key already waiting is not queued twice.
#[derive(Debug, Default)]
pub struct KeyQueue {
    order: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
}

impl KeyQueue {
    /// Returns false when the key was already waiting.
    pub fn push(&mut self, key: ObjectKey) -> bool {
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Keys a change event should wake.
pub fn keys_for_event(registry: &KindRegistry, ev: &StoreEvent) -> Vec<ObjectKey> {
    match ev {
        StoreEvent::Model(key) => vec![key.clone()],
        StoreEvent::Pod(pod) => pod_to_models(registry, pod),
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub passes: usize,
    pub errors: Vec<(ObjectKey, ReconcileErr)>,
}

pub struct LocalController {
    reconciler: Reconciler,
    events: mpsc::UnboundedReceiver<StoreEvent>,
    queue: KeyQueue,
    max_attempts: u32,
    max_passes: usize,
}

impl LocalController {
    pub fn new(
        reconciler: Reconciler,
        events: mpsc::UnboundedReceiver<StoreEvent>,
    ) -> Self {
        Self {
            reconciler,
            events,
            queue: KeyQueue::default(),
            max_attempts: 5,
            max_passes: 1_000,
        }
    }

    /// Consecutive failures tolerated per key within one run.
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn enqueue(&mut self, key: ObjectKey) {
        self.queue.push(key);
    }

    fn drain_events(&mut self) {
        while let Ok(ev) = self.events.try_recv() {
            for key in keys_for_event(self.reconciler.registry(), &ev) {
                self.queue.push(key);
            }
        }
    }

    /// Reconcile until neither events nor queued keys remain. A failed key
    /// is redelivered until it has failed `max_attempts` times in a row.
    pub async fn run_until_idle(
        &mut self,
        cancel: &CancellationToken,
    ) -> RunReport {
        let mut report = RunReport::default();
        let mut attempts: HashMap<ObjectKey, u32> = HashMap::new();
        loop {
            self.drain_events();
            let Some(key) = self.queue.pop() else {
                break;
            };
            if report.passes >= self.max_passes {
                warn!(passes = report.passes, "local controller: pass limit reached");
                break;
            }
            report.passes += 1;
            match self.reconciler.reconcile(&key, cancel).await {
                Ok(()) => {
                    attempts.remove(&key);
                }
                Err(e) => {
                    let n = attempts.entry(key.clone()).or_insert(0);
                    *n += 1;
                    debug!(%key, attempt = *n, error = %e, "local controller: pass failed");
                    if *n < self.max_attempts {
                        self.queue.push(key.clone());
                    }
                    report.errors.push((key, e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_deduplicates_waiting_keys() {
        let mut q = KeyQueue::default();
        let a = ObjectKey::new("ns", "a");
        let b = ObjectKey::new("ns", "b");
        assert!(q.push(a.clone()));
        assert!(q.push(b.clone()));
        assert!(!q.push(a.clone()));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(a.clone()));
        // popped keys may be queued again
        assert!(q.push(a.clone()));
        assert_eq!(q.pop(), Some(b));
        assert_eq!(q.pop(), Some(a));
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn model_events_map_to_their_key() {
        let r = KindRegistry::new();
        let key = ObjectKey::new("ns", "llama");
        assert_eq!(
            keys_for_event(&r, &StoreEvent::Model(key.clone())),
            vec![key]
        );
        assert!(keys_for_event(&r, &StoreEvent::Pod(Default::default())).is_empty());
    }
}
