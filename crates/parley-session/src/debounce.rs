//! Per-key trailing debounce.
//!
//! Scheduling a key again before its delay elapses replaces the pending action,
//! so only the last action of a burst runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Slots {
    next_generation: u64,
    pending: HashMap<String, (u64, JoinHandle<()>)>,
}

#[derive(Clone, Default)]
pub struct Debouncer {
    slots: Arc<Mutex<Slots>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay` unless `key` is scheduled again first.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut slots = self.slots.lock();
        slots.next_generation += 1;
        let generation = slots.next_generation;

        let registry = Arc::clone(&self.slots);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slots = registry.lock();
                if !slots.pending.get(&task_key).is_some_and(|(g, _)| *g == generation) {
                    return;
                }
                slots.pending.remove(&task_key);
            }
            action.await;
        });

        if let Some((_, previous)) = slots.pending.insert(key, (generation, handle)) {
            previous.abort();
        }
    }

    pub fn cancel(&self, key: &str) {
        if let Some((_, handle)) = self.slots.lock().pending.remove(key) {
            handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, handle)) in self.slots.lock().pending.drain() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().pending.len()
    }
}
