//! In-process chunk notifier backed by `std::sync::mpsc` channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, mpsc};

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// A thread panicked while holding the worker list.
    #[error("in-memory notifier worker list poisoned")]
    Poisoned,
}

/// Single-process notifier for tests and the demo runner.
///
/// Every subscribed worker gets its own copy of each notification. Nothing is
/// buffered for workers that subscribe later. `published_count` lets tests
/// check that a dispatch announced a chunk exactly once.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    workers: Mutex<Vec<mpsc::Sender<M>>>,
    published: AtomicU64,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications accepted by `publish` so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Workers currently subscribed (receivers not yet dropped as of the last publish).
    pub fn subscriber_count(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or_default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut workers = self.workers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        // A failed send means that worker has shut down.
        workers.retain(|worker| worker.send(message.clone()).is_ok());
        drop(workers);

        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (sender, receiver) = mpsc::channel();
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        Subscription::new(receiver)
    }
}
