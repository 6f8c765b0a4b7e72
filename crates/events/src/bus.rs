//! Publish/subscribe abstraction (mechanics only).
//!
//! The dispatcher publishes one [`crate::ChunkReadyNotification`] per chunk it
//! moves from READY to QUEUED. The bus is a **fire-and-forget notifier**: the
//! chunk row in storage is the source of truth, the message only tells a worker
//! to go and look.
//!
//! ## Delivery
//!
//! - **At-least-once**: a transport may redeliver; consumers must be idempotent.
//!   For chunks this is free, because dequeue is a conditional QUEUED -> IN_PROGRESS
//!   update and a duplicate simply loses.
//! - **No ordering guarantees** across publishers.
//! - **No persistence**: a publish that fails is rolled back by the dispatcher
//!   (QUEUED -> READY) so the next maintenance pass re-dispatches the chunk.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a message stream.
///
/// Each subscription receives its own copy of every published message
/// (broadcast semantics). Intended for a single consuming thread.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_millis(250)) {
///         Ok(msg) => handle(msg),
///         Err(RecvTimeoutError::Timeout) => continue, // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub bus.
///
/// `publish()` may fail (bus closed, network error). The dispatcher then undoes
/// the READY -> QUEUED update and surfaces the failure to its caller.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
