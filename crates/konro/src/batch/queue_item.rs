//! Pending-request bookkeeping.

use tokio::sync::oneshot::Sender;

use crate::error::Error;

/// One enqueued inference request: the domain input paired with the sending
/// half of its result slot.
///
/// Owned by the worker's queue from `commit` until its batch is drained,
/// then consumed when the row's result (or failure) is delivered.
pub struct QueueItem<I, O> {
    input: I,
    sender: Sender<Result<O, Error>>,
}

impl<I, O> QueueItem<I, O> {
    pub fn new(input: I, sender: Sender<Result<O, Error>>) -> Self {
        Self { input, sender }
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    /// Consumes the item, yielding the channel to fulfill it through.
    pub fn into_sender(self) -> Sender<Result<O, Error>> {
        self.sender
    }
}
