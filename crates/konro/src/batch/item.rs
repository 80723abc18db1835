//! The caller-facing result slot.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::Error;

/// The future half of a committed request's one-shot result slot.
///
/// Resolves once the owning batch has executed: `Ok` with the postprocessed
/// value, `Err` with that row's failure, or [`Error::Canceled`] if the
/// worker shut down before the batch ran. Dropping an `Item` abandons the
/// result; the underlying row still executes.
pub struct Item<T> {
    receiver: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Item<T> {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<T, Error>>) -> Self {
        Self { receiver }
    }
}

impl<T> Future for Item<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|res| match res {
                Ok(row_result) => row_result,
                Err(_) => Err(Error::Canceled),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_sent_value() {
        let (tx, rx) = oneshot::channel();
        let item = Item::new(rx);
        tx.send(Ok(7usize)).unwrap();
        assert_eq!(item.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_sender_means_canceled() {
        let (tx, rx) = oneshot::channel::<Result<usize, Error>>();
        let item = Item::new(rx);
        drop(tx);
        assert_eq!(item.await, Err(Error::Canceled));
    }
}
