use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    client::Update,
    ctype::{TypeMismatch, Value},
};

/// Custom error type for `Subscription::recv`
#[derive(Debug, Error)]
pub enum SubscriberRecvError {
    #[error("Channel closed")]
    Closed,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
    #[error("Could not convert value: {0}")]
    NoConvert(#[from] TypeMismatch),
}

impl From<broadcast::error::RecvError> for SubscriberRecvError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => Self::Closed,
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Custom error type for `Subscription::try_recv`
#[derive(Debug, Error)]
pub enum SubscriberTryRecvError {
    #[error("No messages outstanding")]
    Empty,
    #[error("Channel closed")]
    Closed,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
}

impl From<broadcast::error::TryRecvError> for SubscriberTryRecvError {
    fn from(err: broadcast::error::TryRecvError) -> Self {
        match err {
            broadcast::error::TryRecvError::Empty => Self::Empty,
            broadcast::error::TryRecvError::Closed => Self::Closed,
            broadcast::error::TryRecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Stream of updates from a [`SymbolHandle`](crate::client::SymbolHandle)
///
/// A wrapper around `tokio::sync::broadcast::Receiver` that stops yielding as
/// soon as the handle is closed, even if updates are still queued. A
/// subscription made after delivery started first yields the current
/// connection state and, while connected, the latest value.
pub struct Subscription {
    inner: broadcast::Receiver<Update>,
    closed: CancellationToken,
    backlog: VecDeque<Update>,
}

impl Subscription {
    pub(crate) fn new(inner: broadcast::Receiver<Update>, closed: CancellationToken) -> Self {
        Self {
            inner,
            closed,
            backlog: VecDeque::new(),
        }
    }

    /// Yield these updates before anything received from the channel
    pub(crate) fn with_backlog(mut self, backlog: impl IntoIterator<Item = Update>) -> Self {
        self.backlog.extend(backlog);
        self
    }

    /// Receive the next update from the handle.
    pub async fn recv(&mut self) -> Result<Update, SubscriberRecvError> {
        if self.closed.is_cancelled() {
            return Err(SubscriberRecvError::Closed);
        }
        if let Some(update) = self.backlog.pop_front() {
            return Ok(update);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SubscriberRecvError::Closed),
            update = self.inner.recv() => Ok(update?),
        }
    }

    /// Receive the next value, skipping connection updates, converted to `T`
    pub async fn recv_value<T>(&mut self) -> Result<T, SubscriberRecvError>
    where
        T: for<'a> TryFrom<&'a Value, Error = TypeMismatch>,
    {
        loop {
            if let Update::Value { value, .. } = self.recv().await? {
                return Ok(T::try_from(&value)?);
            }
        }
    }

    /// Try to receive an update without waiting.
    pub fn try_recv(&mut self) -> Result<Update, SubscriberTryRecvError> {
        if self.closed.is_cancelled() {
            return Err(SubscriberTryRecvError::Closed);
        }
        if let Some(update) = self.backlog.pop_front() {
            return Ok(update);
        }
        Ok(self.inner.try_recv()?)
    }

    /// True if the handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.inner.is_closed()
    }

    /// Returns `true` if no updates are waiting.
    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty() && self.inner.is_empty()
    }

    /// Returns the number of updates currently waiting.
    pub fn len(&self) -> usize {
        self.backlog.len() + self.inner.len()
    }

    /// Another subscription to the same handle, starting from now.
    pub fn resubscribe(&self) -> Self {
        Self::new(self.inner.resubscribe(), self.closed.clone())
    }

    /// Returns true if two subscriptions belong to the same handle.
    pub fn same_channel(&self, other: &Self) -> bool {
        self.inner.same_channel(&other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[tokio::test]
    async fn close_discards_queued_updates() {
        let (tx, rx) = broadcast::channel(4);
        let closed = CancellationToken::new();
        let mut subscription = Subscription::new(rx, closed.clone());
        tx.send(Update::Connection(true)).unwrap();
        tx.send(Update::Value {
            timestamp: SystemTime::now(),
            value: Value::Int(vec![4]),
        })
        .unwrap();
        assert_eq!(subscription.len(), 2);
        assert!(matches!(subscription.recv().await, Ok(Update::Connection(true))));
        closed.cancel();
        assert!(matches!(subscription.recv().await, Err(SubscriberRecvError::Closed)));
        assert!(matches!(subscription.try_recv(), Err(SubscriberTryRecvError::Closed)));
        assert!(subscription.is_closed());
    }

    #[tokio::test]
    async fn typed_values() {
        let (tx, rx) = broadcast::channel(4);
        let mut subscription = Subscription::new(rx, CancellationToken::new());
        tx.send(Update::Connection(true)).unwrap();
        tx.send(Update::Value {
            timestamp: SystemTime::now(),
            value: Value::Real(vec![2.5]),
        })
        .unwrap();
        let value: f64 = subscription.recv_value().await.unwrap();
        assert_eq!(value, 2.5);
        tx.send(Update::Value {
            timestamp: SystemTime::now(),
            value: Value::Real(vec![1.0, 2.0]),
        })
        .unwrap();
        assert!(matches!(
            subscription.recv_value::<f64>().await,
            Err(SubscriberRecvError::NoConvert(_))
        ));
    }

    #[tokio::test]
    async fn backlog_comes_first() {
        let (tx, rx) = broadcast::channel(4);
        let mut subscription = Subscription::new(rx, CancellationToken::new())
            .with_backlog([Update::Connection(true)]);
        tx.send(Update::Connection(false)).unwrap();
        assert_eq!(subscription.len(), 2);
        assert!(matches!(subscription.try_recv(), Ok(Update::Connection(true))));
        assert!(matches!(subscription.recv().await, Ok(Update::Connection(false))));
        assert!(subscription.is_empty());
    }
}
