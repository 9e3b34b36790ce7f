//! Bounded MPMC channels linking pipeline stages.
//!
//! Every stage owns one output channel; the next stage's workers share a
//! read handle to it. A capacity of zero means unbounded (the default, to
//! avoid surprising deadlocks); a positive capacity provides backpressure
//! so a fast producer cannot outpace a slow consumer.

use thiserror::Error;

/// Error returned by [`Channel::put`] on a closed channel.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("put on closed channel")]
pub struct ChannelClosed;

/// A thread-safe FIFO connecting one stage's output to the next stage's
/// input. Cheap to clone; all clones refer to the same queue.
#[derive(Debug)]
pub struct Channel<T> {
    tx: async_channel::Sender<T>,
    rx: async_channel::Receiver<T>,
}

impl<T> Channel<T> {
    /// Create a channel. `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = if capacity == 0 {
            async_channel::unbounded()
        } else {
            async_channel::bounded(capacity)
        };
        Self { tx, rx }
    }

    /// Enqueue an item, suspending while the channel is full.
    ///
    /// Fails if the channel has been closed; the item is dropped.
    pub async fn put(&self, item: T) -> Result<(), ChannelClosed> {
        self.tx.send(item).await.map_err(|_| ChannelClosed)
    }

    /// Dequeue the oldest item, suspending while the channel is empty.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub async fn get(&self) -> Option<T> {
        self.rx.recv().await.ok()
    }

    /// Mark the channel closed for further writes. Pending readers observe
    /// end-of-stream once the buffer is drained. Idempotent; returns `true`
    /// if this call performed the close.
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the buffer is currently empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// The configured capacity, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    /// A raw receive handle, for code that polls the channel as a stream.
    pub(crate) fn receiver(&self) -> async_channel::Receiver<T> {
        self.rx.clone()
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let ch = Channel::new(0);
        ch.put(1).await.unwrap();
        ch.put(2).await.unwrap();
        ch.put(3).await.unwrap();

        assert_eq!(ch.get().await, Some(1));
        assert_eq!(ch.get().await, Some(2));
        assert_eq!(ch.get().await, Some(3));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let ch = Channel::<u32>::new(0);
        assert!(ch.close());
        assert!(!ch.close());
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn test_put_after_close_fails() {
        let ch = Channel::new(0);
        ch.put(1).await.unwrap();
        ch.close();

        assert_eq!(ch.put(2).await, Err(ChannelClosed));
    }

    #[tokio::test]
    async fn test_get_drains_buffer_after_close() {
        let ch = Channel::new(4);
        ch.put("a").await.unwrap();
        ch.put("b").await.unwrap();
        ch.close();

        assert_eq!(ch.get().await, Some("a"));
        assert_eq!(ch.get().await, Some("b"));
        assert_eq!(ch.get().await, None);
    }

    #[tokio::test]
    async fn test_bounded_put_suspends_until_space() {
        let ch = Channel::new(1);
        ch.put(1).await.unwrap();

        let writer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.put(2).await })
        };

        // The second put cannot complete until we make room.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        assert_eq!(ch.get().await, Some(1));
        writer.await.unwrap().unwrap();
        assert_eq!(ch.get().await, Some(2));
    }

    #[tokio::test]
    async fn test_capacity_reported() {
        assert_eq!(Channel::<u8>::new(0).capacity(), None);
        assert_eq!(Channel::<u8>::new(5).capacity(), Some(5));
    }
}
