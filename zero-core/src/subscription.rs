//! Backpressured message streams with per-message acknowledgement.
//!
//! The change-stream pipeline and the per-client poke feeds all move data
//! through [`Subscription`]s: a bounded multi-producer, single-consumer
//! queue where every pushed message carries a one-shot result handle. The
//! handle resolves once the consumer has finished with the message, which
//! is what lets the multiplexer report "downstream has acknowledged" to
//! its producers.
//!
//! Cancellation is idempotent and hands any unconsumed messages to a
//! cleanup callback, so a terminating owner can drain or re-route what was
//! still in flight.

use std::{
    collections::VecDeque,
    ops::Deref,
    sync::{Arc, Mutex},
};

use tokio::sync::{oneshot, Semaphore};

const DEFAULT_CAPACITY: usize = 128;

type Cleanup<T> = Box<dyn FnOnce(Vec<T>) + Send + 'static>;

struct State<T> {
    queue: VecDeque<(T, oneshot::Sender<()>)>,
    /// All publishers dropped; drain what is queued, then end.
    finished: bool,
    /// Consumer cancelled; residual already handed to cleanup.
    cancelled: bool,
    cleanup: Option<Cleanup<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    /// Free queue slots. Closed on cancel so blocked pushers fail fast.
    space: Semaphore,
    /// Queued messages, plus one wake token at end-of-stream.
    items: Semaphore,
    publishers: Mutex<usize>,
}

/// Creates a subscription with the default queue capacity.
pub fn subscription<T>() -> (Publisher<T>, Subscription<T>) {
    subscription_with_capacity(DEFAULT_CAPACITY)
}

pub fn subscription_with_capacity<T>(capacity: usize) -> (Publisher<T>, Subscription<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            finished: false,
            cancelled: false,
            cleanup: None,
        }),
        space: Semaphore::new(capacity),
        items: Semaphore::new(0),
        publishers: Mutex::new(1),
    });
    (Publisher { inner: inner.clone() }, Subscription { inner })
}

/// Resolves once the consumer is done with the pushed message.
///
/// Yields `true` when the message was consumed and `false` when it was
/// still queued at cancellation time.
pub struct Acked(oneshot::Receiver<()>);

impl Acked {
    pub async fn wait(self) -> bool {
        self.0.await.is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("subscription closed")]
pub struct Closed<T>(pub T);

pub struct Publisher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        *self.inner.publishers.lock().expect("publisher count") += 1;
        Publisher { inner: self.inner.clone() }
    }
}

impl<T> Publisher<T> {
    /// Enqueues a message, waiting for queue space. The returned handle
    /// resolves when the consumer has processed the message.
    pub async fn push(&self, value: T) -> Result<Acked, Closed<T>> {
        let permit = match self.inner.space.acquire().await {
            Ok(p) => p,
            Err(_) => return Err(Closed(value)),
        };
        // The slot is returned when the consumer dequeues, not when this
        // permit would be dropped.
        permit.forget();

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().expect("subscription state");
            if state.cancelled {
                return Err(Closed(value));
            }
            state.queue.push_back((value, tx));
        }
        self.inner.items.add_permits(1);
        Ok(Acked(rx))
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        let mut count = self.inner.publishers.lock().expect("publisher count");
        *count -= 1;
        if *count == 0 {
            self.inner
                .state
                .lock()
                .expect("subscription state")
                .finished = true;
            // Wake token so a blocked consumer observes end-of-stream.
            self.inner.items.add_permits(1);
        }
    }
}

/// A message checked out of a subscription. Dropping it acknowledges the
/// message back to its producer.
pub struct Envelope<T> {
    value: Option<T>,
    done: Option<oneshot::Sender<()>>,
}

impl<T> Envelope<T> {
    /// Consumes the envelope, acknowledging immediately.
    pub fn into_value(mut self) -> T {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        self.value.take().expect("value present until into_value")
    }
}

impl<T> Deref for Envelope<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
            .as_ref()
            .expect("value present until into_value")
    }
}

impl<T> Drop for Envelope<T> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

pub struct Subscription<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Subscription<T> {
    /// Registers the callback invoked with all unconsumed messages when
    /// the subscription is cancelled.
    pub fn set_cleanup(&mut self, cleanup: impl FnOnce(Vec<T>) + Send + 'static) {
        self.inner
            .state
            .lock()
            .expect("subscription state")
            .cleanup = Some(Box::new(cleanup));
    }

    /// Receives the next message. Returns `None` once all publishers are
    /// gone and the queue is drained, or after cancellation.
    pub async fn recv(&mut self) -> Option<Envelope<T>> {
        loop {
            let permit = match self.inner.items.acquire().await {
                Ok(p) => p,
                Err(_) => return None,
            };
            permit.forget();

            let mut state = self.inner.state.lock().expect("subscription state");
            if state.cancelled {
                drop(state);
                // Keep the wake token alive so later calls also return.
                self.inner.items.add_permits(1);
                return None;
            }
            match state.queue.pop_front() {
                Some((value, done)) => {
                    drop(state);
                    self.inner.space.add_permits(1);
                    return Some(Envelope { value: Some(value), done: Some(done) });
                }
                None if state.finished => {
                    drop(state);
                    self.inner.items.add_permits(1);
                    return None;
                }
                // Spurious wake token; keep waiting.
                None => continue,
            }
        }
    }

    /// Cancels the subscription. Idempotent. Unconsumed messages are
    /// passed to the cleanup callback; their result handles resolve as
    /// unconsumed.
    pub fn cancel(&mut self) {
        let (residual, cleanup) = {
            let mut state = self.inner.state.lock().expect("subscription state");
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            let residual: Vec<T> = state
                .queue
                .drain(..)
                .map(|(value, _done)| value)
                .collect();
            (residual, state.cleanup.take())
        };
        // Fail blocked and future pushers fast.
        self.inner.space.close();
        // Wake a blocked recv so it observes the cancellation.
        self.inner.items.add_permits(1);
        if let Some(cleanup) = cleanup {
            cleanup(residual);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_acks_on_drop() {
        let (publisher, mut sub) = subscription();
        let a1 = publisher.push(1u32).await.unwrap();
        let a2 = publisher.push(2u32).await.unwrap();

        let m1 = sub.recv().await.unwrap();
        assert_eq!(*m1, 1);
        drop(m1);
        assert!(a1.wait().await);

        let m2 = sub.recv().await.unwrap();
        assert_eq!(m2.into_value(), 2);
        assert!(a2.wait().await);
    }

    #[tokio::test]
    async fn push_blocks_at_capacity() {
        let (publisher, mut sub) = subscription_with_capacity(1);
        publisher.push(1u32).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), publisher.push(2)).await;
        assert!(blocked.is_err(), "second push should wait for space");

        let first = sub.recv().await.unwrap().into_value();
        assert_eq!(first, 1);
        publisher.push(2).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().into_value(), 2);
    }

    #[tokio::test]
    async fn end_of_stream_after_publishers_drop() {
        let (publisher, mut sub) = subscription();
        publisher.push("a").await.unwrap();
        drop(publisher);

        assert_eq!(sub.recv().await.unwrap().into_value(), "a");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_hands_residual_to_cleanup() {
        let (publisher, mut sub) = subscription();
        let (tx, rx) = mpsc::channel();
        sub.set_cleanup(move |residual| tx.send(residual).unwrap());

        publisher.push(1u32).await.unwrap();
        let pending = publisher.push(2u32).await.unwrap();

        sub.cancel();
        sub.cancel(); // idempotent

        assert_eq!(rx.recv().unwrap(), vec![1, 2]);
        assert!(!pending.wait().await, "queued message was not consumed");
        assert!(publisher.push(3).await.is_err(), "push after cancel fails fast");
        assert!(sub.recv().await.is_none());
    }
}
