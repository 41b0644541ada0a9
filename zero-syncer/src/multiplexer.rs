//! Serializing concurrent change producers onto one output stream.
//!
//! The streaming decoder and any number of backfill streams all feed the
//! replicator, but row changes from different producers must never
//! interleave inside one transaction burst. Producers therefore
//! `reserve` the output before their `begin` and `release` it with their
//! commit watermark after their `commit`/`rollback`; waiters are granted
//! the output in FIFO order, each learning the watermark the previous
//! producer reached.
//!
//! `last_watermark == None` encodes "currently reserved".

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::oneshot;
use zero_core::{
    change::ChangeStreamMessage,
    subscription::{subscription_with_capacity, Acked, Closed, Publisher, Subscription},
    version::StateVersion,
};

const OUTPUT_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("push without an active reservation")]
    NotReserved,
    #[error("push of a non-status message through pushStatus")]
    NotAStatusMessage,
    #[error("output stream closed")]
    OutputClosed,
}

impl<T> From<Closed<T>> for MuxError {
    fn from(_: Closed<T>) -> Self {
        MuxError::OutputClosed
    }
}

struct MuxState {
    /// `Some` holds the watermark of the last released producer; `None`
    /// means a producer currently owns the output.
    last_watermark: Option<StateVersion>,
    waiters: VecDeque<oneshot::Sender<StateVersion>>,
}

#[derive(Clone)]
pub struct Multiplexer {
    state: Arc<Mutex<MuxState>>,
    output: Publisher<ChangeStreamMessage>,
}

impl Multiplexer {
    /// Creates the multiplexer starting from `initial_watermark` and the
    /// consumer side of its output.
    pub fn new(initial_watermark: StateVersion) -> (Self, Subscription<ChangeStreamMessage>) {
        let (output, consumer) = subscription_with_capacity(OUTPUT_CAPACITY);
        let mux = Multiplexer {
            state: Arc::new(Mutex::new(MuxState {
                last_watermark: Some(initial_watermark),
                waiters: VecDeque::new(),
            })),
            output,
        };
        (mux, consumer)
    }

    /// Acquires exclusive use of the output, resolving to the watermark
    /// the previous holder released at. Waiters are served FIFO.
    pub async fn reserve(&self) -> StateVersion {
        let waiter = {
            let mut state = self.state.lock().expect("mux state");
            match state.last_watermark.take() {
                Some(watermark) => return watermark,
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    rx
                }
            }
        };
        waiter
            .await
            .expect("multiplexer dropped while reserved")
    }

    /// Releases the output at `new_watermark`, handing it to the next
    /// waiter if any.
    pub fn release(&self, new_watermark: StateVersion) {
        let mut state = self.state.lock().expect("mux state");
        debug_assert!(state.last_watermark.is_none(), "release without reservation");
        let mut watermark = new_watermark;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(watermark) {
                // The waiter now owns the reservation.
                Ok(()) => return,
                // Waiter went away; keep the watermark for the next one.
                Err(returned) => watermark = returned,
            }
        }
        state.last_watermark = Some(watermark);
    }

    /// Pushes a message of the currently reserved transaction. Fails fast
    /// when no reservation is held.
    pub async fn push(&self, message: ChangeStreamMessage) -> Result<Acked, MuxError> {
        {
            let state = self.state.lock().expect("mux state");
            if state.last_watermark.is_some() {
                return Err(MuxError::NotReserved);
            }
        }
        Ok(self.output.push(message).await?)
    }

    /// Pushes a status or control message; allowed with or without a
    /// reservation since these carry no data-change semantics.
    pub async fn push_status(&self, message: ChangeStreamMessage) -> Result<Acked, MuxError> {
        if !matches!(
            message,
            ChangeStreamMessage::Status(_) | ChangeStreamMessage::Control(_)
        ) {
            return Err(MuxError::NotAStatusMessage);
        }
        Ok(self.output.push(message).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use zero_core::{
        change::{ControlMessage, DataChange, Relation, ReplicaIdentity, RowKeySpec, TableId},
        version::Lsn,
    };

    use super::*;

    fn version(n: u64) -> StateVersion {
        StateVersion::from_lsn(Lsn(n))
    }

    fn insert(table: &str) -> ChangeStreamMessage {
        ChangeStreamMessage::Data(DataChange::Insert {
            relation: Relation {
                id: TableId::new("public", table),
                oid: 1,
                row_key: RowKeySpec {
                    columns: vec!["id".to_string()],
                    identity: ReplicaIdentity::Default,
                },
                columns: vec![],
            },
            new: Default::default(),
        })
    }

    #[tokio::test]
    async fn reserve_returns_previous_watermark() {
        let (mux, _consumer) = Multiplexer::new(version(100));
        assert_eq!(mux.reserve().await, version(100));
        mux.release(version(101));
        assert_eq!(mux.reserve().await, version(101));
    }

    #[tokio::test]
    async fn push_without_reservation_fails_fast() {
        let (mux, _consumer) = Multiplexer::new(version(100));
        let err = mux.push(insert("foo")).await.unwrap_err();
        assert!(matches!(err, MuxError::NotReserved));

        // Status messages are exempt.
        mux.push_status(ChangeStreamMessage::Control(ControlMessage::ResetRequired))
            .await
            .unwrap();
        let err = mux.push_status(insert("foo")).await.unwrap_err();
        assert!(matches!(err, MuxError::NotAStatusMessage));
    }

    #[tokio::test]
    async fn transactions_from_concurrent_producers_stay_contiguous() {
        let (mux, mut consumer) = Multiplexer::new(version(100));

        let streaming = {
            let mux = mux.clone();
            tokio::spawn(async move {
                let resume_at = mux.reserve().await;
                assert_eq!(resume_at, version(100));
                mux.push(ChangeStreamMessage::Begin { commit_watermark: version(101) })
                    .await
                    .unwrap();
                // Hold the reservation long enough for the backfill
                // producer to queue up behind us.
                tokio::time::sleep(Duration::from_millis(50)).await;
                mux.push(insert("foo")).await.unwrap();
                mux.push(ChangeStreamMessage::Commit { watermark: version(101) })
                    .await
                    .unwrap();
                mux.release(version(101));
            })
        };

        // Give the streaming producer time to win the reservation.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let backfill = {
            let mux = mux.clone();
            tokio::spawn(async move {
                let resume_at = mux.reserve().await;
                // Granted only after the streaming txn released.
                assert_eq!(resume_at, version(101));
                mux.push(ChangeStreamMessage::Begin { commit_watermark: version(102) })
                    .await
                    .unwrap();
                mux.push(insert("bar")).await.unwrap();
                mux.push(ChangeStreamMessage::Commit { watermark: version(102) })
                    .await
                    .unwrap();
                mux.release(version(102));
            })
        };

        streaming.await.unwrap();
        backfill.await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..6 {
            let message = consumer.recv().await.unwrap();
            kinds.push(match &*message {
                ChangeStreamMessage::Begin { commit_watermark } => {
                    format!("begin:{commit_watermark}")
                }
                ChangeStreamMessage::Data(_) => "data".to_string(),
                ChangeStreamMessage::Commit { watermark } => format!("commit:{watermark}"),
                other => panic!("unexpected message {other:?}"),
            });
        }
        assert_eq!(
            kinds,
            vec![
                format!("begin:{}", version(101)),
                "data".to_string(),
                format!("commit:{}", version(101)),
                format!("begin:{}", version(102)),
                "data".to_string(),
                format!("commit:{}", version(102)),
            ]
        );
    }

    #[tokio::test]
    async fn push_result_resolves_on_consumption() {
        let (mux, mut consumer) = Multiplexer::new(version(100));
        mux.reserve().await;
        let acked = mux
            .push(ChangeStreamMessage::Begin { commit_watermark: version(101) })
            .await
            .unwrap();
        let message = consumer.recv().await.unwrap();
        drop(message);
        assert!(acked.wait().await);
    }
}
