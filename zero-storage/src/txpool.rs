//! A pool of long-running read transactions on the replica.
//!
//! Query hydration wants many point reads against one consistent
//! snapshot without re-opening transactions per read. The pool pins N
//! read transactions at construction time (all at the same
//! `stateVersion`) and executes submitted tasks on whichever worker is
//! free; tasks queue when all workers are busy. `set_done` stops intake
//! and lets workers drain and exit.

use std::{
    path::Path,
    sync::{mpsc, Arc, Mutex},
    thread,
};

use rusqlite::Connection;
use tracing::debug;
use zero_core::version::StateVersion;

use crate::replica::{open_read_only, state_version, ReplicaError};

type Task = Box<dyn FnOnce(&Connection) + Send + 'static>;

pub struct TransactionPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    version: StateVersion,
    size: usize,
}

impl TransactionPool {
    /// Opens `size` read transactions pinned at the replica's current
    /// version.
    pub fn new(path: impl AsRef<Path>, size: usize) -> Result<Self, ReplicaError> {
        assert!(size > 0, "pool needs at least one worker");
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut version: Option<StateVersion> = None;
        for worker in 0..size {
            let conn = open_read_only(path.as_ref())?;
            conn.execute_batch("BEGIN")?;
            let pinned = state_version(&conn)?;
            version.get_or_insert(pinned);

            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("replica-read-{worker}"))
                .spawn(move || {
                    loop {
                        let task = {
                            let receiver = receiver.lock().expect("pool receiver");
                            receiver.recv()
                        };
                        match task {
                            Ok(task) => task(&conn),
                            Err(_) => break,
                        }
                    }
                    let _ = conn.execute_batch("ROLLBACK");
                    debug!(worker, "read pool worker done");
                })
                .expect("spawn read pool worker");
        }

        Ok(TransactionPool {
            sender: Mutex::new(Some(sender)),
            version: version.expect("size > 0"),
            size,
        })
    }

    /// The state version every worker is pinned at.
    pub fn version(&self) -> &StateVersion {
        &self.version
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs a read task on the next free worker.
    pub async fn process_read_task<R, F>(&self, task: F) -> Result<R, ReplicaError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, ReplicaError> + Send + 'static,
    {
        let (done, result) = tokio::sync::oneshot::channel();
        {
            let sender = self.sender.lock().expect("pool sender");
            let sender = sender.as_ref().ok_or(ReplicaError::PoolClosed)?;
            sender
                .send(Box::new(move |conn| {
                    let _ = done.send(task(conn));
                }))
                .map_err(|_| ReplicaError::PoolClosed)?;
        }
        result.await.map_err(|_| ReplicaError::PoolClosed)?
    }

    /// Stops intake. Queued tasks still run; workers then roll back their
    /// transactions and exit.
    pub fn set_done(&self) {
        self.sender
            .lock()
            .expect("pool sender")
            .take();
    }
}

impl Drop for TransactionPool {
    fn drop(&mut self) {
        self.set_done();
    }
}

#[cfg(test)]
mod tests {
    use zero_core::change::DataChange;

    use crate::replica::{test_support::*, Replica};

    use super::*;

    fn setup() -> (tempfile::TempDir, Replica) {
        let dir = tempfile::tempdir().unwrap();
        let mut replica = Replica::open(dir.path().join("replica.db")).unwrap();
        let mut tx = replica.begin(version(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        tx.apply(&insert_foo(1, "one")).unwrap();
        tx.commit().unwrap();
        (dir, replica)
    }

    #[tokio::test]
    async fn runs_tasks_on_the_pinned_snapshot() {
        let (dir, mut replica) = setup();
        let pool = TransactionPool::new(dir.path().join("replica.db"), 3).unwrap();
        assert_eq!(pool.version(), &version(100));

        // A write after pool creation is invisible to the pool.
        let mut tx = replica.begin(version(101)).unwrap();
        tx.apply(&insert_foo(2, "two")).unwrap();
        tx.commit().unwrap();

        let count = pool
            .process_read_task(|conn| {
                Ok(conn
                    .query_row("SELECT count(*) FROM foo", [], |r| r.get::<_, i64>(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn concurrent_tasks_share_the_workers() {
        let (dir, _replica) = setup();
        let pool = Arc::new(TransactionPool::new(dir.path().join("replica.db"), 2).unwrap());

        let mut handles = Vec::new();
        for i in 0..8i64 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.process_read_task(move |conn| {
                    Ok(conn.query_row("SELECT ?1 + 1", [i], |r| r.get::<_, i64>(0))?)
                })
                .await
                .unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i as i64 + 1);
        }
    }

    #[tokio::test]
    async fn set_done_stops_intake() {
        let (dir, _replica) = setup();
        let pool = TransactionPool::new(dir.path().join("replica.db"), 1).unwrap();
        pool.set_done();
        let err = pool
            .process_read_task(|_conn| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::PoolClosed));
    }
}
