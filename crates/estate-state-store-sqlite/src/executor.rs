//! Runs SQLite work on a dedicated thread.
//!
//! The connection never leaves the executor thread. Callers submit closures over a channel
//! and await the result through a oneshot, so no lock is held across an await point.

use std::sync::mpsc;
use std::thread;

use rusqlite::Connection;
use tokio::sync::oneshot;

use crate::StorageError;

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Cloneable handle to the executor thread. The thread exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    sender: mpsc::Sender<Job>,
}

impl SqliteExecutor {
    /// Move `conn` onto a new executor thread.
    ///
    /// # Errors
    /// Returns an error when the thread cannot be spawned.
    pub fn spawn(mut conn: Connection) -> Result<Self, StorageError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        thread::Builder::new().name("estate-sqlite".to_string()).spawn(move || {
            while let Ok(job) = receiver.recv() {
                job(&mut conn);
            }
            tracing::debug!("sqlite executor stopped");
        })?;
        Ok(Self { sender })
    }

    /// Run `op` on the executor thread and await its result.
    ///
    /// # Errors
    /// Returns the error produced by `op`, or [`StorageError::ExecutorClosed`] when the
    /// executor thread is gone.
    pub async fn run<F, T>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = response_tx.send(op(conn));
        });
        self.sender.send(job).map_err(|_| StorageError::ExecutorClosed)?;
        response_rx.await.map_err(|_| StorageError::ExecutorClosed)?
    }
}
