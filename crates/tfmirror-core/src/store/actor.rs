//! Store actor
//!
//! SQLite connections are not `Sync`, so the [`StateDb`] lives on a dedicated
//! thread and async callers hand it closures over a channel. Each closure runs
//! to completion before the next one starts, which serializes every read and
//! write against the database.

use std::fmt;
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;

use super::db::{DbError, StateDb};

type Job = Box<dyn FnOnce(&mut StateDb) + Send>;

/// Messages understood by the actor thread
enum StoreEvent {
    Call(Job),
    Shutdown,
}

impl fmt::Debug for StoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(_) => f.write_str("Call"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A handle to the store actor that is Send + Sync and Clone.
#[derive(Clone)]
pub struct StoreHandle {
    sender: mpsc::Sender<StoreEvent>,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

impl StoreHandle {
    /// Open the database at `path` and spawn the actor thread.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        Self::spawn(StateDb::open_at(path)?)
    }

    /// Spawn the actor around an already-open database.
    pub fn spawn(db: StateDb) -> Result<Self, DbError> {
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("tfmirror-store".into())
            .spawn(move || run_store_loop(db, receiver))?;
        Ok(Self { sender })
    }

    /// Run `f` against the database on the actor thread.
    pub async fn call<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateDb) -> Result<T, DbError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |db| {
            let _ = tx.send(f(db));
        });
        self.sender
            .send(StoreEvent::Call(job))
            .map_err(|_| DbError::ActorDied)?;
        rx.await.map_err(|_| DbError::ActorDied)?
    }

    /// Ask the actor to stop after the jobs already queued.
    pub fn shutdown(&self) {
        let _ = self.sender.send(StoreEvent::Shutdown);
    }
}

#[allow(clippy::needless_pass_by_value)]
fn run_store_loop(mut db: StateDb, receiver: mpsc::Receiver<StoreEvent>) {
    while let Ok(event) = receiver.recv() {
        match event {
            StoreEvent::Call(job) => job(&mut db),
            StoreEvent::Shutdown => break,
        }
    }
    tracing::debug!("store actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_calls_run_in_order() {
        let dir = tempdir().unwrap();
        let handle = StoreHandle::open(&dir.path().join("state.db")).unwrap();

        let configs = handle.call(|db| db.list_configs()).await.unwrap();
        assert!(configs.is_empty());

        let n = handle.call(|_| Ok(41 + 1)).await.unwrap();
        assert_eq!(n, 42);
    }

    #[tokio::test]
    async fn test_call_after_shutdown_fails() {
        let handle = StoreHandle::spawn(StateDb::open_in_memory().unwrap()).unwrap();
        handle.shutdown();
        // Give the thread a moment to drain and exit.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let err = handle.call(|db| db.list_configs()).await.unwrap_err();
        assert!(matches!(err, DbError::ActorDied));
    }
}
