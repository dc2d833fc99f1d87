//! Asynchronous dispatch to a dedicated store thread
//!
//! Latency-sensitive threads must not block on storage I/O or on the file
//! lock. A [`StoreWorker`] owns a [`DataStore`] on its own thread and runs
//! submitted jobs there, one at a time and in submission order. Results come
//! back through a [`Pending`] handle or a completion callback.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::DataStore;
use crate::error::{DataAccessError, Result};

type Job = Box<dyn FnOnce(&DataStore) + Send>;

fn worker_stopped() -> DataAccessError {
    DataAccessError::connection("store worker", "worker stopped before completing the job")
}

/// Result of a submitted job, delivered once the worker has run it
///
/// Dropping a `Pending` abandons the result; the job itself still runs to
/// completion.
pub struct Pending<R> {
    rx: Receiver<Result<R>>,
}

impl<R> Pending<R> {
    /// Block until the result is available
    pub fn wait(self) -> Result<R> {
        self.rx.recv().map_err(|_| worker_stopped())?
    }

    /// Block for at most `timeout`; `None` if the job has not finished yet
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(worker_stopped())),
        }
    }

    /// Take the result if it is ready, without blocking
    pub fn try_take(&self) -> Option<Result<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(worker_stopped())),
        }
    }
}

/// Dedicated thread owning one [`DataStore`]
pub struct StoreWorker {
    sender: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl StoreWorker {
    /// Start the worker; `open` runs on the worker thread
    ///
    /// The store is opened (and migrated) before this returns, so open and
    /// migration errors are reported here.
    pub fn spawn<F>(open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<DataStore> + Send + 'static,
    {
        let (sender, jobs) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name("dataaccess-worker".to_string())
            .spawn(move || {
                let store = match open() {
                    Ok(store) => store,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                info!("store worker started for {}", store.handle().location());

                for job in jobs {
                    job(&store);
                }

                if let Err(e) = store.close() {
                    warn!("store worker failed to close its store: {}", e);
                }
                debug!("store worker exiting");
            })
            .map_err(|e| DataAccessError::connection("store worker", e))?;

        let startup = ready_rx.recv().unwrap_or_else(|_| {
            Err(DataAccessError::connection(
                "store worker",
                "worker thread exited during startup",
            ))
        });
        match startup {
            Ok(()) => Ok(Self {
                sender: Some(sender),
                thread: Some(thread),
            }),
            Err(e) => {
                if thread.join().is_err() {
                    warn!("store worker panicked during startup");
                }
                Err(e)
            }
        }
    }

    fn dispatch(&self, job: Job) -> bool {
        match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Queue `f` and return a handle to its result
    pub fn submit<R, F>(&self, f: F) -> Pending<R>
    where
        R: Send + 'static,
        F: FnOnce(&DataStore) -> Result<R> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move |store: &DataStore| {
            // the receiver is gone if the caller abandoned the result
            let _ = tx.send(f(store));
        });
        if !self.dispatch(job) {
            debug!("job submitted to a stopped store worker");
        }
        Pending { rx }
    }

    /// Queue `f` and hand its result to `callback` on the worker thread
    ///
    /// Fails without running anything if the worker has stopped.
    pub fn submit_with_callback<R, F, C>(&self, f: F, callback: C) -> Result<()>
    where
        F: FnOnce(&DataStore) -> Result<R> + Send + 'static,
        C: FnOnce(Result<R>) + Send + 'static,
    {
        let job: Job = Box::new(move |store: &DataStore| callback(f(store)));
        if self.dispatch(job) {
            Ok(())
        } else {
            Err(worker_stopped())
        }
    }
}

impl Drop for StoreWorker {
    /// Finish every queued job, then stop the thread
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("store worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;
    use crate::database::core::{ConnectionManager, DatabaseLocation, MigrationStep};
    use crate::database::mapper::Value;

    const STEPS: &[MigrationStep] = &[MigrationStep::new(
        1,
        "create events",
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    )];

    fn memory_worker() -> StoreWorker {
        StoreWorker::spawn(|| DataStore::open_in_memory(STEPS)).unwrap()
    }

    #[test]
    fn test_submit_and_wait() {
        let worker = memory_worker();
        let inserted = worker.submit(|store| {
            store.execute("INSERT INTO events (name) VALUES (?1)", &["spawn".into()])
        });
        assert_eq!(inserted.wait().unwrap(), 1);

        let count = worker.submit(|store| store.scalar("SELECT COUNT(*) FROM events", &[]));
        assert_eq!(count.wait().unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_errors_are_delivered() {
        let worker = memory_worker();
        let pending = worker.submit(|store| store.records("SELECT * FROM nowhere", &[]));
        assert!(matches!(pending.wait(), Err(DataAccessError::Syntax { .. })));
    }

    #[test]
    fn test_callback_and_polling() {
        let worker = memory_worker();
        let (tx, rx) = mpsc::channel();
        worker
            .submit_with_callback(
                |store| store.execute("INSERT INTO events (name) VALUES ('load')", &[]),
                move |result| tx.send(result).unwrap(),
            )
            .unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), 1);

        // the worker runs one job at a time, so the second stays pending
        // until the first releases the barrier
        let gate = Arc::new(Barrier::new(2));
        let job_gate = Arc::clone(&gate);
        let blocked = worker.submit(move |_| {
            job_gate.wait();
            Ok(())
        });
        let after = worker.submit(|store| store.scalar("SELECT COUNT(*) FROM events", &[]));
        assert!(after.try_take().is_none());
        assert!(after.wait_timeout(Duration::from_millis(20)).is_none());

        gate.wait();
        blocked.wait().unwrap();
        assert_eq!(after.wait().unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_abandoned_job_still_runs() {
        let worker = memory_worker();
        drop(worker.submit(|store| {
            store.execute("INSERT INTO events (name) VALUES ('ignored')", &[])
        }));
        let count = worker.submit(|store| store.scalar("SELECT COUNT(*) FROM events", &[]));
        assert_eq!(count.wait().unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_startup_failure_is_reported() {
        let broken = [MigrationStep::new(1, "broken", "CREATE TABLE (")];
        let result = StoreWorker::spawn(move || DataStore::open_in_memory(&broken));
        assert!(matches!(result, Err(DataAccessError::Migration { .. })));
    }

    #[test]
    fn test_worker_on_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.db");
        let manager = Arc::new(ConnectionManager::default());

        let worker_manager = Arc::clone(&manager);
        let worker_path = path.clone();
        let worker = StoreWorker::spawn(move || {
            DataStore::open(&worker_manager, DatabaseLocation::file(&worker_path), STEPS)
        })
        .unwrap();
        worker
            .submit(|store| store.execute("INSERT INTO events (name) VALUES ('saved')", &[]))
            .wait()
            .unwrap();
        drop(worker);

        let store = DataStore::open(&manager, DatabaseLocation::file(&path), STEPS).unwrap();
        assert_eq!(
            store.scalar("SELECT name FROM events", &[]).unwrap(),
            Value::from("saved")
        );
    }
}
