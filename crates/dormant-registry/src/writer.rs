//! Single-slot, coalescing write-behind worker.
//!
//! Mutations call [`WriteBehind::request`], which never blocks on I/O. At most
//! one write is pending at a time: requests that arrive while one is already
//! pending fold into it. The worker takes the snapshot when it starts the
//! write, not when the write was requested, so a write always reflects every
//! mutation that preceded it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::RegistryError;
use crate::store::SnapshotStore;

/// Produces the bytes to write, read at write time.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Result<Vec<u8>, RegistryError>;
}

/// Counters describing the worker's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Writes that reached the store.
    pub completed: u64,
    /// Writes that failed while encoding or storing.
    pub failed: u64,
    /// Requests folded into an already pending write.
    pub coalesced: u64,
}

type Ack = oneshot::Sender<Result<(), String>>;

#[derive(Default)]
struct PendingWrite {
    waiters: Vec<Ack>,
}

struct Slot {
    pending: Mutex<Option<PendingWrite>>,
    wake: Notify,
    closed: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }
}

/// Handle to the background writer.
pub struct WriteBehind {
    slot: Arc<Slot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBehind {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(source: Arc<dyn SnapshotSource>, store: Arc<dyn SnapshotStore>) -> Self {
        let slot = Arc::new(Slot::new());
        let task = tokio::spawn(run(Arc::clone(&slot), source, store));
        Self {
            slot,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask for the current state to be written. Returns immediately.
    pub fn request(&self) {
        {
            let mut pending = self.slot.pending.lock();
            if self.slot.closed.load(Ordering::SeqCst) {
                debug!("write requested after shutdown, ignoring");
                return;
            }
            if pending.is_some() {
                self.slot.coalesced.fetch_add(1, Ordering::Relaxed);
                trace!("coalescing write request");
            } else {
                *pending = Some(PendingWrite::default());
            }
        }
        self.slot.wake.notify_one();
    }

    /// Write the current state and wait for the outcome.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.slot.pending.lock();
            if self.slot.closed.load(Ordering::SeqCst) {
                return Err(RegistryError::WriterClosed);
            }
            pending.get_or_insert_with(PendingWrite::default).waiters.push(tx);
        }
        self.slot.wake.notify_one();

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(RegistryError::Persist(message)),
            Err(_) => Err(RegistryError::WriterClosed),
        }
    }

    /// Finish any pending write, then stop the worker.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "write-behind worker ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WriteStats {
        WriteStats {
            completed: self.slot.completed.load(Ordering::Relaxed),
            failed: self.slot.failed.load(Ordering::Relaxed),
            coalesced: self.slot.coalesced.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        {
            let _pending = self.slot.pending.lock();
            self.slot.closed.store(true, Ordering::SeqCst);
        }
        self.slot.wake.notify_one();
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WriteBehind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehind")
            .field("stats", &self.stats())
            .field("closed", &self.slot.closed.load(Ordering::SeqCst))
            .finish()
    }
}

async fn run(slot: Arc<Slot>, source: Arc<dyn SnapshotSource>, store: Arc<dyn SnapshotStore>) {
    debug!("write-behind worker started");

    loop {
        slot.wake.notified().await;

        loop {
            let next = slot.pending.lock().take();
            let Some(write) = next else {
                break;
            };

            let result = write_once(source.as_ref(), store.as_ref()).await;
            match &result {
                Ok(()) => {
                    slot.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    slot.failed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "job document write failed");
                }
            }

            let outcome = result.map_err(|e| e.to_string());
            for waiter in write.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }

        let done = {
            let pending = slot.pending.lock();
            slot.closed.load(Ordering::SeqCst) && pending.is_none()
        };
        if done {
            break;
        }
    }

    debug!("write-behind worker stopped");
}

async fn write_once(
    source: &dyn SnapshotSource,
    store: &dyn SnapshotStore,
) -> Result<(), RegistryError> {
    let bytes = source.snapshot()?;
    store.replace(bytes).await
}
