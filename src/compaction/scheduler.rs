//! Single-worker FIFO compaction scheduler.
//!
//! Tasks travel over a crossbeam channel to one dedicated thread that runs
//! them strictly one at a time through the registered executor. Stopping
//! sets a flag, closes the channel and joins the worker; tasks still queued
//! at that point are discarded.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam::channel::{self, Sender};
use tracing::{debug, info, warn};

use super::CompactionError;

/// Request to merge `target_level - 1` into `target_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionTask {
    pub target_level: usize,
}

pub struct CompactionScheduler {
    sender: Mutex<Option<Sender<CompactionTask>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl CompactionScheduler {
    /// Spawns the worker. `executor` returns whether the task did any work.
    pub fn start<F>(mut executor: F) -> Result<Self, CompactionError>
    where
        F: FnMut(CompactionTask) -> bool + Send + 'static,
    {
        let (tx, rx) = channel::unbounded::<CompactionTask>();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("littlekv-compaction".into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    if worker_stop.load(Ordering::Acquire) {
                        debug!(?task, "discarding compaction task after stop");
                        continue;
                    }
                    let done = executor(task);
                    debug!(?task, done, "compaction task finished");
                }
                debug!("compaction worker exiting");
            })?;

        info!("compaction scheduler started");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            stop,
        })
    }

    /// Queues a task. Returns `false` once the scheduler has stopped.
    pub fn enqueue_task(&self, task: CompactionTask) -> bool {
        let Ok(guard) = self.sender.lock() else {
            warn!("compaction sender lock poisoned");
            return false;
        };
        match guard.as_ref() {
            Some(tx) if !self.stop.load(Ordering::Acquire) => tx.send(task).is_ok(),
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Stops and joins the worker. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);

        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("compaction worker panicked");
            }
            info!("compaction scheduler stopped");
        }
    }
}

impl Drop for CompactionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
