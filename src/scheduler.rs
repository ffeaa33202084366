//! Background worker that fires due debounced writes.
//!
//! Bindings register as weak references, so a binding that is dropped by
//! its owner simply falls out of the tick loop.

use crate::error::{CacheError, Result};
use crate::types::WriteOutcome;
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Something holding a debounced pending write.
pub trait Flushable: Send + Sync {
    /// Key used in logs.
    fn flush_key(&self) -> &str;

    /// Fire the pending write if its quiet period has elapsed.
    fn poll_due(&self) -> WriteOutcome;

    /// Fire the pending write now.
    fn flush_now(&self) -> WriteOutcome;
}

enum Command {
    Register(Weak<dyn Flushable>),
    FlushAll(Sender<usize>),
    Shutdown,
}

/// Handle to the flush thread. Dropping it flushes and stops the thread.
pub struct FlushWorker {
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Start the worker, ticking every `interval`.
    pub fn start(interval: Duration) -> Result<Self> {
        let (commands, rx) = unbounded::<Command>();

        let handle = thread::Builder::new()
            .name("statecache-flush".into())
            .spawn(move || {
                let mut targets: Vec<Weak<dyn Flushable>> = Vec::new();

                loop {
                    match rx.recv_timeout(interval) {
                        Ok(Command::Register(target)) => targets.push(target),
                        Ok(Command::FlushAll(ack)) => {
                            let flushed = flush_all(&targets);
                            let _ = ack.send(flushed);
                        }
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            flush_all(&targets);
                            debug!("flush worker stopped");
                            return;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            targets.retain(|t| t.strong_count() > 0);
                            for target in targets.iter().filter_map(Weak::upgrade) {
                                if let WriteOutcome::Failed = target.poll_due() {
                                    warn!(key = target.flush_key(), "background write failed");
                                }
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            commands,
            handle: Some(handle),
        })
    }

    /// Add a binding to the tick loop.
    pub fn register(&self, target: Weak<dyn Flushable>) -> Result<()> {
        self.commands
            .send(Command::Register(target))
            .map_err(|_| CacheError::WorkerStopped)
    }

    /// Flush every registered binding and wait for completion.
    ///
    /// Returns the number of writes that reached storage.
    pub fn flush_all(&self) -> Result<usize> {
        let (ack, done) = bounded(1);
        self.commands
            .send(Command::FlushAll(ack))
            .map_err(|_| CacheError::WorkerStopped)?;
        done.recv().map_err(|_| CacheError::WorkerStopped)
    }
}

fn flush_all(targets: &[Weak<dyn Flushable>]) -> usize {
    targets
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|t| t.flush_now().is_written())
        .count()
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Register a concrete binding with a worker.
pub fn register<T: Flushable + 'static>(worker: &FlushWorker, target: &Arc<T>) -> Result<()> {
    let target: Arc<dyn Flushable> = target.clone();
    worker.register(Arc::downgrade(&target))
}
