//! Per-reader bounded work queue.
//!
//! Every reader of a stream gets one AsyncWriter: a bounded
//! single-producer single-consumer queue of fallible closures, drained by
//! a dedicated task. The producer (the stream's write path) never blocks;
//! when the queue is full the reader is flagged as overflowed and no
//! further work is accepted for it. The first error, whether an overflow
//! or a callback failure, latches and is surfaced through
//! [`AsyncWriter::error`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ReaderError;

/// Identity of a writer, used as the subscription key.
pub type WriterId = u64;

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// Work item: deliver one unit to one reader.
pub type WriteJob = Box<dyn FnOnce() -> Result<(), ReaderError> + Send>;

/// Terminal condition of an AsyncWriter.
#[derive(Error, Debug)]
pub enum AsyncWriterError {
    #[error("reader is too slow, discarding it")]
    QueueOverflow,

    #[error("{0}")]
    Callback(ReaderError),
}

pub struct AsyncWriter {
    id: WriterId,
    tx: mpsc::Sender<WriteJob>,
    rx: Mutex<Option<mpsc::Receiver<WriteJob>>>,
    error_tx: watch::Sender<Option<Arc<AsyncWriterError>>>,
    errored: AtomicBool,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWriter {
    pub fn new(queue_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (error_tx, _) = watch::channel(None);
        Arc::new(Self {
            id: NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            rx: Mutex::new(Some(rx)),
            error_tx,
            errored: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> WriterId {
        self.id
    }

    /// Spawn the drain task. Jobs run in FIFO order; the first failure
    /// stops the drain and latches the error.
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            return;
        };
        let this = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = rx.recv() => {
                        match job {
                            Some(job) => {
                                if let Err(err) = job() {
                                    this.set_error(AsyncWriterError::Callback(err));
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                    _ = this.cancel.cancelled() => return,
                }
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Enqueue a job without blocking. Returns false when the writer has
    /// already failed or its queue is full; a full queue latches
    /// [`AsyncWriterError::QueueOverflow`].
    pub fn push(&self, job: WriteJob) -> bool {
        if self.errored.load(Ordering::Relaxed) {
            return false;
        }

        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.set_error(AsyncWriterError::QueueOverflow);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Watch channel carrying the first error of this writer.
    pub fn error(&self) -> watch::Receiver<Option<Arc<AsyncWriterError>>> {
        self.error_tx.subscribe()
    }

    /// Stop the drain task and discard queued work.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn set_error(&self, err: AsyncWriterError) {
        if !self.errored.swap(true, Ordering::Relaxed) {
            let _ = self.error_tx.send(Some(Arc::new(err)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_fifo_order() {
        let writer = AsyncWriter::new(16);
        writer.start();

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            assert!(writer.push(Box::new(move || {
                log.lock().unwrap().push(i);
                Ok(())
            })));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        writer.stop().await;
    }

    #[tokio::test]
    async fn full_queue_latches_overflow_without_blocking() {
        // The drain is never started, so the queue fills up.
        let writer = AsyncWriter::new(4);

        let mut accepted = 0;
        for _ in 0..10 {
            if writer.push(Box::new(|| Ok(()))) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);

        let err = writer.error().borrow().clone();
        assert!(matches!(
            err.as_deref(),
            Some(AsyncWriterError::QueueOverflow)
        ));

        // After the overflow, pushes are rejected immediately.
        assert!(!writer.push(Box::new(|| Ok(()))));
    }

    #[tokio::test]
    async fn first_callback_error_stops_the_drain() {
        let writer = AsyncWriter::new(16);
        writer.start();

        let ran_after_error = Arc::new(AtomicUsize::new(0));

        writer.push(Box::new(|| Ok(())));
        writer.push(Box::new(|| Err("write failed".into())));
        let counter = ran_after_error.clone();
        writer.push(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut error_rx = writer.error();
        tokio::time::timeout(Duration::from_secs(1), error_rx.changed())
            .await
            .expect("error was not surfaced")
            .expect("error channel closed");

        let err = error_rx.borrow().clone();
        assert!(matches!(err.as_deref(), Some(AsyncWriterError::Callback(_))));
        assert_eq!(ran_after_error.load(Ordering::SeqCst), 0);
        writer.stop().await;
    }
}
