//! Bounded FIFO job queue drained by a fixed set of worker tasks
//!
//! # Architecture
//!
//! ```text
//! AsyncProcessor
//! ├─ queue:   mpsc(queue_capacity)  (submit blocks or fails when full)
//! ├─ workers: N tasks sharing the receiver, FIFO dequeue
//! └─ handler: JobHandler            (the execution pipeline)
//! ```
//!
//! Every accepted job is answered exactly once: with the handler's result,
//! or with `Cancelled` if shutdown kills it before it finishes.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::sandbox::{ExecutionRequest, ExecutionResult};

/// Work performed for every dequeued request
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, request: ExecutionRequest) -> Result<ExecutionResult>;
}

struct Job {
    request: ExecutionRequest,
    reply: oneshot::Sender<Result<ExecutionResult>>,
}

/// Handle to a submitted request's eventual result
#[derive(Debug)]
pub struct PendingExecution {
    correlation_id: Uuid,
    rx: oneshot::Receiver<Result<ExecutionResult>>,
}

impl PendingExecution {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wait for the result
    pub async fn wait(self) -> Result<ExecutionResult> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled(format!(
                "request {} was cancelled during shutdown",
                self.correlation_id
            ))),
        }
    }
}

/// Queue and worker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub capacity: usize,
    pub workers: usize,
    pub accepting: bool,
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub completed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

/// Shutdown may zero a gauge while a worker is finishing
fn decrement(gauge: &AtomicUsize) {
    let _ = gauge.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
}

/// Async request processor
pub struct AsyncProcessor {
    config: ProcessorConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl AsyncProcessor {
    /// Start the workers. Must be called inside a Tokio runtime.
    pub fn new(config: ProcessorConfig, handler: Arc<dyn JobHandler>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers.max(1))
            .map(|index| {
                tokio::spawn(Self::worker_loop(
                    index,
                    receiver.clone(),
                    handler.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        info!(
            "Processor started with {} workers, queue capacity {}",
            config.workers, config.queue_capacity
        );

        AsyncProcessor {
            config,
            sender: Mutex::new(Some(tx)),
            receiver,
            workers: Mutex::new(workers),
            counters,
        }
    }

    async fn worker_loop(
        index: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
        handler: Arc<dyn JobHandler>,
        counters: Arc<Counters>,
    ) {
        loop {
            let job = {
                let mut rx = receiver.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                debug!("Worker {} exiting, queue closed", index);
                break;
            };

            decrement(&counters.queued);
            counters.in_flight.fetch_add(1, Ordering::SeqCst);
            let result = handler.handle(job.request).await;
            decrement(&counters.in_flight);
            counters.completed.fetch_add(1, Ordering::SeqCst);

            // The submitter may have stopped waiting
            let _ = job.reply.send(result);
        }
    }

    /// Enqueue a request.
    ///
    /// A full queue fails at once with `QueueFull`, or after `submit_timeout`
    /// when one is configured. Fails with `ShuttingDown` once shutdown began.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<PendingExecution> {
        let sender = self.sender.lock().clone().ok_or(Error::ShuttingDown)?;

        let correlation_id = request.correlation_id;
        let (reply, rx) = oneshot::channel();
        let job = Job { request, reply };

        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let sent = match self.config.submit_timeout {
            None => sender.try_send(job).map_err(|e| match e {
                TrySendError::Full(_) => self.reject(),
                TrySendError::Closed(_) => Error::ShuttingDown,
            }),
            Some(timeout) => sender.send_timeout(job, timeout).await.map_err(|e| match e {
                SendTimeoutError::Timeout(_) => self.reject(),
                SendTimeoutError::Closed(_) => Error::ShuttingDown,
            }),
        };

        if let Err(e) = sent {
            decrement(&self.counters.queued);
            return Err(e);
        }
        debug!(correlation_id = %correlation_id, "Request queued");
        Ok(PendingExecution { correlation_id, rx })
    }

    fn reject(&self) -> Error {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        warn!("Queue full, request rejected");
        Error::QueueFull {
            capacity: self.config.queue_capacity,
        }
    }

    /// Submit and wait for the result
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.submit(request).await?.wait().await
    }

    /// Stop accepting, drain for up to `grace`, then cancel what is left
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        if self.sender.lock().take().is_none() {
            debug!("Processor already shut down");
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let drained = tokio::time::timeout(grace, futures::future::join_all(handles)).await;
        if drained.is_err() {
            let interrupted = self.counters.in_flight.swap(0, Ordering::SeqCst) as u64;
            for abort in &aborts {
                abort.abort();
            }

            let mut rx = self.receiver.lock().await;
            rx.close();
            let mut dropped = 0u64;
            while let Ok(job) = rx.try_recv() {
                let _ = job.reply.send(Err(Error::Cancelled(format!(
                    "request {} was not started before shutdown",
                    job.request.correlation_id
                ))));
                dropped += 1;
            }
            self.counters.queued.store(0, Ordering::SeqCst);
            self.counters
                .cancelled
                .fetch_add(interrupted + dropped, Ordering::SeqCst);

            warn!(
                "Shutdown grace of {:?} elapsed: {} in-flight and {} queued requests cancelled",
                grace, interrupted, dropped
            );
        }

        let report = ShutdownReport {
            completed: self.counters.completed.load(Ordering::SeqCst),
            cancelled: self.counters.cancelled.load(Ordering::SeqCst),
        };
        info!(
            "Processor stopped: {} completed, {} cancelled",
            report.completed, report.cancelled
        );
        report
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            queued: self.counters.queued.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            cancelled: self.counters.cancelled.load(Ordering::SeqCst),
            capacity: self.config.queue_capacity,
            workers: self.config.workers,
            accepting: self.sender.lock().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sandbox::{Language, RawOutcome};
    use tokio::sync::Semaphore;

    /// Each job waits for a permit from `gate`
    struct GatedHandler {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn handle(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Internal("gate closed".into()))?;
            permit.forget();
            Ok(ExecutionResult::from_outcome(
                request.correlation_id,
                "worker-0001".to_string(),
                RawOutcome::success(request.code.clone(), Duration::ZERO),
            ))
        }
    }

    fn processor(capacity: usize, submit_timeout: Option<Duration>) -> (AsyncProcessor, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let processor = AsyncProcessor::new(
            ProcessorConfig {
                queue_capacity: capacity,
                workers: 1,
                submit_timeout,
                shutdown_grace: Duration::from_secs(1),
            },
            Arc::new(GatedHandler { gate: gate.clone() }),
        );
        (processor, gate)
    }

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(code, Language::Python)
    }

    async fn wait_for_in_flight(processor: &AsyncProcessor, n: usize) {
        while processor.stats().in_flight < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let (processor, gate) = processor(2, None);

        let first = processor.submit(request("1")).await.unwrap();
        wait_for_in_flight(&processor, 1).await;
        let second = processor.submit(request("2")).await.unwrap();
        let third = processor.submit(request("3")).await.unwrap();

        let err = processor.submit(request("4")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert_eq!(processor.stats().rejected, 1);
        assert_eq!(processor.stats().queued, 2);

        // Nothing accepted is dropped
        gate.add_permits(3);
        assert_eq!(first.wait().await.unwrap().stdout, "1");
        assert_eq!(second.wait().await.unwrap().stdout, "2");
        assert_eq!(third.wait().await.unwrap().stdout, "3");
        assert_eq!(processor.stats().completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_blocks_until_submit_timeout() {
        let (processor, gate) = processor(1, Some(Duration::from_millis(200)));

        let _first = processor.submit(request("1")).await.unwrap();
        wait_for_in_flight(&processor, 1).await;
        let _second = processor.submit(request("2")).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = processor.submit(request("3")).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull { capacity: 1 }));
        assert!(started.elapsed() >= Duration::from_millis(200));
        gate.add_permits(2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_submit_succeeds_when_space_frees() {
        let (processor, gate) = processor(1, Some(Duration::from_secs(5)));
        let processor = Arc::new(processor);

        let first = processor.submit(request("1")).await.unwrap();
        wait_for_in_flight(&processor, 1).await;
        let _second = processor.submit(request("2")).await.unwrap();

        let blocked = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.submit(request("3")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.add_permits(3);

        assert!(first.wait().await.is_ok());
        let third = blocked.await.unwrap().unwrap();
        assert_eq!(third.wait().await.unwrap().stdout, "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_after_grace() {
        let (processor, _gate) = processor(4, None);
        let first = processor.submit(request("1")).await.unwrap();
        wait_for_in_flight(&processor, 1).await;
        let second = processor.submit(request("2")).await.unwrap();
        let third = processor.submit(request("3")).await.unwrap();

        let report = processor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.cancelled, 3);
        assert_eq!(report.completed, 0);

        for pending in [first, second, third] {
            assert_eq!(pending.wait().await.unwrap_err().kind(), ErrorKind::Cancelled);
        }

        let err = processor.submit(request("4")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
        assert!(!processor.stats().accepting);
    }

    #[tokio::test]
    async fn test_shutdown_drains_within_grace() {
        let (processor, gate) = processor(4, None);
        let pending: Vec<PendingExecution> = vec![
            processor.submit(request("a")).await.unwrap(),
            processor.submit(request("b")).await.unwrap(),
        ];
        gate.add_permits(2);

        let report = processor.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.completed, 2);
        assert_eq!(report.cancelled, 0);
        for p in pending {
            assert!(p.wait().await.is_ok());
        }
    }
}
