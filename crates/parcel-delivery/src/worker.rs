//! Worker lanes
//!
//! Blocking disk work and network deliveries never run on the caller's task.
//! They are submitted to one of two lanes:
//!
//! - [`PriorityWorker`] runs one job at a time. When several jobs are queued
//!   the one with the lowest [`TelemetryPriority`] runs next, with submission
//!   order breaking ties. All writes to the payload stores go through it, so
//!   two writes for the same key can never interleave.
//! - [`BackgroundWorker`] runs up to N futures at once. Jobs start in the
//!   order they are spawned.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use parcel_core::domain::TelemetryPriority;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WorkerError;

// ============================================================================
// PriorityWorker
// ============================================================================

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    priority: TelemetryPriority,
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap is a max-heap; reverse so the smallest key pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// Single-concurrency lane ordered by telemetry priority
///
/// Must be created inside a Tokio runtime.
pub struct PriorityWorker {
    name: &'static str,
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    seq: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PriorityWorker {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::run(name, rx));
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            seq: AtomicU64::new(0),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queues `job` and returns a receiver for its result
    ///
    /// Fails with [`WorkerError::ShutDown`] once
    /// [`shutdown_and_wait`](Self::shutdown_and_wait) has been called.
    pub fn submit<F, R>(
        &self,
        priority: TelemetryPriority,
        job: F,
    ) -> Result<oneshot::Receiver<R>, WorkerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = QueuedJob {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            job: Box::new(move || {
                // The caller may have stopped waiting; the job still ran.
                let _ = reply_tx.send(job());
            }),
        };

        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or(WorkerError::ShutDown(self.name))?;
        tx.send(queued).map_err(|_| WorkerError::ShutDown(self.name))?;
        Ok(reply_rx)
    }

    /// Queues `job` and waits for its result
    pub async fn run_job<F, R>(&self, priority: TelemetryPriority, job: F) -> Result<R, WorkerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let reply = self.submit(priority, job)?;
        reply.await.map_err(|_| WorkerError::ResultLost(self.name))
    }

    /// Stops accepting jobs, runs every job already queued and waits for the
    /// lane to go idle
    pub async fn shutdown_and_wait(&self) {
        let sender = lock(&self.tx).take();
        drop(sender);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(lane = self.name, error = %e, "Priority lane task failed");
            }
            info!(lane = self.name, "Priority lane drained");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.tx).is_none()
    }

    async fn run(name: &'static str, mut rx: mpsc::UnboundedReceiver<QueuedJob>) {
        debug!(lane = name, "Priority lane started");
        let mut queue = BinaryHeap::new();
        loop {
            if queue.is_empty() {
                match rx.recv().await {
                    Some(job) => queue.push(job),
                    None => break,
                }
            }
            while let Ok(job) = rx.try_recv() {
                queue.push(job);
            }
            if let Some(next) = queue.pop() {
                if let Err(e) = tokio::task::spawn_blocking(next.job).await {
                    warn!(lane = name, error = %e, "Priority lane job panicked");
                }
            }
        }
        debug!(lane = name, "Priority lane stopped");
    }
}

impl std::fmt::Debug for PriorityWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityWorker")
            .field("name", &self.name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// ============================================================================
// BackgroundWorker
// ============================================================================

/// Bounded-concurrency lane for network deliveries
#[derive(Debug, Clone)]
pub struct BackgroundWorker {
    name: &'static str,
    permits: Arc<Semaphore>,
    concurrency: u32,
}

impl BackgroundWorker {
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        let concurrency = u32::try_from(concurrency.max(1)).unwrap_or(u32::MAX);
        Self {
            name,
            permits: Arc::new(Semaphore::new(concurrency as usize)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency as usize
    }

    /// Waits for a free slot, then spawns `job` in it
    ///
    /// Callers that spawn in priority order get deliveries started in
    /// priority order.
    pub async fn spawn<F>(&self, job: F) -> Result<JoinHandle<F::Output>, WorkerError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::ShutDown(self.name))?;
        Ok(tokio::spawn(async move {
            let output = job.await;
            drop(permit);
            output
        }))
    }

    /// Waits until no job is running
    pub async fn wait_idle(&self) -> Result<(), WorkerError> {
        let all = self
            .permits
            .acquire_many(self.concurrency)
            .await
            .map_err(|_| WorkerError::ShutDown(self.name))?;
        drop(all);
        Ok(())
    }

    /// Rejects further spawns; running jobs finish
    pub fn close(&self) {
        self.permits.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn priority(rank: u8, timestamp: i64) -> TelemetryPriority {
        TelemetryPriority { rank, timestamp }
    }

    #[tokio::test]
    async fn test_run_job_returns_result() {
        let worker = PriorityWorker::new("test");
        let value = worker.run_job(priority(0, 0), || 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queued_jobs_run_in_priority_order() {
        let worker = PriorityWorker::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the lane until every other job is queued.
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let gate = worker
            .submit(priority(0, 0), move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
        started_rx.recv().unwrap();

        let mut replies = Vec::new();
        for (label, p) in [
            ("network", priority(3, 0)),
            ("log-new", priority(2, 50)),
            ("crash", priority(0, 100)),
            ("log-old", priority(2, 10)),
            ("session", priority(1, 0)),
        ] {
            let order = order.clone();
            replies.push(
                worker
                    .submit(p, move || order.lock().unwrap().push(label))
                    .unwrap(),
            );
        }
        release_tx.send(()).unwrap();
        gate.await.unwrap();
        for reply in replies {
            reply.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["crash", "session", "log-old", "log-new", "network"]
        );
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let worker = PriorityWorker::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut replies = Vec::new();
        for i in 0..20 {
            let order = order.clone();
            replies.push(worker.submit(priority(1, 5), move || order.lock().unwrap().push(i)).unwrap());
        }
        for reply in replies {
            reply.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let worker = PriorityWorker::new("test");
        let done = Arc::new(AtomicUsize::new(0));
        let mut replies = Vec::new();
        for _ in 0..5 {
            let done = done.clone();
            replies.push(
                worker
                    .submit(priority(2, 0), move || {
                        std::thread::sleep(Duration::from_millis(5));
                        done.fetch_add(1, AtomicOrdering::SeqCst);
                    })
                    .unwrap(),
            );
        }

        worker.shutdown_and_wait().await;
        assert_eq!(done.load(AtomicOrdering::SeqCst), 5);
        assert!(worker.is_shut_down());
        assert_eq!(
            worker.submit(priority(0, 0), || ()).unwrap_err(),
            WorkerError::ShutDown("test")
        );
    }

    #[tokio::test]
    async fn test_panicking_job_reports_lost_result() {
        let worker = PriorityWorker::new("test");
        let result = worker.run_job(priority(0, 0), || -> u32 { panic!("boom") }).await;
        assert_eq!(result.unwrap_err(), WorkerError::ResultLost("test"));

        // The lane keeps working.
        assert_eq!(worker.run_job(priority(0, 0), || 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_background_worker_bounds_concurrency() {
        let worker = BackgroundWorker::new("delivery", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                worker
                    .spawn(async move {
                        let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, AtomicOrdering::SeqCst);
                    })
                    .await
                    .unwrap(),
            );
        }
        worker.wait_idle().await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_background_worker_close_rejects() {
        let worker = BackgroundWorker::new("delivery", 1);
        worker.close();
        assert!(worker.spawn(async {}).await.is_err());
        assert!(worker.wait_idle().await.is_err());
    }
}
