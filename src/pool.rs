//! Fixed-size worker pool executing conversion jobs off the request path.

use crate::converter::ConversionRoutine;
use crate::error::ConversionFailure;
use crate::job::{ConversionArtifact, ConversionJob, JobFailure, JobId, JobOutcome};
use crate::queue::JobQueue;
use crate::telemetry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Jobs processed between two heartbeats of a worker.
const HEARTBEAT_EVERY: usize = 10;

/// The job a worker is currently running.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub job_id: JobId,
    pub worker_id: usize,
    pub started_at: Instant,
    cancel: CancellationToken,
}

/// One entry per worker. Written only by the owning worker loop, published
/// while the job is still being taken from the queue.
struct WorkerSlots {
    slots: Vec<Mutex<Option<InFlight>>>,
}

impl WorkerSlots {
    fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn set(&self, worker_id: usize, entry: Option<InFlight>) {
        *self.slots[worker_id]
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = entry;
    }

    fn snapshot(&self) -> Vec<InFlight> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }
}

/// Long-lived workers pulling jobs from a shared [`JobQueue`].
///
/// Each worker runs one job at a time. The routine executes on Tokio's
/// blocking pool so a slow or hung conversion never stalls the async
/// runtime. On timeout or cancellation the worker resolves the job at once,
/// then keeps its slot until the abandoned call returns.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    slots: Arc<WorkerSlots>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` worker loops on the current Tokio runtime.
    pub fn start(
        workers: usize,
        queue: Arc<JobQueue>,
        routine: Arc<dyn ConversionRoutine>,
    ) -> Self {
        let slots = Arc::new(WorkerSlots::new(workers));
        let processed = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    queue: queue.clone(),
                    routine: routine.clone(),
                    slots: slots.clone(),
                    processed: processed.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers, capacity = queue.capacity(), "Worker pool started");
        Self {
            queue,
            slots,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.slots.slots.len()
    }

    /// Jobs currently running, one entry per busy worker.
    pub fn in_flight(&self) -> Vec<InFlight> {
        self.slots.snapshot()
    }

    pub fn busy_workers(&self) -> usize {
        self.in_flight().len()
    }

    /// Signals a running job to stop. The worker resolves it as cancelled.
    ///
    /// Returns false if no worker is running the job.
    pub fn cancel_running(&self, job_id: JobId) -> bool {
        match self.in_flight().into_iter().find(|f| f.job_id == job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(job_id = %job_id, worker_id = entry.worker_id, "Cancellation requested for running job");
                true
            }
            None => false,
        }
    }

    /// Shuts the queue, lets queued and running jobs finish, then joins every worker.
    pub async fn stop(self) {
        info!("Stopping worker pool, draining jobs...");
        self.queue.shutdown();

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    queue: Arc<JobQueue>,
    routine: Arc<dyn ConversionRoutine>,
    slots: Arc<WorkerSlots>,
    processed: Arc<AtomicUsize>,
}

impl Worker {
    /// Main worker loop. Runs until the queue is shut down and drained.
    async fn run(self) {
        info!("Worker {} started", self.id);

        loop {
            let cancel = CancellationToken::new();
            let Some(mut job) = self
                .queue
                .dequeue_with(|job| self.claim(job, &cancel))
                .await
            else {
                break;
            };

            self.process_job(&mut job, &cancel).await;
            self.slots.set(self.id, None);
            // Dropping the job returns its queue capacity.
            drop(job);

            let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
            if processed % HEARTBEAT_EVERY == 0 {
                let busy = self.slots.snapshot().len();
                telemetry::record_worker_heartbeat(self.queue.len(), busy);
            }
        }

        info!("Worker {} stopped", self.id);
    }

    /// Publishes the worker's slot. Runs under the queue lock.
    fn claim(&self, job: &ConversionJob, cancel: &CancellationToken) {
        self.slots.set(
            self.id,
            Some(InFlight {
                job_id: job.id,
                worker_id: self.id,
                started_at: Instant::now(),
                cancel: cancel.clone(),
            }),
        );
    }

    /// Runs a single job to a terminal state.
    ///
    /// 1. Skip jobs nobody waits for, already expired or cancelled since dequeue
    /// 2. Race the routine against the deadline and cancellation
    /// 3. Resolve the job
    /// 4. If the routine was abandoned, wait for it to return before taking more work
    async fn process_job(&self, job: &mut ConversionJob, cancel: &CancellationToken) {
        if job.is_abandoned() {
            debug!(job_id = %job.id, "Submitter went away, skipping job");
            job.mark_cancelled("submitter stopped waiting");
            return;
        }
        if job.is_expired() {
            debug!(job_id = %job.id, "Deadline passed while queued");
            job.mark_timed_out();
            return;
        }
        if cancel.is_cancelled() {
            debug!(job_id = %job.id, "Cancelled before start");
            job.mark_cancelled("cancelled before start");
            return;
        }

        job.start_running();
        info!(
            worker_id = self.id,
            job_id = %job.id,
            input_format = %job.request().input_format,
            output_format = %job.request().output_format,
            "Processing job"
        );

        let (outcome, abandoned) = self.execute(job, cancel).await;

        match &outcome {
            Ok(artifact) => info!(
                worker_id = self.id,
                job_id = %job.id,
                output_bytes = artifact.len(),
                "Job completed"
            ),
            Err(JobFailure::Failed { cause }) => {
                error!(worker_id = self.id, job_id = %job.id, error = %cause, "Job failed")
            }
            Err(failure) => warn!(worker_id = self.id, job_id = %job.id, "Job {}", failure),
        }
        job.finish(outcome);

        // A blocking thread cannot be preempted: the slot stays occupied until
        // the abandoned call returns, keeping at most `n` routines running.
        if let Some(call) = abandoned {
            debug!(worker_id = self.id, job_id = %job.id, "Waiting for abandoned conversion to return");
            match call.await {
                Err(e) if e.is_panic() => {
                    warn!(worker_id = self.id, job_id = %job.id, "Abandoned conversion panicked")
                }
                _ => debug!(worker_id = self.id, job_id = %job.id, "Abandoned conversion returned"),
            }
        }
    }

    /// Runs the routine on the blocking pool.
    ///
    /// Returns the outcome plus the still-running call when the deadline or a
    /// cancellation won the race.
    async fn execute(
        &self,
        job: &ConversionJob,
        cancel: &CancellationToken,
    ) -> (JobOutcome, Option<RoutineCall>) {
        let request = job.request().clone();
        let routine = self.routine.clone();
        let token = cancel.clone();
        let mut call = tokio::task::spawn_blocking(move || routine.convert(&request, &token));

        let raced = tokio::select! {
            biased;
            joined = &mut call => Ok(joined),
            _ = cancel.cancelled() => {
                Err(JobFailure::Cancelled { reason: "cancelled while running".to_string() })
            }
            _ = tokio::time::sleep_until(job.deadline) => {
                cancel.cancel();
                Err(JobFailure::TimedOut)
            }
        };

        match raced {
            Ok(joined) => (settle(job, cancel, joined), None),
            Err(failure) => (Err(failure), Some(call)),
        }
    }
}

type RoutineCall = JoinHandle<Result<ConversionArtifact, ConversionFailure>>;

/// Maps a routine call that returned before the race was decided.
fn settle(
    job: &ConversionJob,
    cancel: &CancellationToken,
    joined: Result<Result<ConversionArtifact, ConversionFailure>, JoinError>,
) -> JobOutcome {
    match joined {
        // Both deadline observers must agree: late results count as timeouts.
        Ok(_) if Instant::now() >= job.deadline => Err(JobFailure::TimedOut),
        Ok(Ok(artifact)) => Ok(artifact),
        Ok(Err(ConversionFailure::Aborted)) if cancel.is_cancelled() => Err(JobFailure::Cancelled {
            reason: "cancelled while running".to_string(),
        }),
        Ok(Err(failure)) => Err(JobFailure::Failed {
            cause: failure.to_string(),
        }),
        Err(e) => Err(JobFailure::Failed {
            cause: describe_fault(e),
        }),
    }
}

/// Turns a crashed routine call into a failure cause.
fn describe_fault(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("conversion task aborted: {err}");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("conversion panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::MockConversionRoutine;
    use crate::format::{ConversionOptions, IconFormat};
    use crate::job::{CompletionReceiver, ConversionArtifact, ConversionRequest};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn job(timeout: Duration) -> (ConversionJob, CompletionReceiver) {
        job_with_input(b"input", timeout)
    }

    fn job_with_input(input: &'static [u8], timeout: Duration) -> (ConversionJob, CompletionReceiver) {
        ConversionJob::new(
            ConversionRequest {
                input: Bytes::from_static(input),
                input_format: IconFormat::Png,
                output_format: IconFormat::Ico,
                options: ConversionOptions::default(),
            },
            Instant::now() + timeout,
        )
    }

    /// Routine that ignores cancellation and counts concurrent executions.
    fn stubborn_routine(
        run_for: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> impl ConversionRoutine {
        move |_: &ConversionRequest, _: &CancellationToken| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(run_for);
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, ConversionFailure>(artifact())
        }
    }

    fn artifact() -> ConversionArtifact {
        ConversionArtifact {
            data: Bytes::from_static(b"ico"),
            format: IconFormat::Ico,
            frame_sizes: vec![16],
        }
    }

    #[tokio::test]
    async fn test_runs_job_to_completion() {
        let mut routine = MockConversionRoutine::new();
        routine.expect_convert().times(1).returning(|_, _| Ok(artifact()));

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let (j, rx) = job(Duration::from_secs(5));
        queue.enqueue(j).unwrap();

        assert_eq!(rx.await.unwrap(), Ok(artifact()));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_routine_error_marks_failed() {
        let mut routine = MockConversionRoutine::new();
        routine.expect_convert().returning(|_, _| {
            Err(ConversionFailure::Render("boom".to_string()))
        });

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let (j, rx) = job(Duration::from_secs(5));
        queue.enqueue(j).unwrap();

        assert_eq!(
            rx.await.unwrap(),
            Err(JobFailure::Failed {
                cause: "render failed: boom".to_string()
            })
        );
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let routine = |req: &ConversionRequest, _: &CancellationToken| {
            if req.input.as_ref() == b"crash" {
                panic!("decoder exploded");
            }
            Ok::<_, ConversionFailure>(artifact())
        };

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let (crashing, crash_rx) = job_with_input(b"crash", Duration::from_secs(5));
        let (ok, ok_rx) = job(Duration::from_secs(5));

        queue.enqueue(crashing).unwrap();
        queue.enqueue(ok).unwrap();

        assert_eq!(
            crash_rx.await.unwrap(),
            Err(JobFailure::Failed {
                cause: "conversion panicked: decoder exploded".to_string()
            })
        );
        assert_eq!(ok_rx.await.unwrap(), Ok(artifact()));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_abandons_routine() {
        let routine = |_: &ConversionRequest, cancel: &CancellationToken| {
            let started = std::time::Instant::now();
            while started.elapsed() < Duration::from_millis(500) {
                if cancel.is_cancelled() {
                    return Err(ConversionFailure::Aborted);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(artifact())
        };

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let started = Instant::now();
        let (j, rx) = job(Duration::from_millis(50));
        queue.enqueue(j).unwrap();

        assert_eq!(rx.await.unwrap(), Err(JobFailure::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(400));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_expired_job_never_runs() {
        let mut routine = MockConversionRoutine::new();
        routine.expect_convert().never();

        let queue = Arc::new(JobQueue::new(4));
        let (j, rx) = job(Duration::ZERO);
        queue.enqueue(j).unwrap();

        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));
        assert_eq!(rx.await.unwrap(), Err(JobFailure::TimedOut));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_abandoned_job_never_runs() {
        let mut routine = MockConversionRoutine::new();
        routine.expect_convert().never();

        let queue = Arc::new(JobQueue::new(4));
        let (j, rx) = job(Duration::from_secs(5));
        drop(rx);
        queue.enqueue(j).unwrap();

        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));
        pool.stop().await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let routine = move |_: &ConversionRequest, cancel: &CancellationToken| {
            let _ = started_tx.lock().unwrap().send(());
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err::<ConversionArtifact, _>(ConversionFailure::Aborted)
        };

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let (j, rx) = job(Duration::from_secs(5));
        let id = j.id;
        queue.enqueue(j).unwrap();

        tokio::task::spawn_blocking(move || started_rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(pool.busy_workers(), 1);
        assert_eq!(pool.in_flight()[0].job_id, id);
        assert!(pool.cancel_running(id));
        assert!(!pool.cancel_running(JobId::new()));

        assert!(matches!(rx.await.unwrap(), Err(JobFailure::Cancelled { .. })));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queued_jobs() {
        let mut routine = MockConversionRoutine::new();
        routine.expect_convert().times(3).returning(|_, _| Ok(artifact()));

        let queue = Arc::new(JobQueue::new(8));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (j, rx) = job(Duration::from_secs(5));
            queue.enqueue(j).unwrap();
            receivers.push(rx);
        }

        let pool = WorkerPool::start(2, queue.clone(), Arc::new(routine));
        assert_eq!(pool.worker_count(), 2);
        pool.stop().await;

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Ok(artifact()));
        }
        assert!(queue.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_call_keeps_worker_occupied() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let routine = stubborn_routine(Duration::from_millis(300), running.clone(), peak.clone());

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let started = Instant::now();
        let (slow, slow_rx) = job(Duration::from_millis(30));
        let (next, next_rx) = job(Duration::from_secs(5));
        queue.enqueue(slow).unwrap();
        queue.enqueue(next).unwrap();

        assert_eq!(slow_rx.await.unwrap(), Err(JobFailure::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(pool.busy_workers(), 1);
        assert_eq!(queue.len(), 1);

        assert_eq!(next_rx.await.unwrap(), Ok(artifact()));
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_call_keeps_worker_occupied() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let routine = stubborn_routine(Duration::from_millis(200), running.clone(), peak.clone());

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let (first, first_rx) = job(Duration::from_secs(5));
        let first_id = first.id;
        let (second, second_rx) = job(Duration::from_secs(5));
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();

        while running.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(pool.cancel_running(first_id));
        assert!(matches!(first_rx.await.unwrap(), Err(JobFailure::Cancelled { .. })));
        assert_eq!(queue.len(), 1);

        assert_eq!(second_rx.await.unwrap(), Ok(artifact()));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dequeued_job_is_always_in_flight() {
        let routine = |_: &ConversionRequest, cancel: &CancellationToken| {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err::<ConversionArtifact, _>(ConversionFailure::Aborted)
        };

        let queue = Arc::new(JobQueue::new(4));
        let pool = WorkerPool::start(1, queue.clone(), Arc::new(routine));

        let (j, rx) = job(Duration::from_secs(5));
        let id = j.id;
        queue.enqueue(j).unwrap();

        while !queue.is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(pool.in_flight().iter().any(|f| f.job_id == id));
        assert!(pool.cancel_running(id));

        assert!(matches!(rx.await.unwrap(), Err(JobFailure::Cancelled { .. })));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_runs() {
        let mut routine = MockConversionRoutine::new();
        routine.expect_convert().never();

        let worker = Worker {
            id: 0,
            queue: Arc::new(JobQueue::new(1)),
            routine: Arc::new(routine),
            slots: Arc::new(WorkerSlots::new(1)),
            processed: Arc::new(AtomicUsize::new(0)),
        };
        let (mut j, rx) = job(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        worker.claim(&j, &cancel);
        cancel.cancel();

        worker.process_job(&mut j, &cancel).await;
        assert_eq!(
            rx.await.unwrap(),
            Err(JobFailure::Cancelled {
                reason: "cancelled before start".to_string()
            })
        );
    }
}
