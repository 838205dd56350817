//! Conversion service: validation, submission and result delivery.

use crate::config::ServiceConfig;
use crate::converter::ConversionRoutine;
use crate::error::{ConfigError, ConversionError, QueueError, ValidationError};
use crate::format::{ConversionOptions, IconFormat};
use crate::job::{
    CompletionReceiver, ConversionArtifact, ConversionJob, ConversionRequest, JobFailure, JobId,
};
use crate::pool::WorkerPool;
use crate::queue::JobQueue;
use crate::telemetry::{ConversionEvent, ConversionOutcome, MetricsCollector};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Public entry point for icon conversions.
///
/// Requests are validated synchronously, queued as jobs and executed by a
/// fixed worker pool. Every accepted request ends in exactly one terminal
/// outcome, delivered to the caller through its [`JobTicket`].
pub struct ConversionService {
    config: ServiceConfig,
    queue: Arc<JobQueue>,
    pool: Mutex<Option<WorkerPool>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl ConversionService {
    /// Creates the queue and starts the worker pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: ServiceConfig,
        routine: Arc<dyn ConversionRoutine>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        let pool = WorkerPool::start(config.worker_count, queue.clone(), routine);

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            max_input_bytes = config.max_input_bytes,
            "Conversion service ready"
        );
        Ok(Self {
            config,
            queue,
            pool: Mutex::new(Some(pool)),
            metrics,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Number of jobs waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of workers currently running a job.
    pub fn busy_workers(&self) -> usize {
        self.with_pool(|pool| pool.busy_workers()).unwrap_or(0)
    }

    fn with_pool<T>(&self, f: impl FnOnce(&WorkerPool) -> T) -> Option<T> {
        let guard = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }

    /// Converts `input` and waits for the result.
    ///
    /// `timeout` defaults to the configured default and is clamped to the
    /// configured maximum.
    pub async fn convert(
        &self,
        input: impl Into<Bytes>,
        input_format: IconFormat,
        output_format: IconFormat,
        options: ConversionOptions,
        timeout: Option<Duration>,
    ) -> Result<ConversionArtifact, ConversionError> {
        self.submit(input, input_format, output_format, options, timeout)?
            .wait()
            .await
    }

    /// Validates and enqueues a request without waiting for it.
    ///
    /// Fails immediately on invalid input, a full queue or a stopped service.
    pub fn submit(
        &self,
        input: impl Into<Bytes>,
        input_format: IconFormat,
        output_format: IconFormat,
        options: ConversionOptions,
        timeout: Option<Duration>,
    ) -> Result<JobTicket, ConversionError> {
        let started = Instant::now();
        let input = input.into();
        let report = Report {
            metrics: self.metrics.clone(),
            input_format,
            output_format,
            input_size: input.len(),
            started,
        };

        if let Err(e) = self.validate(&input, input_format, output_format, &options, timeout) {
            warn!(
                input_format = %input_format,
                output_format = %output_format,
                input_size = input.len(),
                error = %e,
                "Rejected conversion request"
            );
            report.record(None, ConversionOutcome::Rejected, None);
            return Err(e.into());
        }

        let timeout = self.config.effective_timeout(timeout);
        let deadline = started + timeout;
        let (job, receiver) = ConversionJob::new(
            ConversionRequest {
                input,
                input_format,
                output_format,
                options,
            },
            deadline,
        );
        let job_id = job.id;

        match self.queue.enqueue(job) {
            Ok(()) => {}
            Err(QueueError::Full { capacity }) => {
                warn!(job_id = %job_id, capacity, "Conversion queue full");
                report.record(Some(job_id), ConversionOutcome::QueueFull, None);
                return Err(ConversionError::QueueFull { capacity });
            }
            Err(_) => {
                report.record(Some(job_id), ConversionOutcome::Rejected, None);
                return Err(ConversionError::ShuttingDown);
            }
        }

        debug!(job_id = %job_id, timeout_ms = timeout.as_millis() as u64, "Submitted conversion job");
        Ok(JobTicket {
            id: job_id,
            receiver,
            deadline,
            timeout,
            queue: self.queue.clone(),
            report,
        })
    }

    fn validate(
        &self,
        input: &[u8],
        input_format: IconFormat,
        output_format: IconFormat,
        options: &ConversionOptions,
        timeout: Option<Duration>,
    ) -> Result<(), ValidationError> {
        IconFormat::check_pair(input_format, output_format)?;
        if input.is_empty() {
            return Err(ValidationError::EmptyInput);
        }
        if input.len() > self.config.max_input_bytes {
            return Err(ValidationError::InputTooLarge {
                size: input.len(),
                max: self.config.max_input_bytes,
            });
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(ValidationError::ZeroTimeout);
        }
        options.validate()
    }

    /// Cancels a job: withdrawn if still queued, signalled if running.
    pub fn cancel(&self, job_id: JobId) -> Result<(), QueueError> {
        match self.queue.cancel(job_id) {
            Err(QueueError::NotFound) => {
                if self.with_pool(|pool| pool.cancel_running(job_id)).unwrap_or(false) {
                    Ok(())
                } else {
                    Err(QueueError::NotFound)
                }
            }
            other => other,
        }
    }

    /// Stops accepting requests, drains queued and running jobs and joins the workers.
    pub async fn shutdown(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pool {
            Some(pool) => pool.stop().await,
            None => self.queue.shutdown(),
        }
        info!("Conversion service stopped");
    }
}

/// Context needed to emit the metrics event of one request.
struct Report {
    metrics: Arc<dyn MetricsCollector>,
    input_format: IconFormat,
    output_format: IconFormat,
    input_size: usize,
    started: Instant,
}

impl Report {
    fn record(&self, job_id: Option<JobId>, outcome: ConversionOutcome, output_size: Option<usize>) {
        self.metrics.record(&ConversionEvent {
            job_id,
            input_format: self.input_format,
            output_format: self.output_format,
            input_size: self.input_size,
            output_size,
            duration_ms: self.started.elapsed().as_millis() as u64,
            outcome,
        });
    }
}

/// Handle to a submitted job.
///
/// Dropping the ticket without waiting tells the pool nobody needs the
/// result; a job still queued at that point is skipped.
pub struct JobTicket {
    id: JobId,
    receiver: CompletionReceiver,
    deadline: Instant,
    timeout: Duration,
    queue: Arc<JobQueue>,
    report: Report,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for the job's terminal outcome, at most until its deadline.
    pub async fn wait(mut self) -> Result<ConversionArtifact, ConversionError> {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(JobFailure::Failed {
                cause: "job dropped without a result".to_string(),
            }),
            Err(_) => {
                // Still queued: withdraw it so it never occupies a worker.
                // Running: the worker observes the same deadline.
                let _ = self.queue.expire(self.id);
                Err(JobFailure::TimedOut)
            }
        };

        let (result, metric) = match outcome {
            Ok(artifact) => {
                let size = artifact.len();
                (Ok(artifact), (ConversionOutcome::Completed, Some(size)))
            }
            Err(JobFailure::Failed { cause }) => (
                Err(ConversionError::Conversion { cause }),
                (ConversionOutcome::Failed, None),
            ),
            Err(JobFailure::TimedOut) => (
                Err(ConversionError::Timeout {
                    timeout: self.timeout,
                }),
                (ConversionOutcome::TimedOut, None),
            ),
            Err(JobFailure::Cancelled { reason }) => (
                Err(ConversionError::Cancelled { reason }),
                (ConversionOutcome::Cancelled, None),
            ),
        };

        self.report.record(Some(self.id), metric.0, metric.1);
        result
    }
}
