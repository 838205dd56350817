//! Bounded in-process job queue for conversion tasks.

use crate::error::QueueError;
use crate::job::{ConversionJob, JobId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info};

struct QueueState {
    pending: VecDeque<ConversionJob>,
    closed: bool,
}

/// Bounded FIFO job queue shared by submitters and workers.
///
/// Capacity covers every admitted job that has not been dropped yet: jobs
/// waiting here plus jobs a worker took and still holds, including a worker
/// waiting out an abandoned call. Enqueue never waits: at capacity further
/// jobs are rejected with [`QueueError::Full`]. Dequeue suspends the calling
/// worker until a job arrives or the queue is shut down and drained.
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
    admissions: Arc<Semaphore>,
    capacity: usize,
}

impl JobQueue {
    /// Creates an empty queue holding at most `capacity` pending jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
            admissions: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // No user code runs under the lock, so a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a job at the back of the queue.
    ///
    /// A rejected job is dropped, which resolves its completion handle as
    /// cancelled; callers report the returned error instead.
    pub fn enqueue(&self, mut job: ConversionJob) -> Result<(), QueueError> {
        let job_id = job.id;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let Ok(permit) = self.admissions.clone().try_acquire_owned() else {
                debug!(job_id = %job_id, capacity = self.capacity, "Queue full, rejecting job");
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            };
            job.admit(permit);
            state.pending.push_back(job);
        }

        self.available.notify_one();
        debug!(job_id = %job_id, "Enqueued job");
        Ok(())
    }

    /// Dequeues the oldest pending job.
    ///
    /// Returns `None` once the queue has been shut down and every pending job
    /// has been handed out.
    pub async fn dequeue(&self) -> Option<ConversionJob> {
        self.dequeue_with(|_| {}).await
    }

    /// Dequeues like [`dequeue`](Self::dequeue), running `claim` on the job
    /// while the queue lock is still held.
    ///
    /// A job is therefore never absent from both the queue and whatever
    /// `claim` records it in. `claim` must not call back into the queue.
    pub async fn dequeue_with<F>(&self, mut claim: F) -> Option<ConversionJob>
    where
        F: FnMut(&ConversionJob),
    {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a shutdown wakeup is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(job) = state.pending.pop_front() {
                    claim(&job);
                    debug!(job_id = %job.id, "Dequeued job");
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Removes a still-queued job and resolves it as cancelled.
    pub fn cancel(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut job = self.withdraw(job_id)?;
        job.mark_cancelled("cancelled while queued");
        info!(job_id = %job_id, "Cancelled queued job");
        Ok(())
    }

    /// Removes a still-queued job whose deadline passed and resolves it as timed out.
    pub fn expire(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut job = self.withdraw(job_id)?;
        job.mark_timed_out();
        info!(job_id = %job_id, "Expired queued job");
        Ok(())
    }

    fn withdraw(&self, job_id: JobId) -> Result<ConversionJob, QueueError> {
        let mut state = self.lock();
        let position = state
            .pending
            .iter()
            .position(|job| job.id == job_id)
            .ok_or(QueueError::NotFound)?;
        state.pending.remove(position).ok_or(QueueError::NotFound)
    }

    /// Stops accepting jobs and wakes every waiting worker.
    ///
    /// Jobs already queued stay available to `dequeue`.
    pub fn shutdown(&self) {
        let pending = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.len()
        };
        self.available.notify_waiters();
        info!(pending, "Job queue shut down");
    }

    /// Returns the current number of pending jobs.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admitted jobs still holding capacity, queued or taken by a worker.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.admissions.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
