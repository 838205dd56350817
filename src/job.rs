//! Job models and state management for the conversion queue.

use crate::format::{ConversionOptions, IconFormat};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::Instant;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The immutable part of a job, shared read-only with the conversion routine.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: Bytes,
    pub input_format: IconFormat,
    pub output_format: IconFormat,
    pub options: ConversionOptions,
}

/// Converted output plus the metadata describing it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionArtifact {
    pub data: Bytes,
    pub format: IconFormat,
    /// Edge length of every frame in the container, smallest first.
    pub frame_sizes: Vec<u32>,
}

impl ConversionArtifact {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::TimedOut => write!(f, "timed_out"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a job ended without an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Failed { cause: String },
    TimedOut,
    Cancelled { reason: String },
}

impl JobFailure {
    fn state(&self) -> JobState {
        match self {
            JobFailure::Failed { .. } => JobState::Failed,
            JobFailure::TimedOut => JobState::TimedOut,
            JobFailure::Cancelled { .. } => JobState::Cancelled,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Failed { cause } => write!(f, "failed: {cause}"),
            JobFailure::TimedOut => write!(f, "timed out"),
            JobFailure::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

/// Terminal result delivered through a job's completion handle.
pub type JobOutcome = Result<ConversionArtifact, JobFailure>;

/// Receiving side of a job's completion handle.
pub type CompletionReceiver = oneshot::Receiver<JobOutcome>;

/// A conversion request plus its execution state.
///
/// The job is moved between the queue and a worker, never shared. Reaching a
/// terminal state resolves the completion handle; later transitions are
/// ignored.
#[derive(Debug)]
pub struct ConversionJob {
    pub id: JobId,
    request: Arc<ConversionRequest>,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Instant,
    state: JobState,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    result: Option<ConversionArtifact>,
    error: Option<JobFailure>,
    completion: Option<oneshot::Sender<JobOutcome>>,
    /// Queue capacity taken at admission, returned when the job is dropped.
    admission: Option<OwnedSemaphorePermit>,
}

impl ConversionJob {
    /// Creates a queued job and the receiver its submitter will await.
    pub fn new(request: ConversionRequest, deadline: Instant) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            id: JobId::new(),
            request: Arc::new(request),
            submitted_at: Utc::now(),
            deadline,
            state: JobState::Queued,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            completion: Some(tx),
            admission: None,
        };
        (job, rx)
    }

    pub(crate) fn admit(&mut self, permit: OwnedSemaphorePermit) {
        self.admission = Some(permit);
    }

    pub fn request(&self) -> &Arc<ConversionRequest> {
        &self.request
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn result(&self) -> Option<&ConversionArtifact> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&JobFailure> {
        self.error.as_ref()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// True once the submitter dropped its receiver; nobody is waiting.
    pub fn is_abandoned(&self) -> bool {
        self.completion.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Queued -> Running. Returns false if the job is not queued.
    pub fn start_running(&mut self) -> bool {
        if self.state != JobState::Queued {
            return false;
        }
        self.state = JobState::Running;
        self.started_at = Some(Instant::now());
        true
    }

    pub fn mark_completed(&mut self, artifact: ConversionArtifact) -> bool {
        self.finish(Ok(artifact))
    }

    pub fn mark_failed(&mut self, cause: impl Into<String>) -> bool {
        self.finish(Err(JobFailure::Failed { cause: cause.into() }))
    }

    pub fn mark_timed_out(&mut self) -> bool {
        self.finish(Err(JobFailure::TimedOut))
    }

    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> bool {
        self.finish(Err(JobFailure::Cancelled { reason: reason.into() }))
    }

    /// Enters a terminal state and resolves the completion handle.
    ///
    /// Returns false, leaving the job untouched, if it already finished.
    pub fn finish(&mut self, outcome: JobOutcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.finished_at = Some(Instant::now());
        match &outcome {
            Ok(artifact) => {
                self.state = JobState::Completed;
                self.result = Some(artifact.clone());
            }
            Err(failure) => {
                self.state = failure.state();
                self.error = Some(failure.clone());
            }
        }
        if let Some(tx) = self.completion.take() {
            // The submitter may have stopped waiting; the outcome is still recorded.
            let _ = tx.send(outcome);
        }
        true
    }

    /// Time spent running, once the job reached a terminal state.
    pub fn run_duration_ms(&self) -> Option<u128> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished.duration_since(started).as_millis()),
            _ => None,
        }
    }
}

impl Drop for ConversionJob {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.mark_cancelled("job dropped before completion");
        }
    }
}
