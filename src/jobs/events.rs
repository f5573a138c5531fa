// Job notifications and progress reporting.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use super::{JobKind, JobOutput, JobState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// How a finished job is reported to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job errored or panicked.
    Faulted(String),
    Succeeded(JobOutput),
    /// Ran to completion without producing anything.
    Empty(String),
}

impl JobOutcome {
    pub fn classify(result: anyhow::Result<JobOutput>) -> Self {
        match result {
            Ok(output) if output.succeeded > 0 => JobOutcome::Succeeded(output),
            Ok(output) if output.message.is_empty() => {
                JobOutcome::Empty("Nothing was updated".to_string())
            }
            Ok(output) => JobOutcome::Empty(output.message),
            Err(e) => JobOutcome::Faulted(format!("{:#}", e)),
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Faulted(_) => JobState::Failed,
            JobOutcome::Succeeded(_) | JobOutcome::Empty(_) => JobState::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub kind: JobKind,
    pub key: String,
    pub title: String,
    pub state: JobState,
    pub progress: Progress,
}

/// Notification sink for the host UI.
pub trait EngineEvents: Send + Sync {
    fn job_added(&self, job: &JobSummary);

    fn job_progress(&self, id: Uuid, progress: &Progress);

    /// Called exactly once per job.
    fn job_finished(&self, job: &JobSummary, outcome: &JobOutcome);
}

/// Writes job events to the log.
#[derive(Debug, Default)]
pub struct TracingEvents;

impl EngineEvents for TracingEvents {
    fn job_added(&self, job: &JobSummary) {
        tracing::info!("Job started: {} ({})", job.title, job.id);
    }

    fn job_progress(&self, id: Uuid, progress: &Progress) {
        tracing::debug!(
            "Job {} progress {}/{}: {}",
            id,
            progress.current,
            progress.total,
            progress.message
        );
    }

    fn job_finished(&self, job: &JobSummary, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Succeeded(output) => {
                tracing::info!(
                    "Job finished: {} - {} ({} ok, {} failed)",
                    job.title,
                    output.message,
                    output.succeeded,
                    output.failed
                )
            }
            JobOutcome::Empty(message) => {
                tracing::warn!("Job finished without results: {} - {}", job.title, message)
            }
            JobOutcome::Faulted(error) => {
                tracing::error!("Job failed: {} - {}", job.title, error)
            }
        }
    }
}

/// Per-job progress callback; remembers the last report for summaries.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    last: Arc<Mutex<Progress>>,
    events: Arc<dyn EngineEvents>,
}

impl ProgressReporter {
    pub fn new(job_id: Uuid, events: Arc<dyn EngineEvents>) -> Self {
        Self {
            job_id,
            last: Arc::new(Mutex::new(Progress::default())),
            events,
        }
    }

    pub fn report(&self, current: usize, total: usize, message: impl Into<String>) {
        let progress = Progress {
            current,
            total,
            message: message.into(),
        };
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if *last == progress {
                return;
            }
            *last = progress.clone();
        }
        self.events.job_progress(self.job_id, &progress);
    }

    pub fn snapshot(&self) -> Progress {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
