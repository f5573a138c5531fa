// Background job engine - job kinds, the job trait and the services jobs run
// against. The scheduler owns running jobs; batch jobs drain their queue
// through the worker pool.

pub mod batch;
pub mod descriptor;
pub mod events;
pub mod pool;
pub mod refresh;
pub mod scheduler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::models::SourceId;
use crate::services::merge::MergeResolver;
use crate::services::people::Roster;
use crate::services::sources::SourceRegistry;
use crate::services::store::RecordStore;

pub use batch::BatchJob;
pub use descriptor::JobDescriptor;
pub use events::{EngineEvents, JobOutcome, JobSummary, Progress, ProgressReporter, TracingEvents};
pub use pool::{WorkQueue, WorkerPool};
pub use refresh::RefreshGameJob;
pub use scheduler::{JobHandle, JobScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RefreshGame,
    ResolveCharacters,
    ResolvePersonDetail,
}

impl JobKind {
    /// Short fixed tag used in job descriptors.
    pub fn tag(&self) -> &'static str {
        match self {
            JobKind::RefreshGame => "refresh",
            JobKind::ResolveCharacters => "chars",
            JobKind::ResolvePersonDetail => "people",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "refresh" => Some(JobKind::RefreshGame),
            "chars" => Some(JobKind::ResolveCharacters),
            "people" => Some(JobKind::ResolvePersonDetail),
            _ => None,
        }
    }

    /// Kinds that drain a work queue and accept late items.
    pub fn is_batch(&self) -> bool {
        !matches!(self, JobKind::RefreshGame)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::RefreshGame => write!(f, "refresh game"),
            JobKind::ResolveCharacters => write!(f, "resolve characters"),
            JobKind::ResolvePersonDetail => write!(f, "resolve person detail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// One unit of batched fetch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    /// Fill in a character listed on a game record.
    Character {
        game_id: Uuid,
        source: SourceId,
        external_id: String,
    },
    /// Fetch portrait and description for a roster entry.
    PersonDetail {
        person_id: Uuid,
        source: SourceId,
        external_id: String,
    },
}

impl WorkItem {
    pub fn kind(&self) -> JobKind {
        match self {
            WorkItem::Character { .. } => JobKind::ResolveCharacters,
            WorkItem::PersonDetail { .. } => JobKind::ResolvePersonDetail,
        }
    }

    pub fn label(&self) -> String {
        match self {
            WorkItem::Character {
                source,
                external_id,
                ..
            } => format!("character {}:{}", source.tag(), external_id),
            WorkItem::PersonDetail {
                source,
                external_id,
                ..
            } => format!("person {}:{}", source.tag(), external_id),
        }
    }
}

/// What a finished job did. Zero successes is reported as a soft failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub succeeded: usize,
    pub failed: usize,
    pub message: String,
}

impl JobOutput {
    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            message: message.into(),
        }
    }
}

/// Everything a job needs from the host.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<dyn RecordStore>,
    pub roster: Arc<Roster>,
    pub resolver: Arc<MergeResolver>,
    pub settings: EngineConfig,
    pub events: Arc<dyn EngineEvents>,
}

pub struct JobContext {
    pub services: Services,
    pub scheduler: Arc<JobScheduler>,
    pub progress: ProgressReporter,
}

#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> Uuid;

    fn kind(&self) -> JobKind;

    /// Coalescing key, unique per kind among active jobs.
    fn key(&self) -> String;

    fn title(&self) -> String;

    /// Synchronous checks run at submission. An error rejects the job
    /// before it starts.
    fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The intake queue, for kinds that accept items while running.
    fn queue(&self) -> Option<&WorkQueue> {
        None
    }

    /// Resumable state; `None` for transient jobs.
    fn descriptor(&self) -> Option<JobDescriptor>;

    /// Kind-specific fixups after loading from a descriptor.
    async fn recover(&mut self, _services: &Services) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutput>;
}
