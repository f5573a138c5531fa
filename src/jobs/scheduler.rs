// Job scheduler - owns the set of active jobs.
//
// Submitting a job spawns its run on the tokio runtime and returns a handle
// right away. When the run ends the scheduler waits a short grace period so
// the last progress report lands, removes the job, and fires exactly one
// finished notification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use uuid::Uuid;

use super::batch::BatchJob;
use super::descriptor::{self, JobDescriptor};
use super::events::{JobOutcome, JobSummary, Progress, ProgressReporter};
use super::pool::QueueClosed;
use super::refresh::RefreshGameJob;
use super::{Job, JobContext, JobKind, JobState, Services, WorkItem};
use crate::error::EngineError;
use crate::models::Identity;

struct ActiveJob {
    job: Arc<dyn Job>,
    state: watch::Receiver<JobState>,
    progress: ProgressReporter,
    /// Set once `run` returns, while the job sits out its grace period.
    finished: Arc<AtomicBool>,
}

impl ActiveJob {
    fn handle(&self) -> JobHandle {
        JobHandle {
            job: self.job.clone(),
            state: self.state.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Whether a new request for the same work can join this job.
    fn accepts_joiners(&self) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        self.job.queue().map(|q| !q.is_closed()).unwrap_or(true)
    }
}

/// A job registered under the active-set lock but not yet announced or
/// started. Notifications fire only once the lock is released.
enum Admission {
    Accepted {
        handle: JobHandle,
        state: watch::Sender<JobState>,
        finished: Arc<AtomicBool>,
    },
    Refused {
        summary: JobSummary,
        message: String,
    },
}

pub struct JobScheduler {
    me: Weak<JobScheduler>,
    services: Services,
    active: Mutex<HashMap<Uuid, ActiveJob>>,
    descriptor_path: PathBuf,
}

impl JobScheduler {
    pub fn new(services: Services, descriptor_path: PathBuf) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            services,
            active: Mutex::new(HashMap::new()),
            descriptor_path,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor_path
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and start `job`. A job whose `prepare` fails is reported
    /// once and never started.
    pub fn submit(&self, job: Arc<dyn Job>) -> Result<JobHandle, EngineError> {
        let admission = self.admit(&mut self.lock_active(), job);
        self.launch(admission)
    }

    /// Register `job` in the active set. Must not notify anyone: the
    /// caller still holds the lock.
    fn admit(&self, active: &mut HashMap<Uuid, ActiveJob>, job: Arc<dyn Job>) -> Admission {
        if let Err(e) = job.prepare() {
            return Admission::Refused {
                summary: summarize(job.as_ref(), JobState::Failed, Progress::default()),
                message: format!("{:#}", e),
            };
        }

        let (state_tx, state_rx) = watch::channel(JobState::Queued);
        let finished = Arc::new(AtomicBool::new(false));
        let entry = ActiveJob {
            job: job.clone(),
            state: state_rx,
            progress: ProgressReporter::new(job.id(), self.services.events.clone()),
            finished: finished.clone(),
        };
        let handle = entry.handle();
        active.insert(job.id(), entry);

        Admission::Accepted {
            handle,
            state: state_tx,
            finished,
        }
    }

    /// Announce an admitted job and spawn its run. Called without the
    /// active-set lock held.
    fn launch(&self, admission: Admission) -> Result<JobHandle, EngineError> {
        let events = &self.services.events;
        match admission {
            Admission::Refused { summary, message } => {
                events.job_finished(&summary, &JobOutcome::Faulted(message.clone()));
                Err(EngineError::Rejected(message))
            }
            Admission::Accepted {
                handle,
                state,
                finished,
            } => {
                let Some(scheduler) = self.me.upgrade() else {
                    self.lock_active().remove(&handle.id());
                    return Err(EngineError::Rejected(
                        "scheduler is shutting down".to_string(),
                    ));
                };
                events.job_added(&handle.summary());
                tokio::spawn(scheduler.drive(
                    handle.job.clone(),
                    state,
                    handle.progress.clone(),
                    finished,
                ));
                Ok(handle)
            }
        }
    }

    async fn drive(
        self: Arc<Self>,
        job: Arc<dyn Job>,
        state: watch::Sender<JobState>,
        progress: ProgressReporter,
        finished: Arc<AtomicBool>,
    ) {
        state.send_replace(JobState::Running);

        let ctx = JobContext {
            services: self.services.clone(),
            scheduler: self.clone(),
            progress: progress.clone(),
        };

        // Run in its own task so a panic is contained and reported.
        let runner = job.clone();
        let result = match tokio::spawn(async move { runner.run(ctx).await }).await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("job task panicked: {}", e)),
        };
        finished.store(true, Ordering::SeqCst);

        tokio::time::sleep(self.services.settings.completion_grace()).await;

        let outcome = JobOutcome::classify(result);
        let terminal = outcome.state();

        self.lock_active().remove(&job.id());

        let summary = summarize(job.as_ref(), terminal, progress.snapshot());
        self.services.events.job_finished(&summary, &outcome);
        state.send_replace(terminal);
    }

    /// The active job of `kind` with `key`, if any. Jobs that already
    /// finished their run, and batch jobs whose queue closed, are skipped.
    pub fn find(&self, kind: JobKind, key: &str) -> Option<JobHandle> {
        find_in(&self.lock_active(), kind, key)
    }

    /// Refresh one game, joining an in-flight refresh for the same game.
    pub fn refresh(&self, game_id: Uuid, identity: Identity) -> Result<JobHandle, EngineError> {
        let admission = {
            let mut active = self.lock_active();
            if let Some(handle) = find_in(&active, JobKind::RefreshGame, &game_id.to_string()) {
                tracing::debug!("Refresh for {} already running", game_id);
                return Ok(handle);
            }
            self.admit(&mut active, Arc::new(RefreshGameJob::new(game_id, identity)))
        };
        self.launch(admission)
    }

    /// Append `items` to the active batch job for `(kind, key)`, creating
    /// the job if there is none or the existing one has drained.
    pub fn enqueue_batch(
        &self,
        kind: JobKind,
        key: &str,
        items: Vec<WorkItem>,
    ) -> Result<JobHandle, EngineError> {
        if !kind.is_batch() {
            return Err(EngineError::Rejected(format!(
                "{} jobs do not take work items",
                kind
            )));
        }
        if let Some(item) = items.iter().find(|i| i.kind() != kind) {
            return Err(EngineError::WrongItem {
                kind,
                item: item.label(),
            });
        }

        let admission = {
            let mut active = self.lock_active();
            if let Some(handle) = find_in(&active, kind, key) {
                match handle.add_items(items.clone()) {
                    Ok(added) => {
                        tracing::debug!("Added {} item(s) to {} job {}", added, kind, key);
                        return Ok(handle);
                    }
                    // Drained between the lookup and the push.
                    Err(EngineError::Closed(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.admit(&mut active, Arc::new(BatchJob::new(kind, key, items)))
        };
        self.launch(admission)
    }

    pub fn active_jobs(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self
            .lock_active()
            .values()
            .map(|entry| entry.handle().summary())
            .collect();
        jobs.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn is_idle(&self) -> bool {
        self.lock_active().is_empty()
    }

    /// Wait until no job is active, including jobs started while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<JobHandle> = self.lock_active().values().map(|e| e.handle()).collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                handle.wait().await;
            }
        }
    }

    /// Write every persistable active job to the descriptor file. Returns
    /// how many were saved; with none, a stale file is removed.
    pub async fn persist_all(&self) -> Result<usize, EngineError> {
        let descriptors: Vec<JobDescriptor> = self
            .lock_active()
            .values()
            .filter_map(|entry| entry.job.descriptor())
            .collect();

        if descriptors.is_empty() {
            match tokio::fs::remove_file(&self.descriptor_path).await {
                Ok(()) => tracing::debug!("Removed stale job descriptor file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(0);
        }

        descriptor::write_file(&self.descriptor_path, &descriptors).await?;
        tracing::info!(
            "Saved {} unfinished job(s) to {}",
            descriptors.len(),
            self.descriptor_path.display()
        );
        Ok(descriptors.len())
    }

    /// Recreate jobs saved by `persist_all` and start them. The descriptor
    /// file is deleted afterwards.
    pub async fn resume_all(&self) -> Result<Vec<JobHandle>, EngineError> {
        let descriptors = descriptor::read_file(&self.descriptor_path).await?;
        if descriptors.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!("Resuming {} saved job(s)", descriptors.len());

        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let kind = descriptor.kind();
            let mut job = descriptor.into_job();
            if let Err(e) = job.recover(&self.services).await {
                tracing::warn!("Dropping saved {} job: {:#}", kind, e);
                continue;
            }
            match self.submit(Arc::from(job)) {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::warn!("Saved {} job was rejected: {}", kind, e),
            }
        }

        match tokio::fs::remove_file(&self.descriptor_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(handles)
    }
}

fn find_in(active: &HashMap<Uuid, ActiveJob>, kind: JobKind, key: &str) -> Option<JobHandle> {
    active
        .values()
        .filter(|entry| entry.job.kind() == kind && entry.job.key() == key)
        .find(|entry| entry.accepts_joiners())
        .map(|entry| entry.handle())
}

fn summarize(job: &dyn Job, state: JobState, progress: Progress) -> JobSummary {
    JobSummary {
        id: job.id(),
        kind: job.kind(),
        key: job.key(),
        title: job.title(),
        state,
        progress,
    }
}

/// A caller's view of a submitted job.
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<dyn Job>,
    state: watch::Receiver<JobState>,
    progress: ProgressReporter,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.job.id()
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind()
    }

    pub fn key(&self) -> String {
        self.job.key()
    }

    pub fn title(&self) -> String {
        self.job.title()
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn progress(&self) -> Progress {
        self.progress.snapshot()
    }

    pub fn summary(&self) -> JobSummary {
        summarize(self.job.as_ref(), self.state(), self.progress())
    }

    /// Queue one more item on a running batch job. Returns false for a
    /// duplicate of an unfinished item.
    pub fn add_item(&self, item: WorkItem) -> Result<bool, EngineError> {
        self.add_items(vec![item]).map(|added| added > 0)
    }

    pub fn add_items(&self, items: Vec<WorkItem>) -> Result<usize, EngineError> {
        let queue = self.job.queue().ok_or(EngineError::NotBatch(self.id()))?;
        if let Some(item) = items.iter().find(|i| i.kind() != self.kind()) {
            return Err(EngineError::WrongItem {
                kind: self.kind(),
                item: item.label(),
            });
        }
        queue
            .extend(items)
            .map_err(|QueueClosed| EngineError::Closed(self.id()))
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(&self) -> JobState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        reached.unwrap_or_else(|_| *state.borrow())
    }
}
