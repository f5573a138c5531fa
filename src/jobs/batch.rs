// Batch jobs - drain a queue of character or person lookups through the
// worker pool. Items can be added while the job runs.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::descriptor::{BatchState, JobDescriptor};
use super::pool::{ItemProgress, ProgressBoard, WorkQueue, WorkerPool};
use super::{Job, JobContext, JobKind, JobOutput, Services, WorkItem};
use crate::models::SourceId;
use crate::services::sources::DetailSource;

pub struct BatchJob {
    id: Uuid,
    kind: JobKind,
    key: String,
    queue: Arc<WorkQueue>,
    board: Arc<ProgressBoard>,
    /// Serializes read-modify-write of game records between workers.
    save_lock: Arc<Mutex<()>>,
}

impl BatchJob {
    pub fn new(kind: JobKind, key: &str, items: Vec<WorkItem>) -> Self {
        Self::from_state(
            kind,
            BatchState {
                id: Uuid::new_v4(),
                key: key.to_string(),
                items,
            },
        )
    }

    pub fn from_state(kind: JobKind, state: BatchState) -> Self {
        Self {
            id: state.id,
            kind,
            key: state.key,
            queue: Arc::new(WorkQueue::with_items(state.items)),
            board: Arc::new(ProgressBoard::new()),
            save_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl Job for BatchJob {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> JobKind {
        self.kind
    }

    fn key(&self) -> String {
        self.key.clone()
    }

    fn title(&self) -> String {
        match self.kind {
            JobKind::ResolveCharacters => "Resolving characters".to_string(),
            JobKind::ResolvePersonDetail => "Resolving people".to_string(),
            JobKind::RefreshGame => format!("Batch {}", self.key),
        }
    }

    fn queue(&self) -> Option<&WorkQueue> {
        Some(self.queue.as_ref())
    }

    fn descriptor(&self) -> Option<JobDescriptor> {
        let state = BatchState {
            id: self.id,
            key: self.key.clone(),
            items: self.queue.snapshot(),
        };
        match self.kind {
            JobKind::ResolveCharacters => Some(JobDescriptor::ResolveCharacters(state)),
            JobKind::ResolvePersonDetail => Some(JobDescriptor::ResolvePersonDetail(state)),
            JobKind::RefreshGame => None,
        }
    }

    /// Drop items whose game or person has gone away since the job was saved.
    async fn recover(&mut self, services: &Services) -> Result<()> {
        let items = self.queue.snapshot();
        let before = items.len();
        let mut kept = Vec::with_capacity(before);

        for item in items {
            let exists = match &item {
                WorkItem::Character { game_id, .. } => {
                    services.store.get_game(*game_id).await?.is_some()
                }
                WorkItem::PersonDetail { person_id, .. } => {
                    services.roster.get(*person_id).await.is_some()
                        || services.store.get_person(*person_id).await?.is_some()
                }
            };
            if exists {
                kept.push(item);
            }
        }

        if kept.len() < before {
            tracing::info!(
                "Dropped {} stale item(s) from saved {} job",
                before - kept.len(),
                self.kind
            );
        }
        self.queue.reset(kept);
        Ok(())
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput> {
        let settings = &ctx.services.settings;
        let pool = WorkerPool::new(settings.concurrency_limit, settings.tick());

        let services = ctx.services.clone();
        let save_lock = self.save_lock.clone();
        let stats = pool
            .run(
                self.queue.clone(),
                self.board.clone(),
                &ctx.progress,
                move |item, line| {
                    let services = services.clone();
                    let save_lock = save_lock.clone();
                    async move { process_item(&services, &save_lock, item, &line).await }
                },
            )
            .await;

        let noun = match self.kind {
            JobKind::ResolveCharacters => "character",
            _ => "person",
        };
        Ok(JobOutput {
            succeeded: stats.succeeded,
            failed: stats.abandoned,
            message: format!(
                "Resolved {} {}(s), {} abandoned",
                stats.succeeded, noun, stats.abandoned
            ),
        })
    }
}

fn detail_source(services: &Services, source: SourceId) -> Result<&dyn DetailSource> {
    let provider = services
        .registry
        .get(source)
        .ok_or_else(|| anyhow!("{} is not registered", source))?;
    provider
        .as_detail()
        .ok_or_else(|| anyhow!("{} cannot look up details", source))
}

async fn process_item(
    services: &Services,
    save_lock: &Mutex<()>,
    item: WorkItem,
    line: &ItemProgress,
) -> Result<()> {
    let policy = services.settings.throttle_policy();

    match item {
        WorkItem::Character {
            game_id,
            source,
            external_id,
        } => {
            let detail = detail_source(services, source)?;
            line.set(format!("{}: character {}", source, external_id));

            let fetched = policy
                .call(
                    |secs| line.set(format!("{} throttled, retrying in {}s", source, secs)),
                    || detail.fetch_character(&external_id),
                )
                .await?;
            let Some(fetched) = fetched else {
                bail!("{} has no character {}", source, external_id);
            };

            let _guard = save_lock.lock().await;
            let mut game = services
                .store
                .get_game(game_id)
                .await?
                .ok_or_else(|| anyhow!("game {} no longer exists", game_id))?;
            let character = game
                .characters
                .value_mut()
                .and_then(|list| {
                    list.iter_mut()
                        .find(|c| c.identity.id(source) == Some(external_id.as_str()))
                })
                .ok_or_else(|| anyhow!("character {} is no longer listed", external_id))?;

            character.absorb(&fetched);
            services
                .store
                .put_game(&game)
                .await
                .with_context(|| format!("Failed to save game {}", game_id))?;
        }
        WorkItem::PersonDetail {
            person_id,
            source,
            external_id,
        } => {
            let detail = detail_source(services, source)?;
            line.set(format!("{}: person {}", source, external_id));

            let fetched = policy
                .call(
                    |secs| line.set(format!("{} throttled, retrying in {}s", source, secs)),
                    || detail.fetch_person(&external_id),
                )
                .await?;
            let Some(fetched) = fetched else {
                bail!("{} has no person {}", source, external_id);
            };

            services
                .roster
                .apply_detail(person_id, &fetched, services.store.as_ref())
                .await?
                .ok_or_else(|| anyhow!("person {} is no longer in the roster", person_id))?;
        }
    }

    Ok(())
}
