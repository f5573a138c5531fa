// Refresh one game: fetch from every provider, merge, link staff into the
// roster and queue character lookups.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::descriptor::{JobDescriptor, RefreshGameState};
use super::{Job, JobContext, JobKind, JobOutput, Services, WorkItem};
use crate::models::{CanonicalRecord, Identity, SourceId};
use crate::services::merge::fetch_fragments;
use crate::services::people::PersonDeduplicator;
use crate::services::sources::SourceRegistry;

pub struct RefreshGameJob {
    id: Uuid,
    game_id: Uuid,
    identity: Identity,
}

impl RefreshGameJob {
    pub fn new(game_id: Uuid, identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_id,
            identity,
        }
    }

    pub fn from_state(state: RefreshGameState) -> Self {
        Self {
            id: state.id,
            game_id: state.game_id,
            identity: state.identity,
        }
    }
}

#[async_trait]
impl Job for RefreshGameJob {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> JobKind {
        JobKind::RefreshGame
    }

    fn key(&self) -> String {
        self.game_id.to_string()
    }

    fn title(&self) -> String {
        format!("Refreshing {}", self.identity.label())
    }

    fn prepare(&self) -> Result<()> {
        if self.identity.name().is_none() && !self.identity.has_any_id() {
            anyhow::bail!("game {} has neither a name nor a provider id", self.game_id);
        }
        Ok(())
    }

    fn descriptor(&self) -> Option<JobDescriptor> {
        Some(JobDescriptor::RefreshGame(RefreshGameState {
            id: self.id,
            game_id: self.game_id,
            identity: self.identity.clone(),
        }))
    }

    /// Pick up ids learned since the job was saved.
    async fn recover(&mut self, services: &Services) -> Result<()> {
        if let Some(record) = services.store.get_game(self.game_id).await? {
            self.identity.absorb(&record.identity);
        }
        Ok(())
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput> {
        let services = &ctx.services;
        let label = self.identity.label();

        ctx.progress.report(0, 3, format!("Fetching {}", label));
        let policy = services.settings.throttle_policy();
        let on_wait = |source: SourceId, secs: u64| {
            ctx.progress
                .report(0, 3, format!("{} throttled, retrying in {}s", source, secs))
        };
        let fragments =
            fetch_fragments(&services.registry, &self.identity, &policy, &on_wait).await;

        let answered = fragments.iter().filter(|(_, f)| f.is_some()).count();
        if answered == 0 {
            return Ok(JobOutput {
                succeeded: 0,
                failed: fragments.len(),
                message: format!("No provider had data for {}", label),
            });
        }

        ctx.progress.report(1, 3, format!("Merging {}", label));
        let priority = services.registry.priority();
        let existing = services
            .store
            .get_game(self.game_id)
            .await
            .with_context(|| format!("Failed to load game {}", self.game_id))?;

        let mut record = match existing {
            Some(mut record) => {
                services.resolver.remerge(priority, &mut record, &fragments)?;
                record
            }
            None => services
                .resolver
                .merge(priority, self.game_id, &self.identity, &fragments)?,
        };
        record.updated_at = Some(Utc::now());

        services
            .store
            .put_game(&record)
            .await
            .with_context(|| format!("Failed to save game {}", self.game_id))?;

        ctx.progress.report(2, 3, format!("Linking staff for {}", label));
        let staff = record.staff.value().cloned().unwrap_or_default();
        let report = PersonDeduplicator::new(services.roster.clone(), services.store.clone())
            .with_detail_queue(ctx.scheduler.clone(), services.registry.clone())
            .apply(self.game_id, staff)
            .await?;

        let items = character_items(&services.registry, &record);
        let queued = items.len();
        if !items.is_empty() {
            ctx.scheduler
                .enqueue_batch(JobKind::ResolveCharacters, &self.key(), items)
                .context("Failed to queue character lookups")?;
        }

        ctx.progress.report(3, 3, format!("Updated {}", label));
        Ok(JobOutput {
            succeeded: answered,
            failed: fragments.len() - answered,
            message: format!(
                "Updated {} from {} provider(s), {} staff linked, {} character lookup(s) queued",
                record.identity.label(),
                answered,
                report.linked,
                queued
            ),
        })
    }
}

/// Characters that still need detail and have an id on a provider that can
/// supply it.
fn character_items(registry: &SourceRegistry, record: &CanonicalRecord) -> Vec<WorkItem> {
    let Some(characters) = record.characters.value() else {
        return Vec::new();
    };

    characters
        .iter()
        .filter(|c| c.needs_detail())
        .filter_map(|c| {
            registry.sources().find_map(|source| {
                source.as_detail()?;
                let external_id = c.identity.id(source.id())?;
                Some(WorkItem::Character {
                    game_id: record.id,
                    source: source.id(),
                    external_id: external_id.to_string(),
                })
            })
        })
        .collect()
}
