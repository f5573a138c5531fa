// Person roster and deduplication.
//
// The roster is the one shared list of people across all games. Each refresh
// hands its staff list to `PersonDeduplicator::apply`, which links the game to
// existing roster entries where the identity matches and creates entries for
// the rest. Find-or-create and the store writes that follow it run under the
// roster lock.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::identity::{best_match, dedup_by_identity};
use super::sources::SourceRegistry;
use super::store::RecordStore;
use crate::jobs::{JobKind, JobScheduler, WorkItem};
use crate::models::{PersonFragment, PersonRecord, StaffCredit};

/// Key of the shared person-detail batch job.
pub const PERSON_DETAIL_KEY: &str = "roster";

/// Lock-guarded list of people, kept in insertion order.
#[derive(Default)]
pub struct Roster {
    people: Mutex<Vec<PersonRecord>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_people(people: Vec<PersonRecord>) -> Self {
        Self {
            people: Mutex::new(people),
        }
    }

    pub async fn len(&self) -> usize {
        self.people.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.people.lock().await.is_empty()
    }

    pub async fn get(&self, id: Uuid) -> Option<PersonRecord> {
        self.people.lock().await.iter().find(|p| p.id == id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<PersonRecord> {
        self.people.lock().await.clone()
    }

    /// People currently linked to `game_id`.
    pub async fn linked_to(&self, game_id: Uuid) -> Vec<PersonRecord> {
        self.people
            .lock()
            .await
            .iter()
            .filter(|p| p.game_links.contains_key(&game_id))
            .cloned()
            .collect()
    }

    /// Apply fetched detail to a person and save it. `Ok(None)` when the
    /// person has left the roster.
    pub async fn apply_detail(
        &self,
        id: Uuid,
        detail: &PersonFragment,
        store: &dyn RecordStore,
    ) -> Result<Option<PersonRecord>> {
        let mut people = self.people.lock().await;
        let Some(person) = people.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        person.apply_detail(detail);
        store
            .put_person(person)
            .await
            .with_context(|| format!("Failed to save person {}", id))?;
        Ok(Some(person.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub linked: usize,
    pub created: usize,
    pub unlinked: usize,
    pub deleted: usize,
    pub detail_queued: usize,
}

pub struct PersonDeduplicator {
    roster: Arc<Roster>,
    store: Arc<dyn RecordStore>,
    detail: Option<(Arc<JobScheduler>, Arc<SourceRegistry>)>,
}

impl PersonDeduplicator {
    pub fn new(roster: Arc<Roster>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            roster,
            store,
            detail: None,
        }
    }

    /// Queue detail fetches for people that lack a portrait or description.
    pub fn with_detail_queue(
        mut self,
        scheduler: Arc<JobScheduler>,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        self.detail = Some((scheduler, registry));
        self
    }

    pub async fn apply(&self, game_id: Uuid, credits: Vec<StaffCredit>) -> Result<DedupReport> {
        let credits = consolidate(credits);
        let mut report = DedupReport::default();

        let (touched, unlinked, deleted) = {
            let mut people = self.roster.people.lock().await;
            let mut linked: HashSet<Uuid> = HashSet::new();

            for credit in credits {
                let identity = &credit.person.identity;
                if identity.name().is_none() && !identity.has_any_id() {
                    tracing::debug!("Skipping anonymous credit on game {}", game_id);
                    continue;
                }

                let found = best_match(people.iter(), identity, |p| &p.identity).map(|(p, _)| p.id);
                let index = match found.and_then(|id| people.iter().position(|p| p.id == id)) {
                    Some(index) => index,
                    None => {
                        people.push(PersonRecord::new(identity.clone()));
                        report.created += 1;
                        people.len() - 1
                    }
                };

                let person = &mut people[index];
                person.identity.absorb(identity);
                if person.needs_detail() {
                    person.apply_detail(&credit.person);
                }
                person.roles.extend(credit.roles.iter().cloned());

                // First credit in this pass replaces the link; later credits
                // that resolved to the same person add to it.
                if linked.insert(person.id) {
                    person.game_links.insert(game_id, credit.roles.clone());
                } else {
                    person
                        .game_links
                        .entry(game_id)
                        .or_default()
                        .extend(credit.roles.iter().cloned());
                }
            }

            let mut unlinked = Vec::new();
            for person in people.iter_mut() {
                if !linked.contains(&person.id) && person.game_links.remove(&game_id).is_some() {
                    unlinked.push(person.id);
                }
            }

            let mut deleted = Vec::new();
            people.retain(|p| {
                let orphan = p.game_links.is_empty() && unlinked.contains(&p.id);
                if orphan {
                    deleted.push(p.id);
                }
                !orphan
            });

            let touched: Vec<PersonRecord> = people
                .iter()
                .filter(|p| linked.contains(&p.id) || unlinked.contains(&p.id))
                .cloned()
                .collect();

            // Written before the guard drops so a concurrent pass can't
            // overwrite these with an older copy.
            for person in &touched {
                self.store
                    .put_person(person)
                    .await
                    .with_context(|| format!("Failed to save person {}", person.id))?;
            }
            for id in &deleted {
                tracing::debug!("Removing person {} (no remaining games)", id);
                self.store
                    .delete_person(*id)
                    .await
                    .with_context(|| format!("Failed to delete person {}", id))?;
            }

            report.linked = linked.len();
            (touched, unlinked, deleted)
        };

        report.unlinked = unlinked.len();
        report.deleted = deleted.len();

        if let Some((scheduler, registry)) = &self.detail {
            let items: Vec<WorkItem> = touched
                .iter()
                .filter(|p| p.game_links.contains_key(&game_id) && p.needs_detail())
                .filter_map(|p| detail_item(registry, p))
                .collect();

            if !items.is_empty() {
                report.detail_queued = items.len();
                scheduler
                    .enqueue_batch(JobKind::ResolvePersonDetail, PERSON_DETAIL_KEY, items)
                    .context("Failed to queue person detail lookups")?;
            }
        }

        tracing::debug!(
            "Staff for game {}: {} linked ({} new), {} unlinked, {} deleted",
            game_id,
            report.linked,
            report.created,
            report.unlinked,
            report.deleted
        );

        Ok(report)
    }
}

/// Merge repeated credits for the same person within one fetch.
fn consolidate(credits: Vec<StaffCredit>) -> Vec<StaffCredit> {
    dedup_by_identity(
        credits,
        |c| &c.person.identity,
        |kept, dup| {
            kept.roles.extend(dup.roles);
            kept.person.identity.absorb(&dup.person.identity);
            if kept.person.image_url.is_none() {
                kept.person.image_url = dup.person.image_url;
            }
            if kept.person.description.is_none() {
                kept.person.description = dup.person.description;
            }
        },
    )
}

fn detail_item(registry: &SourceRegistry, person: &PersonRecord) -> Option<WorkItem> {
    registry.sources().find_map(|source| {
        source.as_detail()?;
        let external_id = person.identity.id(source.id())?;
        Some(WorkItem::PersonDetail {
            person_id: person.id,
            source: source.id(),
            external_id: external_id.to_string(),
        })
    })
}
