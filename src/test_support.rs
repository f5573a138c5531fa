// Fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{FetchError, FetchResult};
use crate::jobs::{EngineEvents, JobOutcome, JobSummary, Progress, Services};
use crate::models::{Character, Fragment, PersonFragment, SourceId};
use crate::services::merge::{MergeResolver, Producer, ProducerTable, DEFAULT_DEVELOPER_THRESHOLD};
use crate::services::people::Roster;
use crate::services::sources::{
    DetailSource, FieldPriority, MetadataSource, Related, RelatedSource, SourceRegistry,
};
use crate::services::store::MemoryStore;

/// In-memory provider with canned answers.
#[derive(Default)]
pub struct FakeSource {
    id: Option<SourceId>,
    games: HashMap<String, Fragment>,
    games_by_name: HashMap<String, Fragment>,
    related: HashMap<String, Vec<Related>>,
    people: HashMap<String, PersonFragment>,
    characters: HashMap<String, Character>,
    failure: Option<String>,
    delay: Option<Duration>,
    throttle_remaining: AtomicU32,
}

impl FakeSource {
    pub fn new(id: SourceId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn with_game(mut self, id: &str, fragment: Fragment) -> Self {
        self.games.insert(id.to_string(), fragment);
        self
    }

    pub fn with_game_by_name(mut self, name: &str, fragment: Fragment) -> Self {
        self.games_by_name.insert(name.to_string(), fragment);
        self
    }

    pub fn with_related(mut self, id: &str, items: Vec<Related>) -> Self {
        self.related.insert(id.to_string(), items);
        self
    }

    pub fn with_person(mut self, id: &str, person: PersonFragment) -> Self {
        self.people.insert(id.to_string(), person);
        self
    }

    pub fn with_character(mut self, id: &str, character: Character) -> Self {
        self.characters.insert(id.to_string(), character);
        self
    }

    pub fn failing_with(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer `Throttled` to the first `n` calls.
    pub fn throttle_first(self, n: u32) -> Self {
        self.throttle_remaining.store(n, Ordering::SeqCst);
        self
    }

    fn source_id(&self) -> SourceId {
        self.id.unwrap_or(SourceId::Offline)
    }

    async fn gate(&self) -> FetchResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(FetchError::other(self.source_id(), message));
        }
        let throttled = self
            .throttle_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(FetchError::Throttled {
                provider: self.source_id(),
                retry_after: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataSource for FakeSource {
    fn id(&self) -> SourceId {
        self.source_id()
    }

    async fn fetch_by_id(&self, id: &str) -> FetchResult<Option<Fragment>> {
        self.gate().await?;
        Ok(self.games.get(id).cloned())
    }

    async fn fetch_by_name(&self, name: &str) -> FetchResult<Option<Fragment>> {
        self.gate().await?;
        Ok(self.games_by_name.get(name).cloned())
    }

    fn as_related(&self) -> Option<&dyn RelatedSource> {
        (!self.related.is_empty()).then_some(self as &dyn RelatedSource)
    }

    fn as_detail(&self) -> Option<&dyn DetailSource> {
        (!self.people.is_empty() || !self.characters.is_empty())
            .then_some(self as &dyn DetailSource)
    }
}

#[async_trait]
impl RelatedSource for FakeSource {
    async fn fetch_related(&self, game_id: &str) -> FetchResult<Vec<Related>> {
        self.gate().await?;
        Ok(self.related.get(game_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl DetailSource for FakeSource {
    async fn fetch_person(&self, person_id: &str) -> FetchResult<Option<PersonFragment>> {
        self.gate().await?;
        Ok(self.people.get(person_id).cloned())
    }

    async fn fetch_character(&self, character_id: &str) -> FetchResult<Option<Character>> {
        self.gate().await?;
        Ok(self.characters.get(character_id).cloned())
    }
}

/// Keeps every event for assertions.
#[derive(Default)]
pub struct RecordingEvents {
    added: Mutex<Vec<JobSummary>>,
    progress: Mutex<Vec<(Uuid, Progress)>>,
    finished: Mutex<Vec<(JobSummary, JobOutcome)>>,
}

impl RecordingEvents {
    pub fn added_count(&self) -> usize {
        self.added.lock().unwrap().len()
    }

    pub fn progress_count(&self) -> usize {
        self.progress.lock().unwrap().len()
    }

    pub fn finished(&self) -> Vec<(JobSummary, JobOutcome)> {
        self.finished.lock().unwrap().clone()
    }
}

impl EngineEvents for RecordingEvents {
    fn job_added(&self, job: &JobSummary) {
        self.added.lock().unwrap().push(job.clone());
    }

    fn job_progress(&self, id: Uuid, progress: &Progress) {
        self.progress.lock().unwrap().push((id, progress.clone()));
    }

    fn job_finished(&self, job: &JobSummary, outcome: &JobOutcome) {
        self.finished
            .lock()
            .unwrap()
            .push((job.clone(), outcome.clone()));
    }
}

/// Engine settings with short timings so tests finish quickly.
pub fn fast_settings() -> EngineConfig {
    EngineConfig {
        tick_interval_ms: 20,
        throttle_cooldown_secs: 1,
        completion_grace_ms: 5,
        ..EngineConfig::default()
    }
}

pub fn services_for(sources: Vec<FakeSource>, events: Arc<RecordingEvents>) -> Services {
    let mut registry = SourceRegistry::new(FieldPriority::new(SourceId::ALL.to_vec()));
    for source in sources {
        registry.register(Arc::new(source));
    }

    Services {
        registry: Arc::new(registry),
        store: Arc::new(MemoryStore::new()),
        roster: Arc::new(Roster::new()),
        resolver: Arc::new(MergeResolver::new(
            ProducerTable::new(vec![Producer {
                name: "Moonstudio".to_string(),
                aliases: Vec::new(),
            }]),
            DEFAULT_DEVELOPER_THRESHOLD,
        )),
        settings: fast_settings(),
        events,
    }
}

pub fn services_with(events: Arc<RecordingEvents>) -> Services {
    services_for(Vec::new(), events)
}
