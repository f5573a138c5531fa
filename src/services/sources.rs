// Provider capabilities and the ordered registry of configured providers.
//
// A provider implements `MetadataSource` and optionally the related-people
// and detail capabilities; callers ask through `as_related()` / `as_detail()`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FetchError, FetchResult};
use crate::models::{Character, FieldKind, Fragment, PersonFragment, SourceId, StaffCredit};

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn id(&self) -> SourceId;

    async fn fetch_by_id(&self, id: &str) -> FetchResult<Option<Fragment>>;

    async fn fetch_by_name(&self, name: &str) -> FetchResult<Option<Fragment>>;

    /// Providers without a search endpoint return false and are only asked by id.
    fn supports_search(&self) -> bool {
        true
    }

    fn as_related(&self) -> Option<&dyn RelatedSource> {
        None
    }

    fn as_detail(&self) -> Option<&dyn DetailSource> {
        None
    }
}

/// Something a provider lists alongside a game.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    Person(StaffCredit),
    Character(Character),
}

#[async_trait]
pub trait RelatedSource: Send + Sync {
    async fn fetch_related(&self, game_id: &str) -> FetchResult<Vec<Related>>;
}

#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_person(&self, person_id: &str) -> FetchResult<Option<PersonFragment>>;

    async fn fetch_character(&self, character_id: &str) -> FetchResult<Option<Character>>;
}

/// Provider order per field category. Categories without an override use
/// the default order; sources missing from both are ranked last in
/// `SourceId` order so every source always has a rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPriority {
    pub default: Vec<SourceId>,
    #[serde(default)]
    pub overrides: HashMap<FieldKind, Vec<SourceId>>,
}

impl FieldPriority {
    pub fn new(default: Vec<SourceId>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_field(mut self, field: FieldKind, order: Vec<SourceId>) -> Self {
        self.overrides.insert(field, order);
        self
    }

    pub fn order(&self, field: FieldKind) -> Vec<SourceId> {
        let mut order: Vec<SourceId> = Vec::with_capacity(SourceId::ALL.len());
        let preferred = self.overrides.get(&field).into_iter().flatten();
        for source in preferred
            .chain(self.default.iter())
            .chain(SourceId::ALL.iter())
        {
            if !order.contains(source) {
                order.push(*source);
            }
        }
        order
    }
}

pub struct SourceRegistry {
    sources: Vec<Arc<dyn MetadataSource>>,
    priority: FieldPriority,
}

impl SourceRegistry {
    pub fn new(priority: FieldPriority) -> Self {
        Self {
            sources: Vec::new(),
            priority,
        }
    }

    /// Add a provider; a second registration for the same id replaces the first.
    pub fn register(&mut self, source: Arc<dyn MetadataSource>) {
        let id = source.id();
        if let Some(slot) = self.sources.iter_mut().find(|s| s.id() == id) {
            tracing::debug!("Replacing provider {}", id);
            *slot = source;
        } else {
            tracing::debug!("Registered provider {}", id);
            self.sources.push(source);
        }
    }

    pub fn get(&self, id: SourceId) -> Option<&Arc<dyn MetadataSource>> {
        self.sources.iter().find(|s| s.id() == id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<dyn MetadataSource>> {
        self.sources.iter()
    }

    pub fn priority(&self) -> &FieldPriority {
        &self.priority
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Cooldown-and-retry behaviour for throttled provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlePolicy {
    pub cooldown: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Use the provider's retry-after hint instead of the fixed cooldown.
    pub honor_retry_after: bool,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_attempts: 3,
            honor_retry_after: false,
        }
    }
}

impl ThrottlePolicy {
    fn wait_for(&self, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) if self.honor_retry_after => hint.min(self.cooldown * 5),
            _ => self.cooldown,
        }
    }

    /// Run `call`, sleeping and retrying while the provider reports
    /// `Throttled`. `on_wait` receives the remaining seconds once per second
    /// of cooldown. Any other error is returned immediately.
    pub async fn call<T, F, Fut, W>(&self, mut on_wait: W, mut call: F) -> FetchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetchResult<T>>,
        W: FnMut(u64),
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(FetchError::Throttled {
                    provider,
                    retry_after,
                }) if attempt < self.max_attempts => {
                    let wait = self.wait_for(retry_after);
                    tracing::info!(
                        "{} throttled, retrying in {:?} (attempt {}/{})",
                        provider,
                        wait,
                        attempt,
                        self.max_attempts
                    );

                    let mut remaining = wait;
                    while !remaining.is_zero() {
                        on_wait(remaining.as_secs_f64().ceil() as u64);
                        let step = remaining.min(Duration::from_secs(1));
                        tokio::time::sleep(step).await;
                        remaining -= step;
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
