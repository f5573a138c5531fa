// Persistence collaborator contract. The engine only gets and puts whole
// records by id; how they are stored is up to the host.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{CanonicalRecord, PersonRecord};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_game(&self, id: Uuid) -> Result<Option<CanonicalRecord>>;

    async fn put_game(&self, record: &CanonicalRecord) -> Result<()>;

    async fn get_person(&self, id: Uuid) -> Result<Option<PersonRecord>>;

    async fn put_person(&self, record: &PersonRecord) -> Result<()>;

    async fn delete_person(&self, id: Uuid) -> Result<()>;

    /// Every stored person, used to seed the roster at startup.
    async fn people(&self) -> Result<Vec<PersonRecord>>;
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    games: RwLock<HashMap<Uuid, CanonicalRecord>>,
    people: RwLock<HashMap<Uuid, PersonRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn game_count(&self) -> usize {
        self.games.read().await.len()
    }

    pub async fn person_count(&self) -> usize {
        self.people.read().await.len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_game(&self, id: Uuid) -> Result<Option<CanonicalRecord>> {
        Ok(self.games.read().await.get(&id).cloned())
    }

    async fn put_game(&self, record: &CanonicalRecord) -> Result<()> {
        self.games.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_person(&self, id: Uuid) -> Result<Option<PersonRecord>> {
        Ok(self.people.read().await.get(&id).cloned())
    }

    async fn put_person(&self, record: &PersonRecord) -> Result<()> {
        self.people.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete_person(&self, id: Uuid) -> Result<()> {
        self.people.write().await.remove(&id);
        Ok(())
    }

    async fn people(&self) -> Result<Vec<PersonRecord>> {
        Ok(self.people.read().await.values().cloned().collect())
    }
}
