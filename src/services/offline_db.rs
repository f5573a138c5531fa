// Offline catalog provider
// Uses a local JSON dump of visual-novel entries for title -> id mapping.
// Each entry lists the provider pages it appears on, which gives us
// cross-referenced ids for Bangumi, VNDB, YMGal and CnGal without a network
// round trip.
//
// File layout: { "data": [ { "title": ..., "synonyms": [...], "sources": [...], ... } ] }

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

use super::sources::MetadataSource;
use crate::error::{FetchError, FetchResult};
use crate::models::{Fragment, Identity, SourceId};

pub const DEFAULT_MIN_SCORE: f64 = 0.6;

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(rename = "localizedTitle")]
    pub localized_title: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub developer: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "releaseDate")]
    pub release_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub picture: Option<String>,
}

impl CatalogEntry {
    /// Provider ids recovered from the entry's source urls.
    pub fn identity(&self) -> Identity {
        let mut identity = Identity::named(self.title.clone()).with_id(SourceId::Offline, &self.id);
        identity.localized_name = self.localized_title.clone();

        for url in &self.sources {
            let found = [
                (SourceId::Bangumi, "bgm.tv/subject/"),
                (SourceId::Bangumi, "bangumi.tv/subject/"),
                (SourceId::Vndb, "vndb.org/"),
                (SourceId::Ymgal, "ymgal.games/ga"),
                (SourceId::Cngal, "cngal.org/entries/index/"),
            ]
            .into_iter()
            .find_map(|(source, pattern)| extract_id_from_url(url, pattern).map(|id| (source, id)));

            if let Some((source, id)) = found {
                identity.external_ids.entry(source).or_insert(id);
            }
        }

        identity
    }

    fn to_fragment(&self) -> Fragment {
        Fragment {
            identity: self.identity(),
            description: self.description.clone(),
            developer: self.developer.clone(),
            cover_url: self.picture.clone(),
            release_date: self.release_date,
            tags: (!self.tags.is_empty()).then(|| self.tags.clone()),
            ..Default::default()
        }
    }
}

fn extract_id_from_url(url: &str, pattern: &str) -> Option<String> {
    let pos = url.find(pattern)?;
    let after = &url[pos + pattern.len()..];
    // VNDB ids keep their letter prefix (v17), the rest are bare numbers
    let id: String = after
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    (!id.is_empty()).then_some(id)
}

#[derive(Debug, Deserialize)]
struct CatalogRoot {
    data: Vec<CatalogEntry>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entry: CatalogEntry,
    pub score: f64,
}

pub struct OfflineCatalog {
    path: PathBuf,
    min_score: f64,
    /// The loaded catalog (lazy loaded)
    entries: RwLock<Option<Vec<CatalogEntry>>>,
    /// Lowercase title and synonym -> entry indices
    title_index: RwLock<HashMap<String, Vec<usize>>>,
}

impl OfflineCatalog {
    pub fn new(path: PathBuf, min_score: f64) -> Self {
        tracing::info!("Offline catalog enabled: {}", path.display());
        Self {
            path,
            min_score,
            entries: RwLock::new(None),
            title_index: RwLock::new(HashMap::new()),
        }
    }

    /// Load the catalog ahead of the first lookup.
    pub async fn preload(&self) -> Result<()> {
        self.ensure_loaded().await
    }

    /// Drop the catalog from memory; the next lookup reloads it.
    pub async fn unload(&self) {
        let mut entries = self.entries.write().await;
        if entries.is_some() {
            *entries = None;
            self.title_index.write().await.clear();
            tracing::info!("Offline catalog unloaded from memory");
        }
    }

    async fn ensure_loaded(&self) -> Result<()> {
        {
            let entries = self.entries.read().await;
            if entries.is_some() {
                return Ok(());
            }
        }

        let mut entries = self.entries.write().await;
        if entries.is_some() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read offline catalog {}", self.path.display()))?;
        let root: CatalogRoot =
            serde_json::from_str(&content).context("Failed to parse offline catalog")?;

        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, entry) in root.data.iter().enumerate() {
            index.entry(entry.title.to_lowercase()).or_default().push(i);
            for syn in entry.synonyms.iter().chain(entry.localized_title.iter()) {
                index.entry(syn.to_lowercase()).or_default().push(i);
            }
        }

        tracing::info!("Loaded {} offline catalog entries", root.data.len());
        *self.title_index.write().await = index;
        *entries = Some(root.data);
        Ok(())
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.ensure_loaded().await?;

        let query = query.trim().to_lowercase();
        let entries = self.entries.read().await;
        let Some(entries) = entries.as_ref() else {
            return Ok(Vec::new());
        };
        let index = self.title_index.read().await;

        // Exact title hits skip the fuzzy pass.
        if let Some(indices) = index.get(&query) {
            return Ok(indices
                .iter()
                .filter_map(|&i| entries.get(i))
                .map(|entry| SearchResult {
                    entry: entry.clone(),
                    score: 1.0,
                })
                .collect());
        }

        let mut results: Vec<SearchResult> = entries
            .iter()
            .filter_map(|entry| {
                let score = match_score(&query, entry);
                (score >= self.min_score).then(|| SearchResult {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(10);
        Ok(results)
    }

    pub async fn find_by_id(&self, source: SourceId, id: &str) -> Result<Option<CatalogEntry>> {
        self.ensure_loaded().await?;

        let entries = self.entries.read().await;
        let Some(entries) = entries.as_ref() else {
            return Ok(None);
        };

        Ok(entries
            .iter()
            .find(|entry| entry.identity().id(source) == Some(id))
            .cloned())
    }
}

fn match_score(query: &str, entry: &CatalogEntry) -> f64 {
    std::iter::once(&entry.title)
        .chain(entry.synonyms.iter())
        .chain(entry.localized_title.iter())
        .map(|title| strsim::normalized_levenshtein(query, &title.to_lowercase()))
        .fold(0.0, f64::max)
}

#[async_trait]
impl MetadataSource for OfflineCatalog {
    fn id(&self) -> SourceId {
        SourceId::Offline
    }

    async fn fetch_by_id(&self, id: &str) -> FetchResult<Option<Fragment>> {
        let entry = self
            .find_by_id(SourceId::Offline, id)
            .await
            .map_err(|e| FetchError::other(SourceId::Offline, format!("{:#}", e)))?;
        Ok(entry.map(|e| e.to_fragment()))
    }

    async fn fetch_by_name(&self, name: &str) -> FetchResult<Option<Fragment>> {
        let results = self
            .search(name)
            .await
            .map_err(|e| FetchError::other(SourceId::Offline, format!("{:#}", e)))?;

        if let Some(best) = results.first() {
            tracing::debug!(
                "Offline catalog match for {:?}: {} (score {:.2})",
                name,
                best.entry.title,
                best.score
            );
        }
        Ok(results.into_iter().next().map(|r| r.entry.to_fragment()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"{
        "data": [
            {
                "id": "1",
                "title": "Sakura no Uta",
                "synonyms": ["Sakura no Uta -Sakura no Mori no Ue o Mau-"],
                "localizedTitle": "樱之诗",
                "sources": ["https://bgm.tv/subject/100", "https://vndb.org/v17"],
                "developer": "???",
                "tags": ["MoonStudio", "Drama"],
                "releaseDate": "2015-10-30"
            },
            {
                "id": "2",
                "title": "Summer Pockets",
                "sources": ["https://www.ymgal.games/ga27"],
                "developer": "Key"
            }
        ]
    }"#;

    fn catalog() -> (tempfile::NamedTempFile, OfflineCatalog) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        let catalog = OfflineCatalog::new(file.path().to_path_buf(), DEFAULT_MIN_SCORE);
        (file, catalog)
    }

    #[test]
    fn test_extract_id_from_url() {
        assert_eq!(
            extract_id_from_url("https://bgm.tv/subject/100", "bgm.tv/subject/"),
            Some("100".to_string())
        );
        assert_eq!(
            extract_id_from_url("https://vndb.org/v17", "vndb.org/"),
            Some("v17".to_string())
        );
        assert_eq!(extract_id_from_url("https://vndb.org/", "vndb.org/"), None);
    }

    #[tokio::test]
    async fn test_exact_and_fuzzy_search() {
        let (_file, catalog) = catalog();

        let exact = catalog.search("樱之诗").await.unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].entry.id, "1");

        let fuzzy = catalog.search("Summer Pocket").await.unwrap();
        assert_eq!(fuzzy[0].entry.title, "Summer Pockets");

        assert!(catalog.search("Completely Unrelated").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fragment_carries_cross_ids() {
        let (_file, catalog) = catalog();

        let fragment = catalog
            .fetch_by_name("Sakura no Uta")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fragment.identity.id(SourceId::Bangumi), Some("100"));
        assert_eq!(fragment.identity.id(SourceId::Vndb), Some("v17"));
        assert_eq!(fragment.identity.id(SourceId::Offline), Some("1"));
        assert_eq!(fragment.tags.as_ref().unwrap().len(), 2);

        let by_id = catalog.fetch_by_id("2").await.unwrap().unwrap();
        assert_eq!(by_id.identity.id(SourceId::Ymgal), Some("27"));
    }

    #[tokio::test]
    async fn test_missing_catalog_is_a_provider_error() {
        let catalog = OfflineCatalog::new(PathBuf::from("/nonexistent/catalog.json"), 0.6);
        let err = catalog.fetch_by_name("anything").await.unwrap_err();
        assert!(matches!(err, FetchError::Other { provider: SourceId::Offline, .. }));
    }
}
