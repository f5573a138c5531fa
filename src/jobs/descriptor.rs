// Resumable job descriptors.
//
// Unfinished jobs are written at shutdown as a versioned JSON document:
//
//   { "version": 1, "saved_at": "...", "jobs": [ { "kind": "chars", "payload": {...} } ] }
//
// Older installs wrote a single line of `<tag> <base64(json)>` pairs. That
// form is still read so pending work survives an upgrade.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

use super::batch::BatchJob;
use super::refresh::RefreshGameJob;
use super::{Job, JobKind, WorkItem};
use crate::error::EngineError;
use crate::models::Identity;

pub const DESCRIPTOR_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshGameState {
    pub id: Uuid,
    pub game_id: Uuid,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub id: Uuid,
    pub key: String,
    #[serde(default)]
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum JobDescriptor {
    #[serde(rename = "refresh")]
    RefreshGame(RefreshGameState),
    #[serde(rename = "chars")]
    ResolveCharacters(BatchState),
    #[serde(rename = "people")]
    ResolvePersonDetail(BatchState),
}

impl JobDescriptor {
    pub fn kind(&self) -> JobKind {
        match self {
            JobDescriptor::RefreshGame(_) => JobKind::RefreshGame,
            JobDescriptor::ResolveCharacters(_) => JobKind::ResolveCharacters,
            JobDescriptor::ResolvePersonDetail(_) => JobKind::ResolvePersonDetail,
        }
    }

    pub fn into_job(self) -> Box<dyn Job> {
        match self {
            JobDescriptor::RefreshGame(state) => Box::new(RefreshGameJob::from_state(state)),
            JobDescriptor::ResolveCharacters(state) => {
                Box::new(BatchJob::from_state(JobKind::ResolveCharacters, state))
            }
            JobDescriptor::ResolvePersonDetail(state) => {
                Box::new(BatchJob::from_state(JobKind::ResolvePersonDetail, state))
            }
        }
    }

    fn from_legacy(tag: &str, payload: &str) -> Result<Option<Self>, String> {
        let Some(kind) = JobKind::from_tag(tag) else {
            return Ok(None);
        };
        let bytes = STANDARD.decode(payload).map_err(|e| e.to_string())?;
        let descriptor = match kind {
            JobKind::RefreshGame => {
                JobDescriptor::RefreshGame(serde_json::from_slice(&bytes).map_err(|e| e.to_string())?)
            }
            JobKind::ResolveCharacters => JobDescriptor::ResolveCharacters(
                serde_json::from_slice(&bytes).map_err(|e| e.to_string())?,
            ),
            JobKind::ResolvePersonDetail => JobDescriptor::ResolvePersonDetail(
                serde_json::from_slice(&bytes).map_err(|e| e.to_string())?,
            ),
        };
        Ok(Some(descriptor))
    }
}

#[derive(Debug, Serialize)]
struct DescriptorFile<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    jobs: &'a [JobDescriptor],
}

/// Read side keeps jobs as raw values so one bad or unknown entry does not
/// discard the rest.
#[derive(Debug, Deserialize)]
struct RawDescriptorFile {
    version: u32,
    #[serde(default)]
    jobs: Vec<serde_json::Value>,
}

pub async fn write_file(path: &Path, jobs: &[JobDescriptor]) -> Result<(), EngineError> {
    let doc = DescriptorFile {
        version: DESCRIPTOR_VERSION,
        saved_at: Utc::now(),
        jobs,
    };
    let json = serde_json::to_string_pretty(&doc)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    // Write then rename so a crash never leaves half a file behind.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Load descriptors; a missing file means nothing to resume.
pub async fn read_file(path: &Path) -> Result<Vec<JobDescriptor>, EngineError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse(&content)
}

pub fn parse(content: &str) -> Result<Vec<JobDescriptor>, EngineError> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(Vec::new());
    }
    if content.starts_with('{') {
        return parse_document(content);
    }
    Ok(parse_legacy(content))
}

fn parse_document(content: &str) -> Result<Vec<JobDescriptor>, EngineError> {
    let doc: RawDescriptorFile = serde_json::from_str(content)?;
    if doc.version > DESCRIPTOR_VERSION {
        tracing::warn!(
            "Job descriptor version {} is newer than supported {}, reading what we can",
            doc.version,
            DESCRIPTOR_VERSION
        );
    }

    let mut jobs = Vec::with_capacity(doc.jobs.len());
    for raw in doc.jobs {
        let kind = raw
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or("?")
            .to_string();
        match serde_json::from_value::<JobDescriptor>(raw) {
            Ok(job) => jobs.push(job),
            Err(e) => tracing::warn!("Skipping unreadable job descriptor ({}): {}", kind, e),
        }
    }
    Ok(jobs)
}

fn parse_legacy(content: &str) -> Vec<JobDescriptor> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    let mut jobs = Vec::new();

    for pair in tokens.chunks(2) {
        let [tag, payload] = pair else {
            tracing::warn!("Ignoring dangling job descriptor token {:?}", pair);
            continue;
        };
        match JobDescriptor::from_legacy(tag, payload) {
            Ok(Some(job)) => jobs.push(job),
            Ok(None) => tracing::debug!("Skipping job descriptor with unknown tag {:?}", tag),
            Err(e) => tracing::warn!("Skipping unreadable {} job descriptor: {}", tag, e),
        }
    }
    jobs
}
