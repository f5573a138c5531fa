// Configuration module for galdex
// Handles XDG-compliant directory paths and TOML configuration file

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{FieldKind, SourceId};
use crate::services::merge::{Producer, ProducerTable, DEFAULT_DEVELOPER_THRESHOLD};
use crate::services::offline_db::DEFAULT_MIN_SCORE;
use crate::services::sources::{FieldPriority, ThrottlePolicy};

const APP_NAME: &str = "galdex";
const CONFIG_FILENAME: &str = "config.toml";
const DESCRIPTOR_FILENAME: &str = "pending_jobs.json";
const CATALOG_FILENAME: &str = "vn-catalog.json";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Directory paths (overrides XDG defaults)
    pub paths: PathsConfig,

    /// Job engine tuning
    pub engine: EngineConfig,

    /// Merge priorities and developer inference
    pub merge: MergeConfig,

    /// Known producers for inferring a developer from tags
    pub producers: Vec<Producer>,

    /// Local offline catalog provider
    pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Override data directory (pending job descriptors)
    pub data_dir: Option<PathBuf>,

    /// Override cache directory (offline catalog)
    pub cache_dir: Option<PathBuf>,

    /// Override config directory
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent items per batch job (default: 3)
    pub concurrency_limit: usize,

    /// Worker pool control loop interval (default: 500ms)
    pub tick_interval_ms: u64,

    /// Wait after a provider throttles us (default: 60s)
    pub throttle_cooldown_secs: u64,

    /// Attempts per item before giving up on a throttled provider (default: 3)
    pub max_throttle_attempts: u32,

    /// Use the provider's retry-after hint instead of the fixed cooldown
    pub honor_retry_after: bool,

    /// Delay between a job finishing and its notification (default: 1000ms)
    pub completion_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            tick_interval_ms: 500,
            throttle_cooldown_secs: 60,
            max_throttle_attempts: 3,
            honor_retry_after: false,
            completion_grace_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn throttle_policy(&self) -> ThrottlePolicy {
        ThrottlePolicy {
            cooldown: Duration::from_secs(self.throttle_cooldown_secs),
            max_attempts: self.max_throttle_attempts.max(1),
            honor_retry_after: self.honor_retry_after,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Provider order for fields without an override
    pub default_priority: Vec<SourceId>,

    /// Per-field provider order, keyed by field name (e.g. "cover_image")
    pub field_priority: BTreeMap<String, Vec<SourceId>>,

    /// Minimum tag/producer similarity for developer inference (default: 0.75)
    pub developer_match_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            default_priority: SourceId::ALL.to_vec(),
            field_priority: BTreeMap::new(),
            developer_match_threshold: DEFAULT_DEVELOPER_THRESHOLD,
        }
    }
}

impl MergeConfig {
    pub fn priority(&self) -> FieldPriority {
        let mut priority = FieldPriority::new(self.default_priority.clone());
        for (name, order) in &self.field_priority {
            match serde_json::from_value::<FieldKind>(serde_json::Value::String(name.clone())) {
                Ok(field) => priority = priority.with_field(field, order.clone()),
                Err(_) => tracing::warn!("Ignoring priority for unknown field {:?}", name),
            }
        }
        priority
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Enable the offline catalog provider
    pub enabled: bool,

    /// Catalog JSON file (default: <cache_dir>/vn-catalog.json)
    pub catalog_file: Option<PathBuf>,

    /// Minimum title similarity for a search hit (default: 0.6)
    pub min_score: f64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            catalog_file: None,
            min_score: DEFAULT_MIN_SCORE,
        }
    }
}

/// Application paths following XDG Base Directory Specification on Unix
/// On other platforms, falls back to the current directory or platform-specific locations
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for configuration files (config.toml)
    pub config_dir: PathBuf,

    /// Directory for persistent data (pending jobs)
    pub data_dir: PathBuf,

    /// Directory for cache files (offline catalog)
    pub cache_dir: PathBuf,
}

impl AppPaths {
    /// Priority order:
    /// 1. Environment variables (GALDEX_CONFIG_DIR, GALDEX_DATA_DIR, GALDEX_CACHE_DIR)
    /// 2. Config file overrides
    /// 3. XDG / platform directories
    /// 4. Current directory fallback
    pub fn new(config_overrides: &PathsConfig) -> Self {
        Self {
            config_dir: resolve_dir(
                "GALDEX_CONFIG_DIR",
                &config_overrides.config_dir,
                dirs::config_dir(),
                false,
            ),
            data_dir: resolve_dir(
                "GALDEX_DATA_DIR",
                &config_overrides.data_dir,
                dirs::data_dir(),
                false,
            ),
            cache_dir: resolve_dir(
                "GALDEX_CACHE_DIR",
                &config_overrides.cache_dir,
                dirs::cache_dir(),
                true,
            ),
        }
    }

    /// Everything under the current directory (portable mode)
    pub fn current_dir() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            config_dir: cwd.clone(),
            data_dir: cwd.clone(),
            cache_dir: cwd.join("cache"),
        }
    }

    /// Where unfinished jobs are saved at shutdown
    pub fn descriptor_path(&self) -> PathBuf {
        self.data_dir.join(DESCRIPTOR_FILENAME)
    }

    pub fn default_catalog_path(&self) -> PathBuf {
        self.cache_dir.join(CATALOG_FILENAME)
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        Ok(())
    }

    pub fn log_paths(&self) {
        tracing::info!("Configuration directory: {}", self.config_dir.display());
        tracing::info!("Data directory: {}", self.data_dir.display());
        tracing::info!("Cache directory: {}", self.cache_dir.display());
        tracing::debug!("Job descriptor path: {}", self.descriptor_path().display());
    }
}

fn resolve_dir(
    env_var: &str,
    config_override: &Option<PathBuf>,
    platform: Option<PathBuf>,
    cache: bool,
) -> PathBuf {
    if let Ok(path) = std::env::var(env_var) {
        return PathBuf::from(path);
    }
    if let Some(ref path) = config_override {
        return path.clone();
    }
    if let Some(dir) = platform {
        return dir.join(APP_NAME);
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if cache {
        cwd.join("cache")
    } else {
        cwd
    }
}

/// Application configuration - combines TOML file with environment overrides
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub paths: AppPaths,
    pub engine: EngineConfig,
    pub merge: MergeConfig,
    pub producers: Vec<Producer>,
    pub offline_enabled: bool,
    pub offline_catalog: PathBuf,
    pub offline_min_score: f64,
}

impl AppConfig {
    /// Load configuration from TOML file and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML config file
    /// 3. Default values
    pub fn load() -> Self {
        let portable_mode = env_flag("GALDEX_PORTABLE").unwrap_or(false);
        if portable_mode {
            tracing::info!("Running in portable mode (using current directory)");
            return Self::build(ConfigFile::default(), AppPaths::current_dir());
        }

        let config_dir = Self::find_config_dir();
        let config_file = Self::load_config_file(&config_dir);
        let paths = AppPaths::new(&config_file.paths);
        Self::build(config_file, paths)
    }

    fn find_config_dir() -> PathBuf {
        if let Ok(path) = std::env::var("GALDEX_CONFIG_DIR") {
            return PathBuf::from(path);
        }
        if let Some(dir) = dirs::config_dir() {
            return dir.join(APP_NAME);
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    fn load_config_file(config_dir: &std::path::Path) -> ConfigFile {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_path.exists() {
            tracing::debug!(
                "No config file found at {}, using defaults",
                config_path.display()
            );
            return ConfigFile::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config file {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    ConfigFile::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                ConfigFile::default()
            }
        }
    }

    fn build(config_file: ConfigFile, paths: AppPaths) -> Self {
        let mut engine = config_file.engine;

        // Concurrency: env > config > default
        if let Some(limit) = env_parse::<usize>("GALDEX_CONCURRENCY") {
            engine.concurrency_limit = limit;
        }

        // Throttle cooldown: env > config > default
        if let Some(secs) = env_parse::<u64>("GALDEX_THROTTLE_COOLDOWN_SECS") {
            engine.throttle_cooldown_secs = secs;
        }

        // Offline catalog: env > config
        let offline_enabled = env_flag("GALDEX_ENABLE_OFFLINE").unwrap_or(config_file.offline.enabled);
        let offline_catalog = std::env::var("GALDEX_OFFLINE_CATALOG")
            .ok()
            .map(PathBuf::from)
            .or(config_file.offline.catalog_file)
            .unwrap_or_else(|| paths.default_catalog_path());

        Self {
            paths,
            engine,
            merge: config_file.merge,
            producers: config_file.producers,
            offline_enabled,
            offline_catalog,
            offline_min_score: config_file.offline.min_score,
        }
    }

    pub fn producer_table(&self) -> ProducerTable {
        ProducerTable::new(self.producers.clone())
    }

    pub fn log_config(&self) {
        self.paths.log_paths();
        tracing::info!(
            "Job engine: {} concurrent item(s) per batch, {}s throttle cooldown ({} attempts)",
            self.engine.concurrency_limit,
            self.engine.throttle_cooldown_secs,
            self.engine.max_throttle_attempts
        );

        if self.producers.is_empty() {
            tracing::debug!("No producer aliases configured; developer inference disabled");
        } else {
            tracing::info!("Producer alias table: {} entries", self.producers.len());
        }

        if self.offline_enabled {
            tracing::info!("Offline catalog: ENABLED ({})", self.offline_catalog.display());
        } else {
            tracing::debug!("Offline catalog: disabled");
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_dir_paths() {
        let paths = AppPaths::current_dir();
        assert!(paths.cache_dir.ends_with("cache"));
        assert!(paths.descriptor_path().ends_with("pending_jobs.json"));
    }

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();
        assert_eq!(config.engine.concurrency_limit, 3);
        assert_eq!(config.engine.tick(), Duration::from_millis(500));
        assert_eq!(
            config.engine.throttle_policy(),
            ThrottlePolicy::default()
        );
        assert_eq!(config.merge.developer_match_threshold, 0.75);
        assert!(!config.offline.enabled);
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[engine]
concurrency_limit = 5
throttle_cooldown_secs = 30
honor_retry_after = true

[merge]
default_priority = ["vndb", "bgm"]
developer_match_threshold = 0.8

[merge.field_priority]
cover_image = ["ymgal"]
not_a_field = ["vndb"]

[[producers]]
name = "Key"
aliases = ["Visual Art's/Key"]

[offline]
enabled = true
catalog_file = "/srv/catalog.json"

[paths]
data_dir = "/custom/data"
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.concurrency_limit, 5);
        assert_eq!(config.engine.tick_interval_ms, 500);
        assert!(config.engine.throttle_policy().honor_retry_after);
        assert_eq!(config.producers[0].aliases.len(), 1);
        assert_eq!(
            config.offline.catalog_file,
            Some(PathBuf::from("/srv/catalog.json"))
        );
        assert_eq!(config.paths.data_dir, Some(PathBuf::from("/custom/data")));

        let priority = config.merge.priority();
        assert_eq!(priority.order(FieldKind::CoverImage)[0], SourceId::Ymgal);
        assert_eq!(priority.order(FieldKind::Description)[0], SourceId::Vndb);
        assert_eq!(priority.overrides.len(), 1);
    }

    #[test]
    fn test_partial_config_toml() {
        let toml_str = r#"
[offline]
enabled = true
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.completion_grace_ms, 1000); // default
        assert!(config.offline.enabled); // from file
        assert_eq!(config.offline.min_score, DEFAULT_MIN_SCORE);
    }
}
