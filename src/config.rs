//! Configuration for storyloom.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STORYLOOM_HOME, STORYLOOM_DB, STORYLOOM_TIMEZONE,
//!    YOUTUBE_API_KEY, WHISPER_PATH, ANALYZER_ENDPOINT, ANALYZER_TOKEN)
//! 2. Config file (.storyloom/config.yaml)
//! 3. Defaults (~/.storyloom)
//!
//! Config file discovery:
//! - Searches current directory and parents for .storyloom/config.yaml
//! - Paths in config file are relative to the .storyloom directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::core::cron::{parse_timezone, CronTrigger};
use crate::core::{QuotaConfig, RetryPolicy};
use crate::domain::QueueName;
use crate::ingest::TranscriptionQueueConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub youtube: YoutubeConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .storyloom/)
    pub home: Option<String>,
    /// SQLite database file (relative to .storyloom/)
    pub database: Option<String>,
    /// Scratch space for downloaded audio (relative to .storyloom/)
    pub work_dir: Option<String>,
}

/// Jobs claimed per worker poll, by queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSizes {
    pub heartbeat: usize,
    pub pull: usize,
    pub fetch_content: usize,
    pub fetch_youtube_content: usize,
    pub analyze: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            heartbeat: 1,
            pull: 1,
            fetch_content: 5,
            fetch_youtube_content: 1,
            analyze: 2,
        }
    }
}

impl BatchSizes {
    pub fn for_queue(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::Heartbeat => self.heartbeat,
            QueueName::IngestPull => self.pull,
            QueueName::FetchContent => self.fetch_content,
            QueueName::FetchYoutubeContent => self.fetch_youtube_content,
            QueueName::AnalyzeLlm => self.analyze,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// IANA timezone for cron schedules and the quota reset hour
    pub timezone: String,
    pub heartbeat_cron: String,
    pub rss_cron: String,
    pub youtube_cron: String,
    pub cron_tick_seconds: u64,
    pub poll_interval_ms: u64,
    pub batch_sizes: BatchSizes,
    pub retry_limit: u32,
    pub retry_delay_seconds: u64,
    pub expire_in_seconds: u64,
    pub archive_after_days: i64,
    /// Send one pull per source family at startup
    pub bootstrap: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            heartbeat_cron: "*/5 * * * *".to_string(),
            rss_cron: "*/5 * * * *".to_string(),
            youtube_cron: "*/15 * * * *".to_string(),
            cron_tick_seconds: 30,
            poll_interval_ms: 2000,
            batch_sizes: BatchSizes::default(),
            retry_limit: 3,
            retry_delay_seconds: 30,
            expire_in_seconds: 900,
            archive_after_days: 7,
            bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeConfig {
    /// Data API key; YouTube ingestion is disabled without one
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub lookback_days: i64,
    pub max_per_run: u32,
    pub search_order: String,
    pub search_duration: String,
    /// yt-dlp binary
    pub downloader: String,
}

impl Default for YoutubeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            lookback_days: 7,
            max_per_run: 25,
            search_order: "date".to_string(),
            search_duration: "any".to_string(),
            downloader: "yt-dlp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub binary: String,
    pub model: String,
    pub language: String,
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_floor_seconds: u64,
    pub timeout_seconds_per_mb: u64,
    pub janitor_interval_seconds: u64,
    pub max_job_age_seconds: i64,
    /// How long a fetch job waits on its transcription
    pub wait_timeout_seconds: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            binary: "whisper".to_string(),
            model: "base".to_string(),
            language: "en".to_string(),
            concurrency: 1,
            max_retries: 2,
            base_delay_ms: 5000,
            max_delay_ms: 60_000,
            timeout_floor_seconds: 300,
            timeout_seconds_per_mb: 60,
            janitor_interval_seconds: 300,
            max_job_age_seconds: 3600,
            wait_timeout_seconds: 3600,
        }
    }
}

impl TranscriptionConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    pub fn queue_config(&self) -> TranscriptionQueueConfig {
        TranscriptionQueueConfig {
            concurrency: self.concurrency.max(1),
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            ),
            timeout_floor: Duration::from_secs(self.timeout_floor_seconds),
            timeout_per_mb: Duration::from_secs(self.timeout_seconds_per_mb),
            janitor_interval: Duration::from_secs(self.janitor_interval_seconds.max(1)),
            max_job_age: chrono::Duration::seconds(self.max_job_age_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

/// Resolved configuration with absolute paths and validated settings
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to storyloom home (engine state)
    pub home: PathBuf,
    pub database: PathBuf,
    pub work_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub quota: QuotaConfig,
    pub youtube: YoutubeConfig,
    pub transcription: TranscriptionConfig,
    pub server: ServerConfig,
    pub analyzer: AnalyzerConfig,
}

impl ResolvedConfig {
    /// Scheduler timezone. Validated at load time.
    pub fn timezone(&self) -> Tz {
        parse_timezone(&self.scheduler.timezone).unwrap_or(chrono_tz::UTC)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".storyloom").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file, environment and defaults, then validate
fn resolve(
    default_home: PathBuf,
    config_file: Option<PathBuf>,
    file: ConfigFile,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    // Paths in the file are relative to .storyloom/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = match (env("STORYLOOM_HOME"), &file.paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home)) => resolve_path(&base_dir, home),
        (None, None) => default_home,
    };

    let database = match (env("STORYLOOM_DB"), &file.paths.database) {
        (Some(db), _) => PathBuf::from(db),
        (None, Some(db)) => resolve_path(&base_dir, db),
        (None, None) => home.join("storyloom.db"),
    };

    let work_dir = file
        .paths
        .work_dir
        .as_deref()
        .map(|w| resolve_path(&base_dir, w))
        .unwrap_or_else(|| home.join("work"));

    let mut scheduler = file.scheduler;
    if let Some(tz) = env("STORYLOOM_TIMEZONE") {
        scheduler.timezone = tz;
    }

    let mut youtube = file.youtube;
    if let Some(key) = env("YOUTUBE_API_KEY") {
        youtube.api_key = Some(key);
    }
    youtube.api_key = youtube.api_key.filter(|k| !k.trim().is_empty());

    let mut transcription = file.transcription;
    if let Some(binary) = env("WHISPER_PATH") {
        transcription.binary = binary;
    }

    let mut analyzer = file.analyzer;
    if let Some(endpoint) = env("ANALYZER_ENDPOINT") {
        analyzer.endpoint = Some(endpoint);
    }
    if let Some(token) = env("ANALYZER_TOKEN") {
        analyzer.token = Some(token);
    }

    // Bad schedules are a startup failure, not a runtime surprise
    parse_timezone(&scheduler.timezone).context("Invalid scheduler.timezone")?;
    for (name, expr) in [
        ("heartbeat_cron", &scheduler.heartbeat_cron),
        ("rss_cron", &scheduler.rss_cron),
        ("youtube_cron", &scheduler.youtube_cron),
    ] {
        CronTrigger::parse(expr, &scheduler.timezone)
            .with_context(|| format!("Invalid scheduler.{}", name))?;
    }
    if file.quota.reset_hour > 23 {
        anyhow::bail!("quota.reset_hour must be 0-23, got {}", file.quota.reset_hour);
    }

    Ok(ResolvedConfig {
        home,
        database,
        work_dir,
        config_file,
        scheduler,
        quota: file.quota,
        youtube,
        transcription,
        server: file.server,
        analyzer,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".storyloom");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve(default_home, config_file, file, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(PathBuf::from("/home/u/.storyloom"), None, ConfigFile::default(), no_env).unwrap();

        assert_eq!(config.database, PathBuf::from("/home/u/.storyloom/storyloom.db"));
        assert_eq!(config.work_dir, PathBuf::from("/home/u/.storyloom/work"));
        assert_eq!(config.scheduler.youtube_cron, "*/15 * * * *");
        assert_eq!(config.scheduler.batch_sizes.for_queue(QueueName::FetchContent), 5);
        assert_eq!(config.quota.daily_limit, 10_000);
        assert_eq!(config.transcription.concurrency, 1);
        assert!(config.youtube.api_key.is_none());
        assert_eq!(config.timezone(), chrono_tz::UTC);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".storyloom");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  database: ./data/loom.db
scheduler:
  timezone: Europe/Berlin
  rss_cron: "0 */10 * * * *"
  batch_sizes:
    fetch_content: 8
quota:
  daily_limit: 5000
youtube:
  max_per_run: 10
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        let config = resolve(
            PathBuf::from("/unused"),
            Some(config_path.clone()),
            parsed,
            no_env,
        )
        .unwrap();

        assert_eq!(config.database, dir.join("./data/loom.db"));
        assert_eq!(config.timezone(), chrono_tz::Europe::Berlin);
        assert_eq!(config.scheduler.batch_sizes.fetch_content, 8);
        // Unset fields keep their defaults
        assert_eq!(config.scheduler.batch_sizes.analyze, 2);
        assert_eq!(config.quota.daily_limit, 5000);
        assert_eq!(config.quota.reserve_buffer, 500);
        assert_eq!(config.youtube.max_per_run, 10);
        assert_eq!(config.youtube.lookback_days, 7);
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("STORYLOOM_HOME", "/srv/loom"),
            ("STORYLOOM_TIMEZONE", "America/New_York"),
            ("YOUTUBE_API_KEY", "key-123"),
            ("WHISPER_PATH", "/opt/whisper"),
            ("ANALYZER_ENDPOINT", "http://localhost:8080/analyze"),
        ]);
        let config = resolve(
            PathBuf::from("/home/u/.storyloom"),
            None,
            ConfigFile::default(),
            |k| env.get(k).map(|v| v.to_string()),
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/loom"));
        assert_eq!(config.database, PathBuf::from("/srv/loom/storyloom.db"));
        assert_eq!(config.timezone(), chrono_tz::America::New_York);
        assert_eq!(config.youtube.api_key.as_deref(), Some("key-123"));
        assert_eq!(config.transcription.binary, "/opt/whisper");
        assert_eq!(
            config.analyzer.endpoint.as_deref(),
            Some("http://localhost:8080/analyze")
        );
    }

    #[test]
    fn test_invalid_schedule_settings_fail() {
        let mut file = ConfigFile::default();
        file.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(resolve(PathBuf::from("/h"), None, file, no_env).is_err());

        let mut file = ConfigFile::default();
        file.scheduler.heartbeat_cron = "every five minutes".to_string();
        assert!(resolve(PathBuf::from("/h"), None, file, no_env).is_err());

        let mut file = ConfigFile::default();
        file.quota.reset_hour = 24;
        assert!(resolve(PathBuf::from("/h"), None, file, no_env).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
