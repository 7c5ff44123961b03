//! Service wiring.
//!
//! Builds the store-backed orchestrator, the quota tracker, the coordinators,
//! the transcription queue and every queue handler from a resolved config,
//! and exposes the operations shared by the HTTP surface and the CLI.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{
    AudioDownloader, ContentExtractor, FeedFetcher, HttpExtractor, HttpFeedFetcher, LogOnlyAnalyzer,
    StoryAnalyzer, WebhookAnalyzer, YoutubeApi, YoutubeDataClient, YtDlpDownloader,
};
use crate::config::ResolvedConfig;
use crate::domain::{
    FetchContentPayload, FetchYoutubePayload, HeartbeatPayload, ItemKind, NewRawItem, PullPayload,
    QueueName, QuotaStatus, SourceFamily,
};
use crate::ingest::{
    canonicalize_url, classify_url, AnalyzeHandler, FetchContentHandler, FetchYoutubeHandler,
    HeartbeatHandler, PullHandler, QueueStats, RemoveWorkingFiles, RssCoordinator, StoryDeduper,
    Transcriber, TranscriptionQueue, UrlKind, WhisperTranscriber, YoutubeCoordinator,
    YoutubeSettings,
};
use crate::store::{Store, StoreError, MANUAL_SOURCE_ID};

use super::job_store::{JobDefaults, JobStore, JobStoreError};
use super::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
use super::quota::QuotaTracker;

/// Provider name used for quota bookkeeping
pub const YOUTUBE_PROVIDER: &str = "youtube";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const QUOTA_RETENTION_DAYS: i64 = 2;

/// Errors surfaced by operational actions
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    JobStore(#[from] JobStoreError),

    #[error(transparent)]
    Orchestrator(OrchestratorError),
}

impl From<OrchestratorError> for ServiceError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Cron(e) => Self::InvalidInput(e.to_string()),
            other => Self::Orchestrator(other),
        }
    }
}

/// External collaborators the pipeline talks to
pub struct Collaborators {
    pub feeds: Arc<dyn FeedFetcher>,
    pub extractor: Arc<dyn ContentExtractor>,
    /// `None` disables YouTube ingestion
    pub youtube: Option<Arc<dyn YoutubeApi>>,
    pub downloader: Arc<dyn AudioDownloader>,
    pub transcriber: Arc<dyn Transcriber>,
    pub analyzer: Arc<dyn StoryAnalyzer>,
}

impl Collaborators {
    /// HTTP and subprocess implementations configured from `config`
    pub fn from_config(config: &ResolvedConfig) -> anyhow::Result<Self> {
        let youtube: Option<Arc<dyn YoutubeApi>> = match &config.youtube.api_key {
            Some(key) => Some(Arc::new(YoutubeDataClient::new(key.clone(), HTTP_TIMEOUT)?)),
            None => None,
        };

        let analyzer: Arc<dyn StoryAnalyzer> = match &config.analyzer.endpoint {
            Some(endpoint) => Arc::new(WebhookAnalyzer::new(
                endpoint.clone(),
                config.analyzer.token.clone(),
                HTTP_TIMEOUT,
            )?),
            None => Arc::new(LogOnlyAnalyzer),
        };

        let t = &config.transcription;
        Ok(Self {
            feeds: Arc::new(HttpFeedFetcher::new(HTTP_TIMEOUT)?),
            extractor: Arc::new(HttpExtractor::new(HTTP_TIMEOUT)?),
            youtube,
            downloader: Arc::new(YtDlpDownloader::new(&config.youtube.downloader)),
            transcriber: Arc::new(WhisperTranscriber::new(&t.binary, &t.model, &t.language)),
            analyzer,
        })
    }
}

/// Source counters for status snapshots
#[derive(Debug, Clone, Serialize)]
pub struct SourceCounts {
    pub total: u64,
    pub active: u64,
}

/// Aggregated operational status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub sources: SourceCounts,
    pub raw_items: HashMap<String, u64>,
    pub contents: u64,
    pub stories: u64,
    pub jobs: BTreeMap<String, BTreeMap<String, u64>>,
    pub transcription: QueueStats,
    pub quota: QuotaStatus,
    pub youtube_enabled: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Result of submitting a one-off URL
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub raw_item_id: String,
    pub kind: ItemKind,
    pub canonical_url: String,
    /// Already known; nothing was queued
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// The running system
pub struct Services {
    store: Store,
    orchestrator: Arc<Orchestrator>,
    transcription: Arc<TranscriptionQueue>,
    quota: Arc<QuotaTracker>,
    heartbeat: Arc<HeartbeatHandler>,
    youtube_enabled: bool,
    schedules: Vec<(QueueName, String, serde_json::Value)>,
    bootstrap: bool,
    cancel: CancellationToken,
}

impl Services {
    /// Wire everything up. Nothing runs until `start`.
    pub fn build(
        config: &ResolvedConfig,
        store: Store,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let timezone = config.timezone();
        let sched = &config.scheduler;

        let jobs = JobStore::new(
            store.clone(),
            JobDefaults {
                retry_limit: sched.retry_limit,
                retry_delay: Duration::from_secs(sched.retry_delay_seconds),
            },
        );
        let orchestrator = Arc::new(Orchestrator::new(
            jobs,
            OrchestratorConfig {
                timezone: sched.timezone.clone(),
                poll_interval: Duration::from_millis(sched.poll_interval_ms),
                cron_tick: Duration::from_secs(sched.cron_tick_seconds.max(1)),
                expire_in: Duration::from_secs(sched.expire_in_seconds),
                archive_after: chrono::Duration::days(sched.archive_after_days),
            },
        ));
        let dispatcher = orchestrator.dispatcher();

        let quota = Arc::new(QuotaTracker::new(YOUTUBE_PROVIDER, config.quota.clone(), timezone));
        restore_quota(&store, &quota);

        store.ensure_manual_source()?;

        let cancel = CancellationToken::new();
        let t = &config.transcription;
        let transcription = Arc::new(
            TranscriptionQueue::new(collaborators.transcriber, t.queue_config())
                .with_cleanup(Arc::new(RemoveWorkingFiles::new(&config.work_dir)))
                .with_shutdown(cancel.child_token()),
        );

        let rss = Arc::new(RssCoordinator::new(store.clone(), collaborators.feeds, dispatcher.clone()));
        let youtube = collaborators.youtube.map(|api| {
            Arc::new(YoutubeCoordinator::new(
                store.clone(),
                api,
                quota.clone(),
                dispatcher.clone(),
                YoutubeSettings {
                    lookback_days: config.youtube.lookback_days,
                    max_per_run: config.youtube.max_per_run,
                    search_order: config.youtube.search_order.clone(),
                    search_duration: config.youtube.search_duration.clone(),
                },
            ))
        });
        let youtube_enabled = youtube.is_some();

        let deduper = StoryDeduper::new(store.clone(), dispatcher);
        let heartbeat = Arc::new(HeartbeatHandler::default());
        let batch = &sched.batch_sizes;

        orchestrator.work(
            QueueName::Heartbeat,
            batch.for_queue(QueueName::Heartbeat),
            heartbeat.clone(),
        );
        orchestrator.work(
            QueueName::IngestPull,
            batch.for_queue(QueueName::IngestPull),
            Arc::new(PullHandler::new(rss, youtube)),
        );
        orchestrator.work(
            QueueName::FetchContent,
            batch.for_queue(QueueName::FetchContent),
            Arc::new(FetchContentHandler::new(
                store.clone(),
                collaborators.extractor,
                deduper.clone(),
            )),
        );
        orchestrator.work(
            QueueName::FetchYoutubeContent,
            batch.for_queue(QueueName::FetchYoutubeContent),
            Arc::new(FetchYoutubeHandler::new(
                store.clone(),
                collaborators.downloader,
                transcription.clone(),
                deduper,
                &config.work_dir,
                t.wait_timeout(),
            )),
        );
        orchestrator.work(
            QueueName::AnalyzeLlm,
            batch.for_queue(QueueName::AnalyzeLlm),
            Arc::new(AnalyzeHandler::new(store.clone(), collaborators.analyzer)),
        );

        let mut schedules = vec![
            (
                QueueName::Heartbeat,
                sched.heartbeat_cron.clone(),
                serde_json::to_value(HeartbeatPayload::default())?,
            ),
            (
                QueueName::IngestPull,
                sched.rss_cron.clone(),
                serde_json::to_value(PullPayload {
                    source: SourceFamily::Rss,
                })?,
            ),
        ];
        if youtube_enabled {
            schedules.push((
                QueueName::IngestPull,
                sched.youtube_cron.clone(),
                serde_json::to_value(PullPayload {
                    source: SourceFamily::Youtube,
                })?,
            ));
        }

        Ok(Self {
            store,
            orchestrator,
            transcription,
            quota,
            heartbeat,
            youtube_enabled,
            schedules,
            bootstrap: sched.bootstrap,
            cancel,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn transcription(&self) -> &Arc<TranscriptionQueue> {
        &self.transcription
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn youtube_enabled(&self) -> bool {
        self.youtube_enabled
    }

    /// Register the startup schedules and send the bootstrap pulls
    pub fn register_schedules(&self) -> Result<(), ServiceError> {
        for (queue, cron, payload) in &self.schedules {
            self.orchestrator.schedule(*queue, cron, payload, None)?;
        }

        if self.bootstrap {
            for family in SourceFamily::all() {
                if family == SourceFamily::Youtube && !self.youtube_enabled {
                    continue;
                }
                self.trigger_pull(family)?;
            }
        }
        Ok(())
    }

    /// Spawn every background loop
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.orchestrator.start(self.cancel.clone());
        handles.extend(self.transcription.start());
        info!(loops = handles.len(), youtube = self.youtube_enabled, "Services started");
        handles
    }

    /// Stop every loop started by `start`
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn trigger_pull(&self, family: SourceFamily) -> Result<String, ServiceError> {
        if family == SourceFamily::Youtube && !self.youtube_enabled {
            return Err(ServiceError::InvalidInput(
                "YouTube ingestion is not configured (set YOUTUBE_API_KEY)".to_string(),
            ));
        }
        let job_id = self
            .orchestrator
            .send(QueueName::IngestPull, &PullPayload { source: family })?;
        info!(source = %family, job_id = %job_id, "Pull triggered");
        Ok(job_id)
    }

    /// (Re)register a cron schedule
    pub fn register_schedule(
        &self,
        queue: &str,
        cron: &str,
        timezone: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<(), ServiceError> {
        let queue: QueueName = queue
            .parse()
            .map_err(|e: anyhow::Error| ServiceError::InvalidInput(e.to_string()))?;

        let payload = match (queue, payload) {
            (QueueName::IngestPull, Some(payload)) => {
                serde_json::from_value::<PullPayload>(payload.clone()).map_err(|e| {
                    ServiceError::InvalidInput(format!("invalid pull payload: {}", e))
                })?;
                payload
            }
            (_, Some(payload)) => payload,
            (QueueName::Heartbeat, None) => serde_json::to_value(HeartbeatPayload::default())
                .map_err(|e| ServiceError::InvalidInput(e.to_string()))?,
            (other, None) => {
                return Err(ServiceError::InvalidInput(format!(
                    "queue {} needs a payload",
                    other
                )))
            }
        };

        self.orchestrator.schedule(queue, cron, &payload, timezone)?;
        Ok(())
    }

    /// Submit a one-off URL under the manual source
    pub fn submit_url(&self, raw_url: &str, title: Option<&str>) -> Result<SubmitOutcome, ServiceError> {
        let invalid = |e: url::ParseError| ServiceError::InvalidInput(format!("invalid url {:?}: {}", raw_url, e));
        let canonical = canonicalize_url(raw_url).map_err(invalid)?;
        if !canonical.starts_with("http://") && !canonical.starts_with("https://") {
            return Err(ServiceError::InvalidInput(format!(
                "only http(s) urls can be submitted, got {:?}",
                raw_url
            )));
        }

        let (kind, external_id, video_id) = match classify_url(raw_url).map_err(invalid)? {
            UrlKind::Video { video_id } => (ItemKind::Video, video_id.clone(), Some(video_id)),
            UrlKind::Article => (ItemKind::Article, canonical.clone(), None),
        };

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(canonical.as_str())
            .to_string();
        let item = NewRawItem::new(MANUAL_SOURCE_ID, &external_id, &canonical, title, kind);

        let dispatcher = self.orchestrator.dispatcher();
        let (queue, sent) = match video_id {
            Some(video_id) => {
                if !self.youtube_enabled {
                    warn!(video_id = %video_id, "Video submitted while YouTube listing is disabled");
                }
                let queue = QueueName::FetchYoutubeContent;
                let sent = dispatcher.send_for_new_item(&item, queue, |raw_item_id| FetchYoutubePayload {
                    raw_item_ids: vec![raw_item_id.to_string()],
                    video_id,
                    source_kind: "manual".to_string(),
                })?;
                (queue, sent)
            }
            None => {
                let queue = QueueName::FetchContent;
                let sent = dispatcher.send_for_new_item(&item, queue, |raw_item_id| FetchContentPayload {
                    raw_item_ids: vec![raw_item_id.to_string()],
                })?;
                (queue, sent)
            }
        };

        let Some((raw_item_id, job_id)) = sent else {
            let existing = self
                .store
                .find_raw_item(MANUAL_SOURCE_ID, &external_id)?
                .ok_or_else(|| ServiceError::NotFound(format!("raw item {}", external_id)))?;
            return Ok(SubmitOutcome {
                raw_item_id: existing.id,
                kind,
                canonical_url: canonical,
                duplicate: true,
                queue: None,
                job_id: None,
            });
        };

        info!(raw_item_id = %raw_item_id, queue = %queue, url = %canonical, "URL submitted");
        Ok(SubmitOutcome {
            raw_item_id,
            kind,
            canonical_url: canonical,
            duplicate: false,
            queue: Some(queue),
            job_id: Some(job_id),
        })
    }

    /// Pause or resume a source
    pub fn set_source_active(&self, id: &str, active: bool) -> Result<(), ServiceError> {
        if !self.store.set_source_active(id, active)? {
            return Err(ServiceError::NotFound(format!("unknown source {}", id)));
        }
        info!(source_id = id, active, "Source updated");
        Ok(())
    }

    pub fn quota_status(&self) -> QuotaStatus {
        let status = self.quota.check_quota_status();
        if let Err(e) = self.store.save_quota_snapshot(self.quota.provider(), &status) {
            warn!(error = %e, "Failed to save quota snapshot");
        }
        status
    }

    pub fn status(&self) -> Result<StatusSnapshot, ServiceError> {
        let (total, active) = self.store.count_sources()?;
        let (contents, stories) = self.store.count_contents_and_stories()?;
        Ok(StatusSnapshot {
            sources: SourceCounts { total, active },
            raw_items: self.store.count_raw_items_by_status()?,
            contents,
            stories,
            jobs: self.orchestrator.jobs().counts_by_queue_state()?,
            transcription: self.transcription.get_stats(),
            quota: self.quota.check_quota_status(),
            youtube_enabled: self.youtube_enabled,
            last_heartbeat: self.heartbeat.last_beat(),
        })
    }
}

/// Reload today's persisted spend and drop what no window can use
fn restore_quota(store: &Store, quota: &QuotaTracker) {
    let now = Utc::now();
    match store.load_quota_usage(quota.provider(), quota.window_start(now)) {
        Ok(entries) => {
            let units: u32 = entries.iter().map(|e| e.units).sum();
            if !entries.is_empty() {
                info!(provider = quota.provider(), entries = entries.len(), units, "Quota usage restored");
            }
            quota.restore(entries);
        }
        Err(e) => warn!(error = %e, "Failed to restore quota usage"),
    }

    if let Err(e) = store.purge_quota_usage(
        quota.provider(),
        now - chrono::Duration::days(QUOTA_RETENTION_DAYS),
    ) {
        warn!(error = %e, "Failed to purge old quota usage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ExtractedContent, FeedEntry};
    use crate::domain::{Content, Story, UsageEntry};
    use crate::ingest::{TranscribeOptions, Transcript};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    struct Nothing;

    #[async_trait]
    impl FeedFetcher for Nothing {
        async fn fetch(&self, _url: &str) -> anyhow::Result<Vec<FeedEntry>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl ContentExtractor for Nothing {
        async fn extract(&self, _url: &str) -> anyhow::Result<ExtractedContent> {
            anyhow::bail!("offline")
        }
    }

    #[async_trait]
    impl AudioDownloader for Nothing {
        async fn download(&self, _video_id: &str, _dest: &Path) -> anyhow::Result<PathBuf> {
            anyhow::bail!("offline")
        }
    }

    #[async_trait]
    impl Transcriber for Nothing {
        async fn transcribe(&self, _audio: &Path, _o: &TranscribeOptions) -> anyhow::Result<Transcript> {
            anyhow::bail!("offline")
        }
    }

    #[async_trait]
    impl StoryAnalyzer for Nothing {
        async fn analyze(&self, _s: &Story, _c: &Content) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    fn offline() -> Collaborators {
        Collaborators {
            feeds: Arc::new(Nothing),
            extractor: Arc::new(Nothing),
            youtube: None,
            downloader: Arc::new(Nothing),
            transcriber: Arc::new(Nothing),
            analyzer: Arc::new(Nothing),
        }
    }

    fn test_config() -> ResolvedConfig {
        let dir = std::env::temp_dir().join("storyloom-services-test");
        ResolvedConfig {
            home: dir.clone(),
            database: dir.join("unused.db"),
            work_dir: dir.join("work"),
            config_file: None,
            scheduler: Default::default(),
            quota: Default::default(),
            youtube: Default::default(),
            transcription: Default::default(),
            server: Default::default(),
            analyzer: Default::default(),
        }
    }

    #[test]
    fn test_startup_schedules_and_bootstrap_skip_disabled_youtube() {
        let services = Services::build(&test_config(), Store::open_in_memory().unwrap(), offline()).unwrap();
        services.register_schedules().unwrap();

        let schedules = services.orchestrator().jobs().schedules().unwrap();
        let queues: Vec<_> = schedules.iter().map(|s| s.queue).collect();
        assert!(queues.contains(&QueueName::Heartbeat));
        assert!(queues.contains(&QueueName::IngestPull));

        let counts = services.orchestrator().jobs().counts_by_queue_state().unwrap();
        assert_eq!(counts["ingest:pull"]["created"], 1);

        assert!(matches!(
            services.trigger_pull(SourceFamily::Youtube),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_submit_routes_and_detects_duplicates() {
        let services = Services::build(&test_config(), Store::open_in_memory().unwrap(), offline()).unwrap();

        let video = services
            .submit_url("https://youtu.be/dQw4w9WgXcQ?t=42", None)
            .unwrap();
        assert_eq!(video.kind, ItemKind::Video);
        assert_eq!(video.queue, Some(QueueName::FetchYoutubeContent));

        let article = services
            .submit_url("https://example.com/post/?utm_source=x", Some("A post"))
            .unwrap();
        assert_eq!(article.queue, Some(QueueName::FetchContent));
        assert_eq!(article.canonical_url, "https://example.com/post");

        let again = services.submit_url("https://example.com/post", None).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.raw_item_id, article.raw_item_id);

        assert!(matches!(
            services.submit_url("not a url", None),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            services.submit_url("ftp://example.com/file", None),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_schedule_and_source_errors() {
        let services = Services::build(&test_config(), Store::open_in_memory().unwrap(), offline()).unwrap();

        assert!(matches!(
            services.register_schedule("nope:queue", "* * * * *", None, None),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            services.register_schedule("system:heartbeat", "whenever", None, None),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            services.register_schedule("ingest:pull", "*/5 * * * *", None, None),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            services.register_schedule(
                "ingest:pull",
                "*/5 * * * *",
                None,
                Some(serde_json::json!({"source": "fax"}))
            ),
            Err(ServiceError::InvalidInput(_))
        ));
        services
            .register_schedule("system:heartbeat", "*/2 * * * *", Some("Europe/Paris"), None)
            .unwrap();
        services
            .register_schedule(
                "ingest:pull",
                "*/30 * * * *",
                None,
                Some(serde_json::json!({"source": "rss"})),
            )
            .unwrap();

        assert!(matches!(
            services.set_source_active("missing", false),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_quota_restored_from_store() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_quota_usage(
                YOUTUBE_PROVIDER,
                &UsageEntry {
                    operation: "search.list".to_string(),
                    units: 100,
                    timestamp: Utc::now(),
                    metadata: None,
                },
            )
            .unwrap();

        let services = Services::build(&test_config(), store, offline()).unwrap();
        assert_eq!(services.quota_status().used, 100);
        assert_eq!(services.status().unwrap().quota.used, 100);
    }
}
