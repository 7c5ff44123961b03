//! Command-line interface for storyloom.
//!
//! Runs the scheduler and ops server, triggers pulls, manages sources and
//! inspects queue, quota and transcription state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use url::Url;

use crate::config::{self, ResolvedConfig};
use crate::core::services::{Collaborators, Services};
use crate::domain::{QueueName, Source, SourceFamily, SourceKind};
use crate::ingest::{Priority, TranscribeOptions, TranscriptionQueue, WhisperTranscriber};
use crate::server;
use crate::store::Store;

/// storyloom - scheduled content ingestion and processing
#[derive(Parser, Debug)]
#[command(name = "storyloom")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler, workers and ops HTTP server
    Serve {
        /// Address to bind to (defaults to server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Queue an immediate pull of a source family
    Pull {
        /// rss or youtube
        source: SourceFamily,

        /// Run the pull in this process instead of leaving it to `serve`
        #[arg(long)]
        now: bool,
    },

    /// Show source, item, job, transcription and quota counts
    Status,

    /// Manage ingestion sources
    Sources {
        #[command(subcommand)]
        command: SourceCommands,
    },

    /// Submit a one-off URL (video or article)
    Submit {
        url: String,

        /// Title to use until the content is fetched
        #[arg(long)]
        title: Option<String>,
    },

    /// Register or replace a cron schedule
    Schedule {
        /// Queue name, e.g. system:heartbeat or ingest:pull
        queue: String,

        /// Cron expression (5 or 6 fields)
        cron: String,

        /// IANA timezone (defaults to scheduler.timezone)
        #[arg(long)]
        tz: Option<String>,

        /// JSON payload, e.g. '{"source":"rss"}'
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show YouTube quota usage for the current window
    Quota,

    /// Transcribe a local audio file through the transcription queue
    Transcribe {
        audio: PathBuf,

        /// high, medium or low
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// Whisper model override
        #[arg(long)]
        model: Option<String>,

        /// Language override (ISO 639-1)
        #[arg(long)]
        language: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum SourceCommands {
    /// Register a source
    Add {
        #[command(subcommand)]
        kind: AddSource,
    },

    /// List registered sources
    List,

    /// Stop pulling a source
    Pause { id: String },

    /// Resume pulling a source
    Resume { id: String },
}

#[derive(Subcommand, Debug)]
pub enum AddSource {
    /// RSS or Atom feed
    Rss {
        url: String,
        #[arg(long)]
        name: Option<String>,
    },

    /// Podcast feed
    Podcast {
        url: String,
        #[arg(long)]
        name: Option<String>,
    },

    /// Uploads of a YouTube channel
    Channel {
        /// Channel id (UC...)
        channel_id: String,
        #[arg(long)]
        name: Option<String>,
    },

    /// YouTube keyword search
    Search {
        query: String,

        /// date, relevance, viewCount, rating
        #[arg(long)]
        order: Option<String>,

        /// any, short, medium, long
        #[arg(long)]
        duration: Option<String>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { bind } => serve(bind).await,
            Commands::Pull { source, now } => pull(source, now).await,
            Commands::Status => show_status(),
            Commands::Sources { command } => match command {
                SourceCommands::Add { kind } => add_source(kind),
                SourceCommands::List => list_sources(),
                SourceCommands::Pause { id } => set_active(&id, false),
                SourceCommands::Resume { id } => set_active(&id, true),
            },
            Commands::Submit { url, title } => submit(&url, title.as_deref()),
            Commands::Schedule {
                queue,
                cron,
                tz,
                payload,
            } => schedule(&queue, &cron, tz.as_deref(), payload.as_deref()),
            Commands::Quota => show_quota(),
            Commands::Transcribe {
                audio,
                priority,
                model,
                language,
            } => transcribe(audio, priority, TranscribeOptions { model, language }).await,
            Commands::Config => show_config(),
        }
    }
}

/// Open the store and wire the services from the resolved config
fn open_services(cfg: &ResolvedConfig) -> Result<Services> {
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create {}", cfg.home.display()))?;
    let store = Store::open(&cfg.database)
        .with_context(|| format!("Failed to open database {}", cfg.database.display()))?;
    Services::build(cfg, store, Collaborators::from_config(cfg)?)
}

async fn serve(bind: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let services = Arc::new(open_services(cfg)?);

    services.register_schedules()?;
    let handles = services.start();

    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let served = server::serve(services.clone(), &bind, shutdown_signal()).await;

    services.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Shut down");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn pull(source: SourceFamily, now: bool) -> Result<()> {
    let cfg = config::config()?;
    let services = open_services(cfg)?;
    let job_id = services.trigger_pull(source)?;
    println!("Queued {} pull: {}", source, job_id);

    if now {
        let processed = services.orchestrator().run_once(QueueName::IngestPull).await?;
        println!("Processed {} pull job(s)", processed);
        if let Some(job) = services.orchestrator().jobs().get(&job_id)? {
            println!("Job state: {}", job.state.as_str());
            if let Some(error) = job.output.as_ref().and_then(|o| o.get("error")) {
                println!("Error: {}", error);
            }
        }
    }
    Ok(())
}

fn show_status() -> Result<()> {
    let services = open_services(config::config()?)?;
    let status = services.status()?;

    println!("Sources:  {} total, {} active", status.sources.total, status.sources.active);
    println!("Contents: {}", status.contents);
    println!("Stories:  {}", status.stories);

    println!();
    println!("Raw items:");
    let mut raw: Vec<_> = status.raw_items.iter().collect();
    raw.sort();
    for (state, count) in raw {
        println!("  {:<10} {}", state, count);
    }

    println!();
    println!("{:<32} {:<10} {:>6}", "QUEUE", "STATE", "COUNT");
    println!("{}", "-".repeat(50));
    for (queue, states) in &status.jobs {
        for (state, count) in states {
            println!("{:<32} {:<10} {:>6}", queue, state, count);
        }
    }

    let t = &status.transcription;
    println!();
    println!(
        "Transcription: {} pending, {} processing, {} retrying, {} completed, {} failed",
        t.pending, t.processing, t.retrying, t.completed, t.failed
    );
    println!(
        "Quota: {}/{} used, resets {}",
        status.quota.used, status.quota.limit, status.quota.reset_at
    );
    match status.last_heartbeat {
        Some(at) => println!("Last heartbeat: {}", at),
        None => println!("Last heartbeat: (none in this process)"),
    }
    Ok(())
}

fn add_source(kind: AddSource) -> Result<()> {
    let source = match kind {
        AddSource::Rss { url, name } => {
            Url::parse(&url).with_context(|| format!("Invalid feed URL: {}", url))?;
            Source::new(name.unwrap_or_else(|| url.clone()), SourceKind::Rss, url)
        }
        AddSource::Podcast { url, name } => {
            Url::parse(&url).with_context(|| format!("Invalid feed URL: {}", url))?;
            Source::new(name.unwrap_or_else(|| url.clone()), SourceKind::Podcast, url)
        }
        AddSource::Channel { channel_id, name } => {
            let url = format!("https://www.youtube.com/channel/{}", channel_id);
            Source::new(
                name.unwrap_or_else(|| channel_id.clone()),
                SourceKind::YoutubeChannel {
                    channel_id,
                    uploads_playlist_id: None,
                },
                url,
            )
        }
        AddSource::Search {
            query,
            order,
            duration,
        } => {
            let url = Url::parse_with_params(
                "https://www.youtube.com/results",
                &[("search_query", query.as_str())],
            )?;
            Source::new(
                format!("search: {}", query),
                SourceKind::YoutubeSearch {
                    query,
                    order,
                    duration,
                    published_after: None,
                },
                url.as_str(),
            )
        }
    };

    let store = Store::open(&config::config()?.database)?;
    store.insert_source(&source)?;
    println!("Added {} source {}", source.kind.as_str(), source.id);
    Ok(())
}

fn list_sources() -> Result<()> {
    let store = Store::open(&config::config()?.database)?;
    let sources = store.list_sources()?;

    if sources.is_empty() {
        println!("No sources registered");
        return Ok(());
    }

    println!("{:<38} {:<16} {:<7} {:<20} NAME", "ID", "KIND", "ACTIVE", "LAST CHECKED");
    println!("{}", "-".repeat(100));
    for s in sources {
        let checked = s
            .last_checked
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<16} {:<7} {:<20} {}",
            s.id,
            s.kind.as_str(),
            if s.active { "yes" } else { "no" },
            checked,
            s.name
        );
    }
    Ok(())
}

fn set_active(id: &str, active: bool) -> Result<()> {
    let services = open_services(config::config()?)?;
    services.set_source_active(id, active)?;
    println!("Source {} {}", id, if active { "resumed" } else { "paused" });
    Ok(())
}

fn submit(url: &str, title: Option<&str>) -> Result<()> {
    let services = open_services(config::config()?)?;
    let outcome = services.submit_url(url, title)?;

    if outcome.duplicate {
        println!("Already known as raw item {}", outcome.raw_item_id);
        return Ok(());
    }
    println!(
        "Submitted {} as {} ({})",
        outcome.canonical_url,
        outcome.kind.as_str(),
        outcome.raw_item_id
    );
    if let (Some(queue), Some(job_id)) = (outcome.queue, outcome.job_id) {
        println!("Queued {} job {}", queue, job_id);
    }
    Ok(())
}

fn schedule(queue: &str, cron: &str, tz: Option<&str>, payload: Option<&str>) -> Result<()> {
    let payload = payload
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("Payload must be valid JSON")?;

    let services = open_services(config::config()?)?;
    services.register_schedule(queue, cron, tz, payload)?;
    println!("Scheduled {} at '{}'", queue, cron);
    Ok(())
}

fn show_quota() -> Result<()> {
    let services = open_services(config::config()?)?;
    let status = services.quota_status();

    println!("Provider:  {}", services.quota().provider());
    println!("Used:      {}", status.used);
    println!("Remaining: {}", status.remaining);
    println!("Limit:     {}", status.limit);
    println!("Resets at: {}", status.reset_at);
    println!("Can proceed: {}", status.can_proceed);
    Ok(())
}

async fn transcribe(audio: PathBuf, priority: Priority, options: TranscribeOptions) -> Result<()> {
    if !audio.is_file() {
        anyhow::bail!("Audio file not found: {}", audio.display());
    }

    let cfg = config::config()?;
    let t = &cfg.transcription;
    let queue = Arc::new(TranscriptionQueue::new(
        Arc::new(WhisperTranscriber::new(&t.binary, &t.model, &t.language)),
        t.queue_config(),
    ));
    let handles = queue.start();

    let label = audio
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());
    let id = queue.add_job(label, &audio, options, priority, None);
    let job = queue.wait_for_job(&id, t.wait_timeout()).await;

    queue.shutdown();
    for handle in handles {
        let _ = handle.await;
    }

    let job = job.context("Timed out waiting for transcription")?;
    match job.result {
        Some(transcript) => {
            println!("{}", transcript.text);
            eprintln!(
                "\n[{} segments, language {}, {} retries]",
                transcript.segments.len(),
                transcript.language,
                job.retry_count
            );
            Ok(())
        }
        None => anyhow::bail!(
            "Transcription failed after {} retries: {}",
            job.retry_count,
            job.error.unwrap_or_default()
        ),
    }
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    print!("{}", serde_yaml::to_string(cfg)?);
    println!();
    println!(
        "YouTube API key: {}",
        if cfg.youtube.api_key.is_some() { "set" } else { "not set" }
    );
    Ok(())
}
