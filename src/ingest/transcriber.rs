//! Whisper transcription backend.
//!
//! Shells out to a whisper-compatible binary. The child process is killed
//! when the returned future is dropped, so a caller-side timeout also stops
//! the transcription.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Per-job transcription options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscribeOptions {
    /// Whisper model override (tiny, base, small, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Language override (ISO 639-1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// One timed span of the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub avg_logprob: f64,
}

/// Result of transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub language: String,
    /// Seconds of audio covered
    #[serde(default)]
    pub duration: f64,
}

impl Transcript {
    /// Parse whisper's JSON output. Missing duration is taken from the last segment.
    pub fn from_whisper_json(json: &str, fallback_language: &str) -> Result<Self> {
        let mut transcript: Transcript =
            serde_json::from_str(json).context("Failed to parse whisper JSON")?;

        transcript.text = transcript.text.trim().to_string();
        if transcript.language.is_empty() {
            transcript.language = fallback_language.to_string();
        }
        if transcript.duration <= 0.0 {
            transcript.duration = transcript.segments.last().map(|s| s.end).unwrap_or(0.0);
        }
        Ok(transcript)
    }
}

/// Speech-to-text collaborator
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path, options: &TranscribeOptions) -> Result<Transcript>;
}

/// Local whisper binary
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    binary: PathBuf,
    model: String,
    language: String,
}

impl WhisperTranscriber {
    pub fn new(binary: impl Into<PathBuf>, model: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            language: language.into(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio_path: &Path, options: &TranscribeOptions) -> Result<Transcript> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        let language = options.language.as_deref().unwrap_or(&self.language);

        // Create temp dir for output
        let temp_dir = tempfile::tempdir().context("Failed to create temp dir")?;

        debug!(audio = %audio_path.display(), model, language, "Running whisper");

        let output = Command::new(&self.binary)
            .arg(audio_path)
            .arg("--model")
            .arg(model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json")
            .arg("--language")
            .arg(language)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Whisper failed: {}", stderr.trim());
        }

        let stem = audio_path.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .context("Failed to read whisper output")?;

        Transcript::from_whisper_json(&json_content, language)
    }
}
