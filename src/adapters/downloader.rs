//! Audio download via yt-dlp.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::AudioDownloader;

/// Runs `yt-dlp -x` and returns the extracted audio file
pub struct YtDlpDownloader {
    binary: PathBuf,
    audio_format: String,
}

impl YtDlpDownloader {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            audio_format: "mp3".to_string(),
        }
    }

    pub fn with_audio_format(mut self, format: impl Into<String>) -> Self {
        self.audio_format = format.into();
        self
    }
}

/// Video ids are 11 characters of `[A-Za-z0-9_-]`; anything else would be
/// passed to yt-dlp as an option or a search term.
pub fn is_valid_video_id(video_id: &str) -> bool {
    video_id.len() == 11
        && video_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[async_trait]
impl AudioDownloader for YtDlpDownloader {
    async fn download(&self, video_id: &str, dest_dir: &Path) -> Result<PathBuf> {
        if !is_valid_video_id(video_id) {
            anyhow::bail!("Not a YouTube video id: {:?}", video_id);
        }

        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

        let target = dest_dir.join(format!("{}.{}", video_id, self.audio_format));
        let template = dest_dir.join(format!("{}.%(ext)s", video_id));
        let url = format!("https://www.youtube.com/watch?v={}", video_id);

        debug!(video_id, dest = %dest_dir.display(), "Downloading audio");

        let output = Command::new(&self.binary)
            .arg("-x")
            .arg("--audio-format")
            .arg(&self.audio_format)
            .arg("--no-playlist")
            .arg("--quiet")
            .arg("-o")
            .arg(&template)
            .arg(&url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp failed for {}: {}", video_id, stderr.trim());
        }

        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            anyhow::bail!("yt-dlp produced no audio at {}", target.display());
        }

        Ok(target)
    }
}
