use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{AnimecastConfig, EncoderSection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub episode_id: i64,
    /// Path as uploaded; resolved against the source roots at run time.
    pub source: String,
    /// Comma separated quality tokens, e.g. `"1080,720"`.
    pub qualities: String,
    pub language: String,
    pub overwrite: bool,
    pub keep_source: bool,
}

impl TranscodeJob {
    pub fn new(episode_id: i64, source: impl Into<String>) -> Self {
        Self {
            episode_id,
            source: source.into(),
            qualities: "1080".into(),
            language: String::new(),
            overwrite: false,
            keep_source: false,
        }
    }

    pub fn qualities(mut self, qualities: impl Into<String>) -> Self {
        self.qualities = qualities.into();
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into().trim().to_string();
        self
    }

    pub fn overwrite(mut self, value: bool) -> Self {
        self.overwrite = value;
        self
    }

    pub fn keep_source(mut self, value: bool) -> Self {
        self.keep_source = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenditionOutcome {
    pub token: String,
    pub label: String,
    pub media_id: i64,
    pub path: String,
    pub size: Option<u64>,
    pub is_primary: bool,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscodeReport {
    pub episode_id: i64,
    pub anime_id: i64,
    pub source_width: u32,
    pub source_height: u32,
    pub duration_micros: Option<u64>,
    pub renditions: Vec<RenditionOutcome>,
    pub skipped: Vec<String>,
    pub source_removed: bool,
}

impl TranscodeReport {
    pub fn primary(&self) -> Option<&RenditionOutcome> {
        self.renditions.iter().find(|rendition| rendition.is_primary)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub ffmpeg: String,
    pub encoder: EncoderSection,
    pub poll_interval: Duration,
    pub progress_epsilon: f64,
    pub progress_write_interval: Duration,
    pub stderr_tail_bytes: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            encoder: EncoderSection::default(),
            poll_interval: Duration::from_millis(200),
            progress_epsilon: 0.2,
            progress_write_interval: Duration::from_secs(1),
            stderr_tail_bytes: 4000,
        }
    }
}

impl From<&AnimecastConfig> for OrchestratorSettings {
    fn from(config: &AnimecastConfig) -> Self {
        Self {
            ffmpeg: config.tools.ffmpeg.clone(),
            encoder: config.encoder.clone(),
            poll_interval: config.transcode.poll_interval(),
            progress_epsilon: config.transcode.progress_epsilon,
            progress_write_interval: config.transcode.progress_write_interval(),
            stderr_tail_bytes: config.transcode.stderr_tail_bytes,
        }
    }
}
