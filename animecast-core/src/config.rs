use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::rendition::QualityPreset;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AnimecastConfig {
    pub paths: PathsSection,
    pub storage: StorageSection,
    pub tools: ToolsSection,
    pub transcode: TranscodeSection,
    pub state: StateSection,
    pub encoder: EncoderSection,
    #[serde(default = "QualityPreset::standard_ladder")]
    pub presets: Vec<QualityPreset>,
}

impl AnimecastConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn media_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.media_db)
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.state_db)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
    }

    pub fn public_root(&self) -> PathBuf {
        self.resolve_path(&self.storage.public_root)
    }

    pub fn source_roots(&self) -> Vec<PathBuf> {
        self.storage
            .source_roots
            .iter()
            .map(|root| self.resolve_path(root))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub logs_dir: String,
    pub media_db: String,
    pub state_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub public_root: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default)]
    pub source_roots: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub probe_timeout_seconds: u64,
}

impl ToolsSection {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub default_qualities: String,
    pub default_language: String,
    pub poll_interval_ms: u64,
    pub progress_epsilon: f64,
    pub progress_write_interval_ms: u64,
    pub stderr_tail_bytes: usize,
}

impl TranscodeSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_write_interval(&self) -> Duration {
        Duration::from_millis(self.progress_write_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateSection {
    pub progress_ttl_hours: u32,
    pub lock_ttl_hours: u32,
}

impl StateSection {
    pub fn progress_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.progress_ttl_hours))
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.lock_ttl_hours))
    }
}

/// Fixed encoder parameters shared by every rendition.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub video_codec: String,
    pub pixel_format: String,
    pub preset: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_channels: u8,
    pub audio_sample_rate: u32,
    #[serde(default = "default_faststart")]
    pub faststart: bool,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            video_codec: "libx264".into(),
            pixel_format: "yuv420p".into(),
            preset: "medium".into(),
            audio_codec: "aac".into(),
            audio_bitrate: "128k".into(),
            audio_channels: 2,
            audio_sample_rate: 48_000,
            faststart: true,
        }
    }
}

fn default_faststart() -> bool {
    true
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AnimecastConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
