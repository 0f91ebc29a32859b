mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::FailureKind;

pub use store::{
    MemoryStateStore, SqliteStateStore, SqliteStateStoreBuilder, StateError, StateResult,
    StateStore,
};

pub const DEFAULT_STATE_TTL_HOURS: i64 = 6;

pub fn progress_key(episode_id: i64) -> String {
    format!("anime:episode:transcode:{episode_id}:progress")
}

pub fn lock_key(anime_id: i64) -> String {
    format!("anime:transcode:lock:{anime_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStage {
    #[default]
    Idle,
    Probing,
    Transcoding,
    Done,
    Failed,
}

impl TranscodeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeStage::Idle => "idle",
            TranscodeStage::Probing => "probing",
            TranscodeStage::Transcoding => "transcoding",
            TranscodeStage::Done => "done",
            TranscodeStage::Failed => "failed",
        }
    }

    /// Probing and transcoding hold the anime lock; every other stage releases it.
    pub fn is_active(&self) -> bool {
        matches!(self, TranscodeStage::Probing | TranscodeStage::Transcoding)
    }
}

impl std::fmt::Display for TranscodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeProgress {
    pub episode_id: i64,
    pub stage: TranscodeStage,
    pub progress: f64,
    pub quality: Option<String>,
    pub quality_index: u32,
    pub qualities_total: u32,
    pub quality_progress: f64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for TranscodeProgress {
    fn default() -> Self {
        Self::idle(0)
    }
}

impl TranscodeProgress {
    pub fn idle(episode_id: i64) -> Self {
        Self {
            episode_id,
            stage: TranscodeStage::Idle,
            progress: 0.0,
            quality: None,
            quality_index: 0,
            qualities_total: 0,
            quality_progress: 0.0,
            message: None,
            error: None,
            error_kind: None,
            updated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stage.is_active()
    }

    fn apply(&mut self, update: ProgressUpdate) {
        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(quality) = update.quality {
            self.quality = quality;
        }
        if let Some(index) = update.quality_index {
            self.quality_index = index;
        }
        if let Some(total) = update.qualities_total {
            self.qualities_total = total;
        }
        if let Some(quality_progress) = update.quality_progress {
            self.quality_progress = quality_progress;
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(kind) = update.error_kind {
            self.error_kind = kind;
        }
    }
}

/// Partial record. Unset fields keep their stored value; nullable fields take
/// `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub stage: Option<TranscodeStage>,
    pub progress: Option<f64>,
    pub quality: Option<Option<String>>,
    pub quality_index: Option<u32>,
    pub qualities_total: Option<u32>,
    pub quality_progress: Option<f64>,
    pub message: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub error_kind: Option<Option<FailureKind>>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: TranscodeStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn progress(mut self, value: f64) -> Self {
        self.progress = Some(round2(value));
        self
    }

    pub fn quality(mut self, label: Option<&str>) -> Self {
        self.quality = Some(label.map(str::to_string));
        self
    }

    pub fn quality_index(mut self, index: u32) -> Self {
        self.quality_index = Some(index);
        self
    }

    pub fn qualities_total(mut self, total: u32) -> Self {
        self.qualities_total = Some(total);
        self
    }

    pub fn quality_progress(mut self, value: f64) -> Self {
        self.quality_progress = Some(round2(value));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(Some(message.into()));
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn error_kind(mut self, kind: Option<FailureKind>) -> Self {
        self.error_kind = Some(kind);
        self
    }

    /// Clears both the error text and its kind.
    pub fn clear_error(self) -> Self {
        self.error(None).error_kind(None)
    }

    pub fn failed(
        kind: FailureKind,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::new()
            .stage(TranscodeStage::Failed)
            .message(summary)
            .error(Some(detail.into()))
            .error_kind(Some(kind))
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn StateStore>,
    progress_ttl: Duration,
    lock_ttl: Duration,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("progress_ttl", &self.progress_ttl)
            .field("lock_ttl", &self.lock_ttl)
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            progress_ttl: Duration::hours(DEFAULT_STATE_TTL_HOURS),
            lock_ttl: Duration::hours(DEFAULT_STATE_TTL_HOURS),
        }
    }

    pub fn with_ttls(mut self, progress_ttl: Duration, lock_ttl: Duration) -> Self {
        self.progress_ttl = progress_ttl;
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn get_progress(&self, episode_id: i64) -> StateResult<TranscodeProgress> {
        let stored = self.store.get(&progress_key(episode_id))?;
        Ok(stored
            .and_then(|raw| serde_json::from_str::<TranscodeProgress>(&raw).ok())
            .map(|mut record| {
                record.episode_id = episode_id;
                record
            })
            .unwrap_or_else(|| TranscodeProgress::idle(episode_id)))
    }

    pub fn set_progress(
        &self,
        episode_id: i64,
        update: ProgressUpdate,
    ) -> StateResult<TranscodeProgress> {
        let mut record = self.get_progress(episode_id)?;
        record.apply(update);
        self.write(episode_id, record)
    }

    /// Writes `update` over the idle defaults, discarding whatever a previous run left.
    pub fn reset_progress(
        &self,
        episode_id: i64,
        update: ProgressUpdate,
    ) -> StateResult<TranscodeProgress> {
        let mut record = TranscodeProgress::idle(episode_id);
        record.apply(update);
        self.write(episode_id, record)
    }

    fn write(
        &self,
        episode_id: i64,
        mut record: TranscodeProgress,
    ) -> StateResult<TranscodeProgress> {
        record.episode_id = episode_id;
        record.updated_at = Some(Utc::now());
        let encoded = serde_json::to_string(&record)?;
        self.store
            .put(&progress_key(episode_id), &encoded, self.progress_ttl)?;
        debug!(
            episode_id,
            stage = %record.stage,
            progress = record.progress,
            "progress written"
        );
        Ok(record)
    }

    pub fn acquire_lock(&self, anime_id: i64, episode_id: i64) -> StateResult<()> {
        self.store
            .put(&lock_key(anime_id), &episode_id.to_string(), self.lock_ttl)?;
        info!(anime_id, episode_id, "transcode lock acquired");
        Ok(())
    }

    pub fn release_lock(&self, anime_id: i64) -> StateResult<()> {
        self.store.forget(&lock_key(anime_id))?;
        debug!(anime_id, "transcode lock released");
        Ok(())
    }

    /// Episode holding the anime lock, if its run is still active. A lock left
    /// behind by a finished or dead run is cleared and reported as absent.
    pub fn active_episode_for(&self, anime_id: i64) -> StateResult<Option<i64>> {
        let Some(raw) = self.store.get(&lock_key(anime_id))? else {
            return Ok(None);
        };
        let episode_id = match raw.trim().parse::<i64>() {
            Ok(id) if id > 0 => id,
            _ => {
                self.release_lock(anime_id)?;
                return Ok(None);
            }
        };
        if self.get_progress(episode_id)?.is_active() {
            Ok(Some(episode_id))
        } else {
            info!(anime_id, episode_id, "clearing stale transcode lock");
            self.release_lock(anime_id)?;
            Ok(None)
        }
    }
}
