mod command;
mod error;
mod parser;
mod types;

use std::path::Path;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AnimecastConfig;
use crate::media::{Episode, RenditionRecord, SqliteMediaStore};
use crate::probe::MediaProber;
use crate::process::{ProcessRunner, StreamingProcess};
use crate::progress::{ProgressTracker, ProgressUpdate, TranscodeStage};
use crate::rendition::{QualityPreset, RenditionPlanner};
use crate::storage::{BlobStore, LocalDiskStore, SourceLocator};

pub use command::{output_directory, rendition_file_name, EncoderCommand};
pub use error::{TranscodeError, TranscodeResult};
pub use parser::{
    disambiguate_elapsed_millis, overall_progress, parse_clock_to_micros, parse_progress_line,
    DurationEstimate, LineBuffer, ProgressThrottle, TailBuffer, MILLIS_HEURISTIC_FACTOR,
    RUNNING_PROGRESS_CAP,
};
pub use types::{OrchestratorSettings, RenditionOutcome, TranscodeJob, TranscodeReport};

pub const PREPARING_MESSAGE: &str = "Preparing source...";
pub const FINISHED_MESSAGE: &str = "Transcoding finished and media records were updated.";

/// Runs one episode through probe, plan and per-rendition encode, keeping the
/// shared progress record current. Owns the anime lock for the whole run.
#[derive(Clone)]
pub struct TranscodeOrchestrator {
    media: SqliteMediaStore,
    tracker: ProgressTracker,
    runner: Arc<dyn ProcessRunner>,
    prober: MediaProber,
    planner: RenditionPlanner,
    public_store: Arc<dyn BlobStore>,
    locator: SourceLocator,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for TranscodeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeOrchestrator")
            .field("media", &self.media)
            .field("public_root", &self.public_store.root())
            .field("locator", &self.locator)
            .finish()
    }
}

/// Per-rendition inputs that stay fixed for one encode.
struct RenditionContext<'a> {
    episode: &'a Episode,
    job: &'a TranscodeJob,
    preset: &'a QualityPreset,
    index: usize,
    total: usize,
    output_dir: &'a str,
    source: &'a Path,
    probed_duration: Option<u64>,
}

impl RenditionContext<'_> {
    fn position(&self) -> u32 {
        self.index as u32 + 1
    }

    fn total(&self) -> u32 {
        self.total as u32
    }

    fn running_update(&self) -> ProgressUpdate {
        ProgressUpdate::new()
            .stage(TranscodeStage::Transcoding)
            .quality(Some(self.preset.label.as_str()))
            .quality_index(self.position())
            .qualities_total(self.total())
            .message(format!("Transcoding {}...", self.preset.label))
    }
}

struct LockRelease {
    tracker: ProgressTracker,
    anime_id: i64,
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        if let Err(err) = self.tracker.release_lock(self.anime_id) {
            warn!(anime_id = self.anime_id, error = %err, "failed to release transcode lock");
        }
    }
}

impl TranscodeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media: SqliteMediaStore,
        tracker: ProgressTracker,
        runner: Arc<dyn ProcessRunner>,
        prober: MediaProber,
        planner: RenditionPlanner,
        public_store: Arc<dyn BlobStore>,
        locator: SourceLocator,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            media,
            tracker,
            runner,
            prober,
            planner,
            public_store,
            locator,
            settings,
        }
    }

    pub fn from_config(
        config: &AnimecastConfig,
        media: SqliteMediaStore,
        tracker: ProgressTracker,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let prober = MediaProber::new(
            Arc::clone(&runner),
            config.tools.ffprobe.clone(),
            config.tools.probe_timeout(),
        );
        let public_store = LocalDiskStore::new(config.public_root())
            .with_public_base_url(config.storage.public_base_url.clone());
        let locator = SourceLocator::new(&config.paths.base_dir, config.source_roots());
        Self::new(
            media,
            tracker,
            runner,
            prober,
            RenditionPlanner::new(config.presets.clone()),
            Arc::new(public_store),
            locator,
            OrchestratorSettings::from(config),
        )
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub async fn run(&self, job: &TranscodeJob) -> TranscodeResult<TranscodeReport> {
        let episode_id = job.episode_id;
        info!(episode_id, source = %job.source, qualities = %job.qualities, "transcode started");
        self.tracker.set_progress(
            episode_id,
            ProgressUpdate::new()
                .stage(TranscodeStage::Probing)
                .message(PREPARING_MESSAGE)
                .progress(0.0)
                .quality_progress(0.0)
                .clear_error(),
        )?;

        let episode = match self.media.fetch_episode(episode_id) {
            Ok(Some(episode)) => episode,
            Ok(None) => {
                let err = TranscodeError::EpisodeNotFound(episode_id);
                return Err(self.record_failure(episode_id, err));
            }
            Err(err) => return Err(self.record_failure(episode_id, err.into())),
        };

        let _lock = LockRelease {
            tracker: self.tracker.clone(),
            anime_id: episode.anime_id,
        };
        match self.transcode_episode(&episode, job).await {
            Ok(report) => {
                info!(
                    episode_id,
                    anime_id = episode.anime_id,
                    renditions = report.renditions.len(),
                    source_removed = report.source_removed,
                    "transcode finished"
                );
                Ok(report)
            }
            Err(err) => Err(self.record_failure(episode_id, err)),
        }
    }

    fn record_failure(&self, episode_id: i64, err: TranscodeError) -> TranscodeError {
        let kind = err.kind();
        let detail = err.detail();
        error!(episode_id, kind = %kind, error = %detail, "transcode failed");
        let update = ProgressUpdate::failed(kind, err.summary(), detail);
        if let Err(write_err) = self.tracker.set_progress(episode_id, update) {
            warn!(episode_id, error = %write_err, "failed to record transcode failure");
        }
        err
    }

    async fn transcode_episode(
        &self,
        episode: &Episode,
        job: &TranscodeJob,
    ) -> TranscodeResult<TranscodeReport> {
        let source = self
            .locator
            .locate(&job.source)
            .ok_or_else(|| TranscodeError::SourceNotFound(job.source.clone()))?;
        self.planner.parse_request(&job.qualities)?;

        let resolution = self.prober.probe_resolution(&source.path).await?;
        let probed_duration = self.prober.probe_duration(&source.path).await;
        let plan = self
            .planner
            .plan(&job.qualities, resolution.width, resolution.height)?;
        if !plan.skipped.is_empty() {
            warn!(
                episode_id = episode.id,
                source_height = resolution.height,
                skipped = %plan.skipped.join(", "),
                "skipped qualities above source height"
            );
        }

        let output_dir = output_directory(
            episode.anime_id,
            episode.season_number,
            episode.episode_number,
        );
        self.public_store.make_directory(&output_dir)?;
        self.media.clear_primary_video(episode.id)?;

        let mut estimate = DurationEstimate::new(probed_duration);
        let mut renditions = Vec::with_capacity(plan.eligible.len());
        for (index, preset) in plan.eligible.iter().enumerate() {
            let context = RenditionContext {
                episode,
                job,
                preset,
                index,
                total: plan.eligible.len(),
                output_dir: &output_dir,
                source: &source.path,
                probed_duration,
            };
            renditions.push(self.encode_rendition(&context, &mut estimate).await?);
        }

        self.tracker.set_progress(
            episode.id,
            ProgressUpdate::new()
                .stage(TranscodeStage::Done)
                .quality_progress(100.0)
                .progress(100.0)
                .message(FINISHED_MESSAGE)
                .clear_error(),
        )?;

        let source_removed = !job.keep_source && self.locator.remove_source(&source);
        Ok(TranscodeReport {
            episode_id: episode.id,
            anime_id: episode.anime_id,
            source_width: resolution.width,
            source_height: resolution.height,
            duration_micros: probed_duration,
            renditions,
            skipped: plan.skipped,
            source_removed,
        })
    }

    async fn encode_rendition(
        &self,
        context: &RenditionContext<'_>,
        estimate: &mut DurationEstimate,
    ) -> TranscodeResult<RenditionOutcome> {
        let preset = context.preset;
        let episode_id = context.episode.id;
        self.tracker.set_progress(
            episode_id,
            context
                .running_update()
                .quality_progress(0.0)
                .progress(context.index as f64 / context.total.max(1) as f64 * 100.0)
                .clear_error(),
        )?;

        let relative = format!(
            "{}/{}",
            context.output_dir,
            rendition_file_name(&context.job.language, &preset.label)
        );
        let output = self.public_store.path_for_reading(&relative)?;
        let argv = EncoderCommand {
            ffmpeg: &self.settings.ffmpeg,
            encoder: &self.settings.encoder,
            preset,
            source: context.source,
            output: &output,
            overwrite: context.job.overwrite,
        }
        .argv();
        info!(
            episode_id,
            quality = %preset.label,
            index = context.position(),
            total = context.total(),
            path = %relative,
            "encoding rendition"
        );

        let mut process = self
            .runner
            .start(&argv)
            .map_err(|source| TranscodeError::EncoderLaunch {
                quality: preset.label.clone(),
                source,
            })?;
        let (exit_code, tail) = self.supervise(context, process.as_mut(), estimate).await?;
        if exit_code != 0 {
            let detail = if tail.is_empty() {
                format!("FFmpeg failed for {}.", preset.label)
            } else {
                tail.text()
            };
            return Err(TranscodeError::Encode {
                quality: preset.label.clone(),
                detail,
            });
        }

        self.tracker.set_progress(
            episode_id,
            ProgressUpdate::new()
                .stage(TranscodeStage::Transcoding)
                .quality(Some(preset.label.as_str()))
                .quality_index(context.position())
                .qualities_total(context.total())
                .quality_progress(100.0)
                .progress(context.position() as f64 / context.total.max(1) as f64 * 100.0)
                .message(format!("Completed {}.", preset.label)),
        )?;

        let size = self.public_store.size(&relative).ok();
        let is_primary = context.index == 0;
        let mut record = RenditionRecord::video(episode_id, &preset.label, &relative)
            .language(Some(context.job.language.as_str()));
        record.size = size;
        record.duration = context
            .probed_duration
            .map(|micros| (micros as f64 / 1_000_000.0).round() as u64);
        record.is_primary = is_primary;
        let media = self.media.upsert_rendition(&record)?;

        Ok(RenditionOutcome {
            token: preset.token.clone(),
            label: preset.label.clone(),
            media_id: media.id,
            public_url: self.public_store.public_url(&relative),
            path: relative,
            size,
            is_primary,
        })
    }

    /// Polls the encoder until it exits, writing throttled progress. Returns
    /// the exit code and the stderr tail.
    async fn supervise(
        &self,
        context: &RenditionContext<'_>,
        process: &mut dyn StreamingProcess,
        estimate: &mut DurationEstimate,
    ) -> TranscodeResult<(i32, TailBuffer)> {
        let mut lines = LineBuffer::new();
        let mut tail = TailBuffer::new(self.settings.stderr_tail_bytes);
        let mut throttle = ProgressThrottle::new(
            self.settings.progress_epsilon,
            self.settings.progress_write_interval,
        );
        loop {
            let running = process.is_running()?;
            for line in lines.push(&process.poll_stdout_chunk()) {
                self.observe_line(context, &line, estimate, &mut throttle)?;
            }
            tail.push(&process.poll_stderr_chunk());
            if !running {
                break;
            }
            sleep(self.settings.poll_interval).await;
        }
        // Output still in flight when the exit was seen is buffered once wait returns.
        let exit_code = process.wait().await?;
        for line in lines.push(&process.poll_stdout_chunk()) {
            self.observe_line(context, &line, estimate, &mut throttle)?;
        }
        tail.push(&process.poll_stderr_chunk());
        if let Some(line) = lines.finish() {
            self.observe_line(context, &line, estimate, &mut throttle)?;
        }
        Ok((exit_code, tail))
    }

    fn observe_line(
        &self,
        context: &RenditionContext<'_>,
        line: &str,
        estimate: &mut DurationEstimate,
        throttle: &mut ProgressThrottle,
    ) -> TranscodeResult<()> {
        let Some(elapsed) = parse_progress_line(line, estimate.total_micros()) else {
            return Ok(());
        };
        estimate.observe(elapsed);
        let Some(quality_progress) = estimate.quality_progress(elapsed) else {
            return Ok(());
        };
        let overall = overall_progress(context.index, context.total, quality_progress);
        if throttle.should_write(overall) {
            self.tracker.set_progress(
                context.episode.id,
                context
                    .running_update()
                    .quality_progress(quality_progress)
                    .progress(overall),
            )?;
        }
        Ok(())
    }
}
