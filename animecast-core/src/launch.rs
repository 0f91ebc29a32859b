use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::FailureKind;
use crate::progress::{
    ProgressTracker, ProgressUpdate, StateError, TranscodeProgress, TranscodeStage,
};
use crate::transcode::{TranscodeJob, TranscodeOrchestrator, TranscodeReport, TranscodeResult};

pub const QUEUED_MESSAGE: &str = "Queued for transcoding...";
pub const LAUNCH_FAILED_MESSAGE: &str = "Failed to start transcoding process.";
pub const EPISODE_BUSY_MESSAGE: &str = "Transcoding is already in progress for this episode.";

pub fn anime_busy_message(active_episode_id: i64) -> String {
    format!(
        "Transcoding is in progress for episode #{active_episode_id}. Please wait until it finishes."
    )
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed to open transcode log {path}: {source}")]
    Log {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("no async runtime available to run the transcode")]
    NoRuntime,
    #[error("progress store error: {0}")]
    State(#[from] StateError),
}

pub type LaunchResult<T> = Result<T, LaunchError>;

/// Starts a transcode run without waiting for it.
pub trait Launcher: Send + Sync {
    fn launch(&self, job: &TranscodeJob) -> LaunchResult<()>;
}

pub type Reaper = thread::JoinHandle<Option<ExitStatus>>;

/// Spawns `animecastctl transcode run` as an independent process whose output
/// is appended to the transcode log. Each child is reaped on its own thread.
#[derive(Debug, Clone)]
pub struct DetachedProcessLauncher {
    program: PathBuf,
    global_args: Vec<String>,
    log_path: PathBuf,
    reapers: Arc<Mutex<Vec<Reaper>>>,
}

impl DetachedProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
            log_path: log_path.into(),
            reapers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Arguments placed before the subcommand, such as `--config <path>`.
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Reaper threads started so far; joining one yields the child's exit status.
    pub fn take_reapers(&self) -> Vec<Reaper> {
        let mut guard = self
            .reapers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *guard)
    }

    fn reap(&self, mut child: std::process::Child, episode_id: i64) {
        let pid = child.id();
        let spawned = thread::Builder::new()
            .name(format!("transcode-reaper-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => {
                    info!(episode_id, pid, %status, "detached transcode process exited");
                    Some(status)
                }
                Err(err) => {
                    warn!(
                        episode_id,
                        pid,
                        error = %err,
                        "failed to wait on detached transcode process"
                    );
                    None
                }
            });
        match spawned {
            Ok(reaper) => {
                let mut guard = self
                    .reapers
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.retain(|earlier| !earlier.is_finished());
                guard.push(reaper);
            }
            Err(err) => warn!(episode_id, pid, error = %err, "failed to start reaper thread"),
        }
    }

    pub fn args(&self, job: &TranscodeJob) -> Vec<String> {
        let mut args = self.global_args.clone();
        args.extend([
            "transcode".to_string(),
            "run".to_string(),
            job.episode_id.to_string(),
            job.source.clone(),
            format!("--qualities={}", job.qualities),
            format!("--language={}", job.language),
        ]);
        if job.overwrite {
            args.push("--overwrite".into());
        }
        if job.keep_source {
            args.push("--keep-source".into());
        }
        args
    }

    fn open_log(&self) -> LaunchResult<std::fs::File> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LaunchError::Log {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| LaunchError::Log {
                source,
                path: self.log_path.clone(),
            })
    }
}

impl Launcher for DetachedProcessLauncher {
    fn launch(&self, job: &TranscodeJob) -> LaunchResult<()> {
        let stdout = self.open_log()?;
        let stderr = stdout.try_clone().map_err(|source| LaunchError::Log {
            source,
            path: self.log_path.clone(),
        })?;
        let mut command = Command::new(&self.program);
        command
            .args(self.args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        info!(
            episode_id = job.episode_id,
            pid = child.id(),
            log = %self.log_path.display(),
            "detached transcode process started"
        );
        self.reap(child, job.episode_id);
        Ok(())
    }
}

/// Runs the orchestrator as a task on the caller's tokio runtime.
#[derive(Debug)]
pub struct TaskLauncher {
    orchestrator: Arc<TranscodeOrchestrator>,
    tasks: Mutex<Vec<JoinHandle<TranscodeResult<TranscodeReport>>>>,
}

impl TaskLauncher {
    pub fn new(orchestrator: Arc<TranscodeOrchestrator>) -> Self {
        Self {
            orchestrator,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Handles of every task started so far, leaving none behind.
    pub fn take_tasks(&self) -> Vec<JoinHandle<TranscodeResult<TranscodeReport>>> {
        let mut guard = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *guard)
    }
}

impl Launcher for TaskLauncher {
    fn launch(&self, job: &TranscodeJob) -> LaunchResult<()> {
        let handle = Handle::try_current().map_err(|_| LaunchError::NoRuntime)?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let job = job.clone();
        let task = handle.spawn(async move { orchestrator.run(&job).await });
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub episode_id: i64,
    pub anime_id: i64,
    pub source: String,
    pub qualities: String,
    pub language: String,
    pub overwrite: bool,
    pub keep_source: bool,
}

impl SubmitRequest {
    pub fn job(&self) -> TranscodeJob {
        TranscodeJob::new(self.episode_id, self.source.clone())
            .qualities(self.qualities.clone())
            .language(self.language.clone())
            .overwrite(self.overwrite)
            .keep_source(self.keep_source)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted {
        episode_id: i64,
        anime_id: i64,
        progress: TranscodeProgress,
    },
    Conflict {
        message: String,
        active_episode_id: i64,
    },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnimeTranscodeStatus {
    pub anime_id: i64,
    pub active_episode_id: Option<i64>,
    pub progress: Option<TranscodeProgress>,
}

/// Request-side entry point: conflict checks, lock, queued record, launch.
#[derive(Clone)]
pub struct LaunchAdapter {
    tracker: ProgressTracker,
    launcher: Arc<dyn Launcher>,
}

impl std::fmt::Debug for LaunchAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchAdapter")
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl LaunchAdapter {
    pub fn new(tracker: ProgressTracker, launcher: Arc<dyn Launcher>) -> Self {
        Self { tracker, launcher }
    }

    pub fn submit(&self, request: &SubmitRequest) -> LaunchResult<SubmitOutcome> {
        let episode_id = request.episode_id;
        let anime_id = request.anime_id;
        if self.tracker.get_progress(episode_id)?.is_active() {
            info!(episode_id, "transcode rejected: episode already running");
            return Ok(SubmitOutcome::Conflict {
                message: EPISODE_BUSY_MESSAGE.to_string(),
                active_episode_id: episode_id,
            });
        }
        if let Some(conflict) = self.conflict_for(anime_id, Some(episode_id))? {
            return Ok(conflict);
        }

        self.tracker.acquire_lock(anime_id, episode_id)?;
        let queued = self.tracker.reset_progress(
            episode_id,
            ProgressUpdate::new()
                .stage(TranscodeStage::Probing)
                .progress(0.0)
                .message(QUEUED_MESSAGE),
        )?;

        if let Err(err) = self.launcher.launch(&request.job()) {
            error!(episode_id, anime_id, error = %err, "failed to launch transcode");
            let failed = ProgressUpdate::failed(
                FailureKind::LaunchFailure,
                LAUNCH_FAILED_MESSAGE,
                err.to_string(),
            );
            self.tracker.reset_progress(episode_id, failed)?;
            // A lock left behind here names a failed run and clears on next read.
            if let Err(release) = self.tracker.release_lock(anime_id) {
                warn!(anime_id, error = %release, "failed to release lock after launch failure");
            }
            return Err(err);
        }
        info!(episode_id, anime_id, qualities = %request.qualities, "transcode queued");
        Ok(SubmitOutcome::Accepted {
            episode_id,
            anime_id,
            progress: queued,
        })
    }

    pub fn progress(&self, episode_id: i64) -> LaunchResult<TranscodeProgress> {
        Ok(self.tracker.get_progress(episode_id)?)
    }

    pub fn anime_status(&self, anime_id: i64) -> LaunchResult<AnimeTranscodeStatus> {
        let active_episode_id = self.tracker.active_episode_for(anime_id)?;
        let progress = match active_episode_id {
            Some(episode_id) => Some(self.tracker.get_progress(episode_id)?),
            None => None,
        };
        Ok(AnimeTranscodeStatus {
            anime_id,
            active_episode_id,
            progress,
        })
    }

    /// Conflict when another episode of the anime is transcoding. Guards
    /// catalog edits such as adding episodes or uploading sources.
    pub fn ensure_anime_idle(
        &self,
        anime_id: i64,
        allow_episode: Option<i64>,
    ) -> LaunchResult<Option<SubmitOutcome>> {
        self.conflict_for(anime_id, allow_episode)
    }

    fn conflict_for(
        &self,
        anime_id: i64,
        allow_episode: Option<i64>,
    ) -> LaunchResult<Option<SubmitOutcome>> {
        match self.tracker.active_episode_for(anime_id)? {
            Some(active) if Some(active) != allow_episode => {
                info!(anime_id, active_episode_id = active, "anime has an active transcode");
                Ok(Some(SubmitOutcome::Conflict {
                    message: anime_busy_message(active),
                    active_episode_id: active,
                }))
            }
            _ => Ok(None),
        }
    }
}
