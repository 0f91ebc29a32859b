use std::path::PathBuf;
use std::sync::Arc;

use animecast_core::{
    load_config, AnimeTranscodeStatus, AnimecastConfig, DetachedProcessLauncher, Episode,
    EpisodeMedia, LaunchAdapter, Launcher, NewEpisode, ProgressTracker, SqliteMediaStore,
    SqliteStateStore, StateStore, SubmitOutcome, SubmitRequest, SystemProcessRunner, TaskLauncher,
    TranscodeJob, TranscodeOrchestrator, TranscodeProgress, TranscodeReport,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] animecast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("media store error: {0}")]
    Media(#[from] animecast_core::MediaError),
    #[error("state store error: {0}")]
    State(#[from] animecast_core::StateError),
    #[error("launch error: {0}")]
    Launch(#[from] animecast_core::LaunchError),
    #[error("transcode failed: {0}")]
    Transcode(#[from] animecast_core::TranscodeError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("{0}")]
    Conflict(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Animecast transcode control interface", long_about = None)]
pub struct Cli {
    /// Path to animecast.toml
    #[arg(long, default_value = "configs/animecast.toml")]
    pub config: PathBuf,
    /// Override for media.sqlite
    #[arg(long)]
    pub media_db: Option<PathBuf>,
    /// Override for state.sqlite
    #[arg(long)]
    pub state_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Database maintenance
    #[command(subcommand)]
    Db(DbCommands),
    /// Episode catalog helpers
    #[command(subcommand)]
    Episode(EpisodeCommands),
    /// Transcode submission, execution and polling
    #[command(subcommand)]
    Transcode(TranscodeCommands),
}

#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Creates the media and state schemas
    Init,
    /// Removes expired progress and lock entries
    Purge,
}

#[derive(Subcommand, Debug)]
pub enum EpisodeCommands {
    /// Registers an episode, updating the title if it already exists
    Add(EpisodeAddArgs),
    /// Lists stored renditions for an episode
    Media(EpisodeMediaArgs),
}

#[derive(Args, Debug)]
pub struct EpisodeAddArgs {
    pub anime_id: i64,
    pub episode_number: u32,
    #[arg(long, default_value_t = 1)]
    pub season: u32,
    #[arg(long)]
    pub title: Option<String>,
}

#[derive(Args, Debug)]
pub struct EpisodeMediaArgs {
    pub episode_id: i64,
}

#[derive(Subcommand, Debug)]
pub enum TranscodeCommands {
    /// Runs a transcode in the foreground; this is what submissions launch
    Run(RunArgs),
    /// Checks for conflicts, takes the anime lock and launches a background run
    Submit(SubmitArgs),
    /// Shows the progress record of an episode
    Progress(ProgressArgs),
    /// Shows which episode of an anime is transcoding
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TranscodeArgs {
    pub episode_id: i64,
    /// Uploaded source path, relative to a source root or absolute
    pub source: String,
    /// Comma separated quality list; defaults to transcode.default_qualities
    #[arg(long)]
    pub qualities: Option<String>,
    /// Language tag for file names and media rows; defaults to transcode.default_language
    #[arg(long)]
    pub language: Option<String>,
    /// Leave the uploaded source in place after success
    #[arg(long, default_value_t = false)]
    pub keep_source: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub transcode: TranscodeArgs,
    /// Replace existing output files
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub transcode: TranscodeArgs,
    /// Keep existing output files; re-submissions replace them by default
    #[arg(long, default_value_t = false)]
    pub no_overwrite: bool,
    /// Run inside this process and wait instead of detaching
    #[arg(long, default_value_t = false)]
    pub wait: bool,
}

impl SubmitArgs {
    pub fn overwrite(&self) -> bool {
        !self.no_overwrite
    }
}

#[derive(Args, Debug)]
pub struct ProgressArgs {
    pub episode_id: i64,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub anime_id: i64,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Db(DbCommands::Init) => {
            let report = context.init_databases()?;
            render(&report, cli.format)?;
        }
        Commands::Db(DbCommands::Purge) => {
            let report = context.purge_state()?;
            render(&report, cli.format)?;
        }
        Commands::Episode(EpisodeCommands::Add(args)) => {
            let episode = context.add_episode(args)?;
            render(&episode, cli.format)?;
        }
        Commands::Episode(EpisodeCommands::Media(args)) => {
            let media = context.episode_media(args.episode_id)?;
            render(&media, cli.format)?;
        }
        Commands::Transcode(TranscodeCommands::Run(args)) => {
            let report = block_on(context.run_transcode(args))??;
            render(&report, cli.format)?;
        }
        Commands::Transcode(TranscodeCommands::Submit(args)) => {
            let outcome = if args.wait {
                block_on(context.submit_and_wait(args))??
            } else {
                context.submit_detached(args)?
            };
            render(&outcome, cli.format)?;
            if let SubmitOutcome::Conflict { message, .. } = outcome.outcome {
                return Err(AppError::Conflict(message));
            }
        }
        Commands::Transcode(TranscodeCommands::Progress(args)) => {
            let progress = context
                .adapter(context.detached_launcher())?
                .progress(args.episode_id)?;
            render(&progress, cli.format)?;
        }
        Commands::Transcode(TranscodeCommands::Status(args)) => {
            let status = context
                .adapter(context.detached_launcher())?
                .anime_status(args.anime_id)?;
            render(&status, cli.format)?;
        }
    }

    Ok(())
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: AnimecastConfig,
    config_path: PathBuf,
    media_db: PathBuf,
    state_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_config(&config_path)?;
        let media_db = cli
            .media_db
            .clone()
            .unwrap_or_else(|| config.media_db_path());
        let state_db = cli
            .state_db
            .clone()
            .unwrap_or_else(|| config.state_db_path());
        Ok(Self {
            config,
            config_path,
            media_db,
            state_db,
        })
    }

    fn media_store(&self) -> Result<SqliteMediaStore> {
        Ok(SqliteMediaStore::builder().path(&self.media_db).build()?)
    }

    fn state_store(&self) -> Result<SqliteStateStore> {
        Ok(SqliteStateStore::builder().path(&self.state_db).build()?)
    }

    fn tracker(&self) -> Result<ProgressTracker> {
        let store = self.state_store()?;
        store.initialize()?;
        Ok(ProgressTracker::new(Arc::new(store) as Arc<dyn StateStore>).with_ttls(
            self.config.state.progress_ttl(),
            self.config.state.lock_ttl(),
        ))
    }

    fn orchestrator(&self) -> Result<TranscodeOrchestrator> {
        let media = self.media_store()?;
        media.initialize()?;
        Ok(TranscodeOrchestrator::from_config(
            &self.config,
            media,
            self.tracker()?,
            Arc::new(SystemProcessRunner),
        ))
    }

    fn adapter(&self, launcher: Arc<dyn Launcher>) -> Result<LaunchAdapter> {
        Ok(LaunchAdapter::new(self.tracker()?, launcher))
    }

    /// Relaunches this binary with the same store locations.
    fn detached_launcher(&self) -> Arc<dyn Launcher> {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("animecastctl"));
        let log_path = self.config.logs_dir().join("transcode.log");
        let global_args = vec![
            "--config".to_string(),
            self.config_path.to_string_lossy().to_string(),
            "--media-db".to_string(),
            self.media_db.to_string_lossy().to_string(),
            "--state-db".to_string(),
            self.state_db.to_string_lossy().to_string(),
        ];
        Arc::new(DetachedProcessLauncher::new(program, log_path).with_global_args(global_args))
    }

    fn init_databases(&self) -> Result<InitReport> {
        self.media_store()?.initialize()?;
        self.state_store()?.initialize()?;
        Ok(InitReport {
            media_db: self.media_db.display().to_string(),
            state_db: self.state_db.display().to_string(),
        })
    }

    fn purge_state(&self) -> Result<PurgeReport> {
        let store = self.state_store()?;
        store.initialize()?;
        let removed = store.purge_expired()?;
        info!(removed, "expired transcode state purged");
        Ok(PurgeReport { removed })
    }

    fn add_episode(&self, args: &EpisodeAddArgs) -> Result<Episode> {
        let store = self.media_store()?;
        store.initialize()?;
        let mut episode = NewEpisode::new(args.anime_id, args.episode_number).season(args.season);
        if let Some(title) = &args.title {
            episode = episode.title(title.clone());
        }
        Ok(store.upsert_episode(&episode)?)
    }

    fn episode_media(&self, episode_id: i64) -> Result<MediaList> {
        let store = self.media_store()?;
        if store.fetch_episode(episode_id)?.is_none() {
            return Err(AppError::MissingResource(format!("episode #{episode_id}")));
        }
        Ok(MediaList {
            episode_id,
            rows: store.list_media(episode_id)?,
        })
    }

    fn job(&self, args: &TranscodeArgs, overwrite: bool) -> TranscodeJob {
        let defaults = &self.config.transcode;
        TranscodeJob::new(args.episode_id, args.source.clone())
            .qualities(
                args.qualities
                    .clone()
                    .unwrap_or_else(|| defaults.default_qualities.clone()),
            )
            .language(
                args.language
                    .clone()
                    .unwrap_or_else(|| defaults.default_language.clone()),
            )
            .overwrite(overwrite)
            .keep_source(args.keep_source)
    }

    async fn run_transcode(&self, args: &RunArgs) -> Result<TranscodeReport> {
        let orchestrator = self.orchestrator()?;
        Ok(orchestrator
            .run(&self.job(&args.transcode, args.overwrite))
            .await?)
    }

    fn submit_request(&self, args: &SubmitArgs) -> Result<SubmitRequest> {
        let episode_id = args.transcode.episode_id;
        let media = self.media_store()?;
        media.initialize()?;
        let episode = media
            .fetch_episode(episode_id)?
            .ok_or_else(|| AppError::MissingResource(format!("episode #{episode_id}")))?;
        let job = self.job(&args.transcode, args.overwrite());
        Ok(SubmitRequest {
            episode_id: episode.id,
            anime_id: episode.anime_id,
            source: job.source,
            qualities: job.qualities,
            language: job.language,
            overwrite: job.overwrite,
            keep_source: job.keep_source,
        })
    }

    fn submit_detached(&self, args: &SubmitArgs) -> Result<SubmitReport> {
        let request = self.submit_request(args)?;
        let outcome = self.adapter(self.detached_launcher())?.submit(&request)?;
        Ok(SubmitReport {
            outcome,
            report: None,
        })
    }

    async fn submit_and_wait(&self, args: &SubmitArgs) -> Result<SubmitReport> {
        let request = self.submit_request(args)?;
        let launcher = Arc::new(TaskLauncher::new(Arc::new(self.orchestrator()?)));
        let outcome = self
            .adapter(launcher.clone() as Arc<dyn Launcher>)?
            .submit(&request)?;
        let mut report = None;
        for task in launcher.take_tasks() {
            match task.await {
                Ok(result) => report = Some(result?),
                Err(err) => {
                    return Err(AppError::MissingResource(format!(
                        "transcode task did not complete: {err}"
                    )))
                }
            }
        }
        Ok(SubmitReport { outcome, report })
    }
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub media_db: String,
    pub state_db: String,
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        format!(
            "media db ready: {}\nstate db ready: {}",
            self.media_db, self.state_db
        )
    }
}

#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub removed: usize,
}

impl DisplayFallback for PurgeReport {
    fn display(&self) -> String {
        format!("expired entries removed: {}", self.removed)
    }
}

impl DisplayFallback for Episode {
    fn display(&self) -> String {
        format!(
            "episode #{} | anime={} | s{}e{} | {}",
            self.id,
            self.anime_id,
            self.season_number,
            self.episode_number,
            self.title.as_deref().unwrap_or("<untitled>")
        )
    }
}

#[derive(Debug, Serialize)]
pub struct MediaList {
    pub episode_id: i64,
    pub rows: Vec<EpisodeMedia>,
}

impl DisplayFallback for MediaList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("episode #{} has no media", self.episode_id);
        }
        let mut lines = Vec::new();
        for row in &self.rows {
            let size = row
                .size
                .map(|v| format!("{v}B"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "#{id} {kind} {quality} lang={lang} size={size}{primary} {path}",
                id = row.id,
                kind = row.media_type.as_str(),
                quality = row.quality.as_deref().unwrap_or("-"),
                lang = row.language.as_deref().unwrap_or("-"),
                primary = if row.is_primary { " [primary]" } else { "" },
                path = row.path,
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for TranscodeProgress {
    fn display(&self) -> String {
        let mut line = format!(
            "episode #{} | stage={} | progress={:.2}%",
            self.episode_id, self.stage, self.progress
        );
        if let Some(quality) = &self.quality {
            line.push_str(&format!(
                " | {quality} ({}/{}) {:.2}%",
                self.quality_index, self.qualities_total, self.quality_progress
            ));
        }
        let mut lines = vec![line];
        if let Some(message) = &self.message {
            lines.push(format!("  {message}"));
        }
        if let Some(error) = &self.error {
            let kind = self
                .error_kind
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "error".to_string());
            lines.push(format!("  [{kind}] {error}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for AnimeTranscodeStatus {
    fn display(&self) -> String {
        match (&self.active_episode_id, &self.progress) {
            (Some(episode_id), Some(progress)) => format!(
                "anime #{} is transcoding episode #{episode_id}\n{}",
                self.anime_id,
                progress.display()
            ),
            _ => format!("anime #{} is idle", self.anime_id),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitReport {
    #[serde(flatten)]
    pub outcome: SubmitOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<TranscodeReport>,
}

impl DisplayFallback for SubmitReport {
    fn display(&self) -> String {
        let mut lines = match &self.outcome {
            SubmitOutcome::Accepted {
                episode_id,
                anime_id,
                ..
            } => vec![format!(
                "accepted: episode #{episode_id} of anime #{anime_id}"
            )],
            SubmitOutcome::Conflict { message, .. } => vec![format!("conflict: {message}")],
        };
        if let Some(report) = &self.report {
            lines.push(report.display());
        }
        lines.join("\n")
    }
}

impl DisplayFallback for TranscodeReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "episode #{} transcoded from {}x{}",
            self.episode_id, self.source_width, self.source_height
        )];
        for rendition in &self.renditions {
            lines.push(format!(
                "  - {}{} -> {} (media #{})",
                rendition.label,
                if rendition.is_primary { " [primary]" } else { "" },
                rendition.path,
                rendition.media_id
            ));
        }
        if !self.skipped.is_empty() {
            lines.push(format!("  skipped: {}", self.skipped.join(", ")));
        }
        if self.source_removed {
            lines.push("  source removed".to_string());
        }
        lines.join("\n")
    }
}
