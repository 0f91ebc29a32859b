pub mod config;
pub mod error;
pub mod launch;
pub mod media;
pub mod probe;
pub mod process;
pub mod progress;
pub mod rendition;
pub mod sqlite;
pub mod storage;
pub mod transcode;

pub use config::{
    load_config, AnimecastConfig, EncoderSection, PathsSection, StateSection, StorageSection,
    ToolsSection, TranscodeSection,
};
pub use error::{ConfigError, FailureKind, Result};
pub use launch::{
    AnimeTranscodeStatus, DetachedProcessLauncher, LaunchAdapter, LaunchError, LaunchResult,
    Launcher, SubmitOutcome, SubmitRequest, TaskLauncher,
};
pub use media::{
    Episode, EpisodeMedia, MediaError, MediaResult, MediaType, NewEpisode, RenditionRecord,
    SqliteMediaStore, SqliteMediaStoreBuilder,
};
pub use probe::{MediaProber, ProbeError, ProbeResult, Resolution};
pub use process::{
    CommandOutput, ProcessError, ProcessResult, ProcessRunner, StreamingProcess,
    SystemProcessRunner,
};
pub use progress::{
    MemoryStateStore, ProgressTracker, ProgressUpdate, SqliteStateStore, SqliteStateStoreBuilder,
    StateError, StateResult, StateStore, TranscodeProgress, TranscodeStage,
};
pub use rendition::{QualityPreset, RenditionError, RenditionPlan, RenditionPlanner};
pub use storage::{
    BlobStore, LocalDiskStore, ResolvedSource, SourceLocator, SourceOrigin, StorageError,
};
pub use transcode::{
    OrchestratorSettings, RenditionOutcome, TranscodeError, TranscodeJob, TranscodeOrchestrator,
    TranscodeReport, TranscodeResult,
};
