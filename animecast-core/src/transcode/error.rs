use thiserror::Error;

use crate::error::FailureKind;
use crate::media::MediaError;
use crate::probe::ProbeError;
use crate::process::ProcessError;
use crate::progress::StateError;
use crate::rendition::RenditionError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("episode #{0} was not found")]
    EpisodeNotFound(i64),
    #[error("source file was not found: {0}")]
    SourceNotFound(String),
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Rendition(#[from] RenditionError),
    #[error("encoder failed for {quality}: {detail}")]
    Encode { quality: String, detail: String },
    #[error("failed to start encoder for {quality}: {source}")]
    EncoderLaunch {
        quality: String,
        source: ProcessError,
    },
    #[error("process supervision failed: {0}")]
    Process(#[from] ProcessError),
    #[error("progress store error: {0}")]
    State(#[from] StateError),
    #[error("media store error: {0}")]
    Media(#[from] MediaError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TranscodeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TranscodeError::EpisodeNotFound(_) => FailureKind::EpisodeNotFound,
            TranscodeError::SourceNotFound(_) => FailureKind::SourceNotFound,
            TranscodeError::Probe(err) if err.is_launch_failure() => FailureKind::LaunchFailure,
            TranscodeError::Probe(_) => FailureKind::ProbeFailure,
            TranscodeError::Rendition(RenditionError::NoEligibleQuality { .. }) => {
                FailureKind::NoEligibleQuality
            }
            TranscodeError::Rendition(_) => FailureKind::UnsupportedQuality,
            TranscodeError::Encode { .. } => FailureKind::EncodeFailure,
            TranscodeError::EncoderLaunch { .. } => FailureKind::LaunchFailure,
            TranscodeError::Process(_)
            | TranscodeError::State(_)
            | TranscodeError::Media(_)
            | TranscodeError::Storage(_) => FailureKind::Internal,
        }
    }

    /// Operator-facing message for the progress record.
    pub fn summary(&self) -> String {
        match self {
            TranscodeError::EpisodeNotFound(_) => "Episode was not found.".into(),
            TranscodeError::SourceNotFound(_) => "Source file was not found.".into(),
            TranscodeError::Probe(ProbeError::Unparsable { .. }) => {
                "Could not detect source resolution.".into()
            }
            TranscodeError::Probe(_) => "FFprobe failed to read source video stream info.".into(),
            TranscodeError::Rendition(RenditionError::EmptyRequest) => {
                "No valid qualities were provided.".into()
            }
            TranscodeError::Rendition(RenditionError::UnsupportedQuality(token)) => {
                format!("Unsupported quality: {token}")
            }
            TranscodeError::Rendition(RenditionError::NoEligibleQuality { .. }) => {
                "No eligible quality remains for this source.".into()
            }
            TranscodeError::Encode { quality, .. } => format!("FFmpeg failed for {quality}."),
            TranscodeError::EncoderLaunch { quality, .. } => {
                format!("Failed to start FFmpeg for {quality}.")
            }
            TranscodeError::Process(_)
            | TranscodeError::State(_)
            | TranscodeError::Media(_)
            | TranscodeError::Storage(_) => "Transcoding failed.".into(),
        }
    }

    /// Error text for the progress record.
    pub fn detail(&self) -> String {
        match self {
            TranscodeError::EpisodeNotFound(id) => format!("Episode #{id} was not found."),
            TranscodeError::Probe(ProbeError::Failed { stderr, .. }) => stderr.clone(),
            TranscodeError::Rendition(RenditionError::NoEligibleQuality { width, height }) => {
                format!("No eligible quality remains for source {width}x{height}.")
            }
            TranscodeError::Encode { detail, .. } => detail.clone(),
            TranscodeError::SourceNotFound(_)
            | TranscodeError::Probe(ProbeError::Unparsable { .. })
            | TranscodeError::Rendition(_) => self.summary(),
            other => other.to_string(),
        }
    }
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
