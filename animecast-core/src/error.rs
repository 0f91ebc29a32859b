use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Terminal failure categories written to the progress record so pollers can
/// branch without parsing the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EpisodeNotFound,
    SourceNotFound,
    ProbeFailure,
    UnsupportedQuality,
    NoEligibleQuality,
    EncodeFailure,
    LaunchFailure,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::EpisodeNotFound => "episode_not_found",
            FailureKind::SourceNotFound => "source_not_found",
            FailureKind::ProbeFailure => "probe_failure",
            FailureKind::UnsupportedQuality => "unsupported_quality",
            FailureKind::NoEligibleQuality => "no_eligible_quality",
            FailureKind::EncodeFailure => "encode_failure",
            FailureKind::LaunchFailure => "launch_failure",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
