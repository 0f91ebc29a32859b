use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::process::{ProcessError, ProcessRunner};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe could not be started: {0}")]
    Process(#[from] ProcessError),
    #[error("ffprobe failed to read source video stream info: {stderr}")]
    Failed { exit_code: i32, stderr: String },
    #[error("could not detect source resolution from {output:?}")]
    Unparsable { output: String },
}

impl ProbeError {
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, ProbeError::Process(ProcessError::Launch { .. }))
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone)]
pub struct MediaProber {
    runner: Arc<dyn ProcessRunner>,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl std::fmt::Debug for MediaProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaProber")
            .field("ffprobe", &self.ffprobe)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MediaProber {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        ffprobe: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    pub async fn probe_resolution(&self, source: &Path) -> ProbeResult<Resolution> {
        let argv = self.argv(
            &[
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=s=x:p=0",
            ],
            source,
        );
        let output = self.runner.run(&argv, Some(self.timeout)).await?;
        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(ProbeError::Failed {
                exit_code: output.exit_code,
                stderr: if stderr.is_empty() {
                    "FFprobe failed.".to_string()
                } else {
                    stderr.to_string()
                },
            });
        }
        let resolution =
            parse_resolution(&output.stdout).ok_or_else(|| ProbeError::Unparsable {
                output: output.stdout.trim().to_string(),
            })?;
        debug!(source = %source.display(), %resolution, "probed source resolution");
        Ok(resolution)
    }

    /// Longest of the container and stream durations, in microseconds.
    /// `None` is not an error: progress falls back to the encoder's own clock.
    pub async fn probe_duration(&self, source: &Path) -> Option<u64> {
        let argv = self.argv(
            &[
                "-v",
                "error",
                "-show_entries",
                "format=duration:stream=duration",
                "-of",
                "json",
            ],
            source,
        );
        match self.runner.run(&argv, Some(self.timeout)).await {
            Ok(output) if output.success() => parse_duration_json(&output.stdout),
            Ok(output) => {
                warn!(exit_code = output.exit_code, "duration probe failed");
                None
            }
            Err(err) => {
                warn!(error = %err, "duration probe could not run");
                None
            }
        }
    }

    fn argv(&self, flags: &[&str], source: &Path) -> Vec<String> {
        let mut argv = Vec::with_capacity(flags.len() + 2);
        argv.push(self.ffprobe.to_string_lossy().to_string());
        argv.extend(flags.iter().map(|flag| flag.to_string()));
        argv.push(source.to_string_lossy().to_string());
        argv
    }
}

pub fn parse_resolution(output: &str) -> Option<Resolution> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (width, height) = line.split_once('x')?;
    let width: u32 = width.trim().parse().ok()?;
    // Some containers append a trailing separator after the height.
    let height: u32 = height.trim().trim_end_matches('x').parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(Resolution { width, height })
}

pub fn parse_duration_json(output: &str) -> Option<u64> {
    let decoded: Value = serde_json::from_str(output).ok()?;
    let mut candidates = Vec::new();
    if let Some(value) = decoded.pointer("/format/duration").and_then(seconds_value) {
        candidates.push(value);
    }
    if let Some(streams) = decoded.get("streams").and_then(Value::as_array) {
        candidates.extend(
            streams
                .iter()
                .filter_map(|stream| stream.get("duration").and_then(seconds_value)),
        );
    }
    let longest = candidates
        .into_iter()
        .filter(|seconds| *seconds > 0.0)
        .fold(None, |best: Option<f64>, value| {
            Some(best.map_or(value, |current| current.max(value)))
        })?;
    Some((longest * 1_000_000.0).round() as u64)
}

fn seconds_value(value: &Value) -> Option<f64> {
    let seconds: Option<f64> = match value {
        Value::String(raw) => raw.trim().parse().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    };
    seconds.filter(|seconds| seconds.is_finite())
}
