use std::time::{Duration, Instant};

/// An `out_time_ms` reading at or below `total_ms * MILLIS_HEURISTIC_FACTOR`
/// is taken as milliseconds. Encoder builds disagree on the unit of that key.
pub const MILLIS_HEURISTIC_FACTOR: f64 = 1.5;

/// Highest overall percentage reported while an encode is still running.
pub const RUNNING_PROGRESS_CAP: f64 = 99.5;

/// Splits streamed encoder output into lines. Carriage returns end a line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Remaining partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

/// `HH:MM:SS` with optional fraction. Zero and malformed clocks yield `None`.
pub fn parse_clock_to_micros(clock: &str) -> Option<u64> {
    let mut parts = clock.trim().splitn(3, ':');
    let hours = parse_clock_integer(parts.next()?)?;
    let minutes = parse_clock_integer(parts.next()?)?;
    let seconds_raw = parts.next()?;
    let (whole, fraction) = match seconds_raw.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (seconds_raw, None),
    };
    parse_clock_integer(whole)?;
    if let Some(fraction) = fraction {
        parse_clock_integer(fraction)?;
    }
    let seconds: f64 = seconds_raw.parse().ok()?;
    let total = hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds;
    if total <= 0.0 {
        return None;
    }
    Some((total * 1_000_000.0).round() as u64)
}

fn parse_clock_integer(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

pub fn disambiguate_elapsed_millis(value: u64, total_micros: Option<u64>) -> u64 {
    let Some(total) = total_micros.filter(|total| *total > 0) else {
        return value;
    };
    if value as f64 <= total as f64 / 1000.0 * MILLIS_HEURISTIC_FACTOR {
        value.saturating_mul(1000)
    } else {
        value
    }
}

/// Elapsed encode time in microseconds carried by one `-progress` line.
pub fn parse_progress_line(line: &str, total_micros: Option<u64>) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    let value = value.trim();
    let elapsed = match key.trim() {
        "out_time" => parse_clock_to_micros(value)?,
        "out_time_us" => value.parse::<u64>().ok()?,
        "out_time_ms" => disambiguate_elapsed_millis(value.parse::<u64>().ok()?, total_micros),
        _ => return None,
    };
    (elapsed > 0).then_some(elapsed)
}

/// Media duration used as the denominator for per-rendition progress. Without
/// a probed value it is the longest elapsed time seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationEstimate {
    micros: Option<u64>,
    probed: bool,
}

impl DurationEstimate {
    pub fn new(probed: Option<u64>) -> Self {
        let micros = probed.filter(|value| *value > 0);
        Self {
            micros,
            probed: micros.is_some(),
        }
    }

    pub fn total_micros(&self) -> Option<u64> {
        self.micros
    }

    pub fn observe(&mut self, elapsed_micros: u64) {
        if self.probed || elapsed_micros == 0 {
            return;
        }
        let grown = self
            .micros
            .map_or(elapsed_micros, |current| current.max(elapsed_micros));
        self.micros = Some(grown);
    }

    /// Percentage of the current rendition, clamped to `0..=100`.
    pub fn quality_progress(&self, elapsed_micros: u64) -> Option<f64> {
        let total = self.micros.filter(|value| *value > 0)?;
        let percent = elapsed_micros as f64 / total as f64 * 100.0;
        Some(percent.clamp(0.0, 100.0))
    }
}

/// Overall percentage for rendition `index` (0-based) of `total`.
pub fn overall_progress(index: usize, total: usize, quality_progress: f64) -> f64 {
    let total = total.max(1) as f64;
    let overall = (index as f64 + quality_progress / 100.0) / total * 100.0;
    overall.clamp(0.0, RUNNING_PROGRESS_CAP)
}

/// Decides whether a running progress value is worth writing.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    epsilon: f64,
    interval: Duration,
    last_value: f64,
    last_write: Instant,
}

impl ProgressThrottle {
    pub fn new(epsilon: f64, interval: Duration) -> Self {
        Self {
            epsilon,
            interval,
            last_value: -1.0,
            last_write: Instant::now(),
        }
    }

    pub fn should_write(&mut self, value: f64) -> bool {
        self.should_write_at(value, Instant::now())
    }

    pub fn should_write_at(&mut self, value: f64, now: Instant) -> bool {
        let advanced = value > self.last_value + self.epsilon;
        let stale = now.saturating_duration_since(self.last_write) > self.interval;
        if advanced || stale {
            self.last_value = value;
            self.last_write = now;
            true
        } else {
            false
        }
    }
}

/// Keeps the last `capacity` bytes of a stream.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    capacity: usize,
    bytes: Vec<u8>,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.capacity {
            let excess = self.bytes.len() - self.capacity;
            self.bytes.drain(..excess);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}
