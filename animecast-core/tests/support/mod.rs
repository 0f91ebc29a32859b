#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use animecast_core::config::load_config;
use animecast_core::progress::progress_key;
use animecast_core::{
    AnimecastConfig, CommandOutput, Episode, MemoryStateStore, NewEpisode, OrchestratorSettings,
    ProcessError, ProcessResult, ProcessRunner, ProgressTracker, SqliteMediaStore, StateError,
    StateResult, StateStore, StreamingProcess, TranscodeOrchestrator, TranscodeProgress,
};

/// Encoder behaviour for one rendition label.
#[derive(Debug, Clone)]
pub struct EncodeScript {
    pub stdout: Vec<String>,
    /// Output that only becomes readable once the process has been waited on.
    pub trailing_stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl EncodeScript {
    pub fn success(stdout: &[&str]) -> Self {
        Self {
            stdout: stdout.iter().map(|chunk| chunk.to_string()).collect(),
            trailing_stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn trailing(mut self, stdout: &str) -> Self {
        self.trailing_stdout = stdout.to_string();
        self
    }

    pub fn failure(stderr: &str) -> Self {
        Self {
            stdout: vec!["out_time_us=1000000\nprogress=continue\n".into()],
            trailing_stdout: String::new(),
            stderr: stderr.into(),
            exit_code: 1,
        }
    }
}

/// Answers ffprobe calls from canned output and plays back encoder scripts.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    pub resolution: String,
    pub duration_json: String,
    pub probe_exit_code: i32,
    pub encodes: Mutex<Vec<(String, EncodeScript)>>,
    pub started: Mutex<Vec<Vec<String>>>,
    pub refuse_start: bool,
}

impl ScriptedRunner {
    pub fn new(resolution: &str, duration_seconds: Option<f64>) -> Self {
        let duration_json = match duration_seconds {
            Some(seconds) => format!(
                r#"{{"streams":[{{"duration":"{seconds:.6}"}}],"format":{{"duration":"{seconds:.6}"}}}}"#
            ),
            None => r#"{"streams":[],"format":{}}"#.to_string(),
        };
        Self {
            resolution: resolution.to_string(),
            duration_json,
            ..Self::default()
        }
    }

    pub fn script(self, label: &str, script: EncodeScript) -> Self {
        self.encodes
            .lock()
            .unwrap()
            .push((label.to_string(), script));
        self
    }

    pub fn started_outputs(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter_map(|argv| argv.last().cloned())
            .collect()
    }

    fn script_for(&self, output: &str) -> EncodeScript {
        let name = Path::new(output)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.encodes
            .lock()
            .unwrap()
            .iter()
            .find(|(label, _)| name.ends_with(&format!("{label}.mp4")))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| EncodeScript::success(&["out_time_us=1000000\nprogress=end\n"]))
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        argv: &[String],
        _timeout: Option<Duration>,
    ) -> ProcessResult<CommandOutput> {
        let stdout = if argv.iter().any(|arg| arg == "csv=s=x:p=0") {
            self.resolution.clone()
        } else {
            self.duration_json.clone()
        };
        Ok(CommandOutput {
            exit_code: self.probe_exit_code,
            stdout,
            stderr: if self.probe_exit_code == 0 {
                String::new()
            } else {
                "Invalid data found when processing input".into()
            },
        })
    }

    fn start(&self, argv: &[String]) -> ProcessResult<Box<dyn StreamingProcess>> {
        if self.refuse_start {
            return Err(ProcessError::Launch {
                program: argv[0].clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        self.started.lock().unwrap().push(argv.to_vec());
        let output = argv.last().cloned().unwrap_or_default();
        let script = self.script_for(&output);
        if script.exit_code == 0 {
            std::fs::write(&output, format!("encoded:{output}")).unwrap();
        }
        Ok(Box::new(ScriptedProcess {
            stdout: script.stdout.into_iter().map(String::into_bytes).collect(),
            trailing: script.trailing_stdout.into_bytes(),
            stderr: Some(script.stderr.into_bytes()),
            exit_code: script.exit_code,
        }))
    }
}

struct ScriptedProcess {
    stdout: VecDeque<Vec<u8>>,
    trailing: Vec<u8>,
    stderr: Option<Vec<u8>>,
    exit_code: i32,
}

#[async_trait]
impl StreamingProcess for ScriptedProcess {
    fn is_running(&mut self) -> ProcessResult<bool> {
        Ok(!self.stdout.is_empty())
    }

    fn poll_stdout_chunk(&mut self) -> Vec<u8> {
        self.stdout.pop_front().unwrap_or_default()
    }

    fn poll_stderr_chunk(&mut self) -> Vec<u8> {
        if self.stdout.is_empty() {
            self.stderr.take().unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    async fn wait(&mut self) -> ProcessResult<i32> {
        self.stdout.clear();
        if !self.trailing.is_empty() {
            self.stdout.push_back(std::mem::take(&mut self.trailing));
        }
        Ok(self.exit_code)
    }
}

/// Memory store that keeps every progress record ever written.
#[derive(Debug, Default)]
pub struct RecordingStateStore {
    inner: MemoryStateStore,
    pub writes: Mutex<Vec<(String, String)>>,
    /// When set, `forget` fails as an unreachable store would.
    pub refuse_forget: AtomicBool,
}

impl RecordingStateStore {
    pub fn progress_history(&self, episode_id: i64) -> Vec<TranscodeProgress> {
        let key = progress_key(episode_id);
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(written, _)| *written == key)
            .map(|(_, value)| serde_json::from_str(value).unwrap())
            .collect()
    }
}

impl StateStore for RecordingStateStore {
    fn get(&self, key: &str) -> StateResult<Option<String>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &str, ttl: chrono::Duration) -> StateResult<()> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        self.inner.put(key, value, ttl)
    }

    fn forget(&self, key: &str) -> StateResult<()> {
        if self.refuse_forget.load(Ordering::SeqCst) {
            return Err(StateError::MissingStore);
        }
        self.inner.forget(key)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: AnimecastConfig,
    pub media: SqliteMediaStore,
    pub store: Arc<RecordingStateStore>,
    pub tracker: ProgressTracker,
    pub runner: Arc<ScriptedRunner>,
}

impl Harness {
    pub fn new(runner: ScriptedRunner) -> Self {
        let dir = TempDir::new().unwrap();
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/animecast.toml");
        let mut config = load_config(fixture).unwrap();
        config.paths.base_dir = dir.path().to_string_lossy().to_string();
        for root in config.source_roots() {
            std::fs::create_dir_all(root).unwrap();
        }
        std::fs::create_dir_all(config.public_root()).unwrap();

        let media = SqliteMediaStore::builder()
            .path(config.media_db_path())
            .build()
            .unwrap();
        media.initialize().unwrap();
        let store = Arc::new(RecordingStateStore::default());
        let tracker = ProgressTracker::new(store.clone() as Arc<dyn StateStore>);
        Self {
            dir,
            config,
            media,
            store,
            tracker,
            runner: Arc::new(runner),
        }
    }

    pub fn orchestrator(&self) -> TranscodeOrchestrator {
        let orchestrator = TranscodeOrchestrator::from_config(
            &self.config,
            self.media.clone(),
            self.tracker.clone(),
            self.runner.clone() as Arc<dyn ProcessRunner>,
        );
        let settings = OrchestratorSettings {
            poll_interval: Duration::from_millis(1),
            ..OrchestratorSettings::from(&self.config)
        };
        orchestrator.with_settings(settings)
    }

    pub fn episode(&self, anime_id: i64, number: u32) -> Episode {
        self.media
            .upsert_episode(&NewEpisode::new(anime_id, number))
            .unwrap()
    }

    /// Writes an upload into the first source root and returns its relative path.
    pub fn upload(&self, name: &str) -> String {
        let relative = format!("uploads/{name}");
        let path = self.source_root().join(&relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"source-bytes").unwrap();
        relative
    }

    pub fn source_root(&self) -> PathBuf {
        self.config.source_roots()[0].clone()
    }
}
