use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("io error while supervising {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

pub type ProcessResult<T> = Result<T, ProcessError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Handle to a long-running child whose output is read incrementally.
#[async_trait]
pub trait StreamingProcess: Send {
    fn is_running(&mut self) -> ProcessResult<bool>;
    /// Bytes written to stdout since the previous call; empty when nothing new arrived.
    fn poll_stdout_chunk(&mut self) -> Vec<u8>;
    fn poll_stderr_chunk(&mut self) -> Vec<u8>;
    /// Blocks until exit. A child killed by a signal reports `-1`.
    async fn wait(&mut self) -> ProcessResult<i32>;
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Option<Duration>)
        -> ProcessResult<CommandOutput>;
    fn start(&self, argv: &[String]) -> ProcessResult<Box<dyn StreamingProcess>>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    fn command(argv: &[String]) -> ProcessResult<(String, Command)> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok((program.clone(), command))
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> ProcessResult<CommandOutput> {
        let (program, mut command) = Self::command(argv)?;
        debug!(program = %program, args = argv.len() - 1, "running command");
        let child = command.spawn().map_err(|source| ProcessError::Launch {
            program: program.clone(),
            source,
        })?;
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ProcessError::Timeout {
                    program: program.clone(),
                    timeout: limit,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| ProcessError::Io {
            program: program.clone(),
            source,
        })?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn start(&self, argv: &[String]) -> ProcessResult<Box<dyn StreamingProcess>> {
        let (program, mut command) = Self::command(argv)?;
        debug!(program = %program, "starting streaming command");
        let mut child = command.spawn().map_err(|source| ProcessError::Launch {
            program: program.clone(),
            source,
        })?;
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_reader(pipe, Arc::clone(&stdout)));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_reader(pipe, Arc::clone(&stderr)));
        }
        Ok(Box::new(SystemStreamingProcess {
            program,
            child,
            stdout,
            stderr,
            readers,
            exit_code: None,
        }))
    }
}

struct SystemStreamingProcess {
    program: String,
    child: Child,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
    exit_code: Option<i32>,
}

#[async_trait]
impl StreamingProcess for SystemStreamingProcess {
    fn is_running(&mut self) -> ProcessResult<bool> {
        if self.exit_code.is_some() {
            return Ok(false);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.code().unwrap_or(-1));
                Ok(false)
            }
            Ok(None) => Ok(true),
            Err(source) => Err(ProcessError::Io {
                program: self.program.clone(),
                source,
            }),
        }
    }

    fn poll_stdout_chunk(&mut self) -> Vec<u8> {
        take_buffer(&self.stdout)
    }

    fn poll_stderr_chunk(&mut self) -> Vec<u8> {
        take_buffer(&self.stderr)
    }

    async fn wait(&mut self) -> ProcessResult<i32> {
        let code = match self.exit_code {
            Some(code) => code,
            None => {
                let status = self.child.wait().await.map_err(|source| ProcessError::Io {
                    program: self.program.clone(),
                    source,
                })?;
                let code = status.code().unwrap_or(-1);
                self.exit_code = Some(code);
                code
            }
        };
        // Readers finish once the pipes hit EOF, so everything the child wrote is buffered.
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        Ok(code)
    }
}

fn spawn_reader<R>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let mut guard = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard.extend_from_slice(&chunk[..read]);
                }
            }
        }
    })
}

fn take_buffer(buffer: &Mutex<Vec<u8>>) -> Vec<u8> {
    let mut guard = buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *guard)
}
