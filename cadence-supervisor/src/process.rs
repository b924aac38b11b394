//! Worker processes: spawning, line I/O and crash classification.
//!
//! A worker is an OS process with piped stdio. Instructions are written to
//! stdin one line at a time. Stdout and stderr are read line by line into a
//! single output stream that ends when both pipes close.

use async_trait::async_trait;
use cadence_core::constants::{
    HEARTBEAT_MARKER, PROGRESS_MARKER, STDERR_TAIL_LINES, TASK_DONE_MARKER, TASK_FAILED_MARKER,
    WORKER_OUTPUT_CHANNEL_CAPACITY,
};
use cadence_core::{
    AgentId, CadenceError, CadenceResult, ProgressReport, SystemError, TaskId, Timestamp,
};
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// How long to wait for the pipe readers to drain after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// TYPES
// ============================================================================

/// How to start one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub agent_id: AgentId,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl WorkerSpec {
    pub fn new(agent_id: impl Into<AgentId>, program: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> CadenceResult<()> {
        if self.agent_id.as_str().trim().is_empty() {
            return Err(CadenceError::invalid_input("agent_id", "must not be empty"));
        }
        if self.program.trim().is_empty() {
            return Err(CadenceError::invalid_input("program", "must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line a worker wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub agent_id: AgentId,
    pub stream: OutputStream,
    pub line: String,
    pub at: Timestamp,
}

/// A worker line interpreted against the marker protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    Heartbeat,
    Progress(ProgressReport),
    TaskDone { task_id: TaskId },
    TaskFailed { task_id: TaskId, reason: String },
    Raw(String),
}

impl WorkerLine {
    /// Interpret one stdout line. Malformed marker payloads come back as
    /// `Raw` so a worker bug cannot take down the reader.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim_end();
        if trimmed == HEARTBEAT_MARKER {
            return WorkerLine::Heartbeat;
        }
        if let Some(payload) = trimmed.strip_prefix(PROGRESS_MARKER) {
            return match serde_json::from_str::<ProgressReport>(payload) {
                Ok(report) => WorkerLine::Progress(report),
                Err(_) => WorkerLine::Raw(line.to_string()),
            };
        }
        if let Some(payload) = trimmed.strip_prefix(TASK_DONE_MARKER) {
            let task_id = payload.trim();
            if !task_id.is_empty() {
                return WorkerLine::TaskDone {
                    task_id: TaskId::from(task_id),
                };
            }
        }
        if let Some(payload) = trimmed.strip_prefix(TASK_FAILED_MARKER) {
            let payload = payload.trim();
            let (task_id, reason) = payload.split_once(char::is_whitespace).unwrap_or((payload, ""));
            if !task_id.is_empty() {
                return WorkerLine::TaskFailed {
                    task_id: TaskId::from(task_id),
                    reason: reason.trim().to_string(),
                };
            }
        }
        WorkerLine::Raw(line.to_string())
    }

    /// Markers prove the worker is alive; free text does not.
    pub fn is_liveness_signal(&self) -> bool {
        !matches!(self, WorkerLine::Raw(_))
    }
}

/// Why a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrashKind {
    CleanExit,
    NonZeroExit(i32),
    Signalled,
    OutOfMemory,
    Panicked,
}

impl CrashKind {
    pub fn is_clean(&self) -> bool {
        matches!(self, CrashKind::CleanExit)
    }
}

/// Classify an exit from its code and the tail of stderr.
///
/// Exit 0 is always clean. Otherwise out-of-memory (code 137 or an "out of
/// memory" message) wins over a panic message, which wins over the bare code.
pub fn classify_exit(code: Option<i32>, stderr_tail: &[String]) -> CrashKind {
    if code == Some(0) {
        return CrashKind::CleanExit;
    }
    let mentions = |needle: &str| {
        stderr_tail
            .iter()
            .any(|line| line.to_ascii_lowercase().contains(needle))
    };
    if code == Some(137) || mentions("out of memory") {
        CrashKind::OutOfMemory
    } else if mentions("panicked at") {
        CrashKind::Panicked
    } else {
        match code {
            Some(code) => CrashKind::NonZeroExit(code),
            None => CrashKind::Signalled,
        }
    }
}

/// Exit code, classification and the last stderr lines of a finished worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub crash: CrashKind,
    pub stderr_tail: Vec<String>,
    pub exited_at: Timestamp,
}

impl ExitInfo {
    pub fn new(code: Option<i32>, stderr_tail: Vec<String>) -> Self {
        Self {
            crash: classify_exit(code, &stderr_tail),
            code,
            stderr_tail,
            exited_at: Utc::now(),
        }
    }
}

pub type WorkerOutputStream = BoxStream<'static, WorkerOutput>;

// ============================================================================
// SEAMS
// ============================================================================

/// A running worker instance.
#[async_trait]
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    async fn send_line(&mut self, line: &str) -> CadenceResult<()>;

    /// The output stream of this instance. Yields `Some` once.
    fn take_output(&mut self) -> Option<WorkerOutputStream>;

    /// `Some` once the process has exited.
    async fn try_exit(&mut self) -> CadenceResult<Option<ExitInfo>>;

    async fn wait(&mut self) -> CadenceResult<ExitInfo>;

    /// Force the process down and collect its exit.
    async fn kill(&mut self) -> CadenceResult<ExitInfo>;
}

/// Starts worker instances. Each call yields a fresh instance.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> CadenceResult<Box<dyn WorkerHandle>>;
}

/// Launches real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> CadenceResult<Box<dyn WorkerHandle>> {
        Ok(Box::new(WorkerProcess::spawn(spec)?))
    }
}

// ============================================================================
// OS PROCESS
// ============================================================================

pub struct WorkerProcess {
    agent_id: AgentId,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Option<mpsc::Receiver<WorkerOutput>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    readers: Vec<JoinHandle<()>>,
    exit: Option<ExitInfo>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("agent_id", &self.agent_id)
            .field("pid", &self.child.id())
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    /// Spawn the process and start its pipe readers. The child is killed if
    /// this value is dropped.
    pub fn spawn(spec: &WorkerSpec) -> CadenceResult<Self> {
        spec.validate()?;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| SystemError::ProcessSpawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(WORKER_OUTPUT_CHANNEL_CAPACITY);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                spec.agent_id.clone(),
                OutputStream::Stdout,
                stdout,
                tx.clone(),
                None,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                spec.agent_id.clone(),
                OutputStream::Stderr,
                stderr,
                tx,
                Some(stderr_tail.clone()),
            ));
        }

        tracing::info!(agent_id = %spec.agent_id, program = %spec.program, pid = ?child.id(), "worker spawned");
        Ok(Self {
            agent_id: spec.agent_id.clone(),
            stdin: child.stdin.take(),
            child,
            output: Some(rx),
            stderr_tail,
            readers,
            exit: None,
        })
    }

    async fn finish(&mut self, status: ExitStatus) -> ExitInfo {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::debug!(agent_id = %self.agent_id, "pipe reader still open after exit");
            }
        }
        let tail = self
            .stderr_tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        let exit = ExitInfo::new(status.code(), tail);
        tracing::info!(agent_id = %self.agent_id, code = ?exit.code, crash = ?exit.crash, "worker exited");
        self.exit = Some(exit.clone());
        exit
    }

    fn io_error(&self, reason: impl ToString) -> CadenceError {
        SystemError::ProcessIo {
            agent_id: self.agent_id.to_string(),
            reason: reason.to_string(),
        }
        .into()
    }
}

fn spawn_reader<R>(
    agent_id: AgentId,
    stream: OutputStream,
    pipe: R,
    tx: mpsc::Sender<WorkerOutput>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        let mut forwarding = true;
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tail) = &tail {
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
            }
            // Keep draining after the consumer goes away so the child never
            // blocks on a full pipe.
            if forwarding {
                let output = WorkerOutput {
                    agent_id: agent_id.clone(),
                    stream,
                    line,
                    at: Utc::now(),
                };
                forwarding = tx.send(output).await.is_ok();
            }
        }
    })
}

#[async_trait]
impl WorkerHandle for WorkerProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn send_line(&mut self, line: &str) -> CadenceResult<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.io_error("stdin closed"));
        };
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        let written = match stdin.write_all(framed.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| self.io_error(e))
    }

    fn take_output(&mut self) -> Option<WorkerOutputStream> {
        self.output
            .take()
            .map(|rx| ReceiverStream::new(rx).boxed())
    }

    async fn try_exit(&mut self) -> CadenceResult<Option<ExitInfo>> {
        if let Some(exit) = &self.exit {
            return Ok(Some(exit.clone()));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(self.finish(status).await)),
            Ok(None) => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn wait(&mut self) -> CadenceResult<ExitInfo> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        self.stdin.take();
        let status = self.child.wait().await.map_err(|e| self.io_error(e))?;
        Ok(self.finish(status).await)
    }

    async fn kill(&mut self) -> CadenceResult<ExitInfo> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        self.stdin.take();
        if let Err(e) = self.child.kill().await {
            tracing::warn!(agent_id = %self.agent_id, error = %e, "failed to kill worker");
        }
        let status = self.child.wait().await.map_err(|e| self.io_error(e))?;
        Ok(self.finish(status).await)
    }
}
