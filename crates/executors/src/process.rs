//! Agent subprocess lifecycle.
//!
//! Each spawn produces a record tracking status, output streams, pid and
//! activity. Processes are spawned into their own group so termination
//! reaches the whole tree, and exited records linger briefly so late
//! subscribers can still observe the final status.

use std::{
    sync::{Arc, Mutex as StdMutex, OnceLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{broadcast, mpsc, oneshot, watch},
    time::sleep,
};
use uuid::Uuid;
use workspace_utils::shell::resolve_executable_path;

use crate::command::CommandSpec;

/// How long a terminal record stays queryable before removal.
const PROCESS_RECORD_TTL: Duration = Duration::from_secs(5);

/// Wait between escalation steps of the termination ladder.
const DEFAULT_GRACE: Duration = Duration::from_secs(2);

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("process spawned without a pid")]
    NoPid,
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no such process: {0}")]
    NotFound(Uuid),
    #[error("stdin already closed for process {0}")]
    StdinClosed(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Busy,
    Terminating,
    Completed,
    Crashed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Completed | ProcessStatus::Crashed)
    }

    /// Valid moves: busy → terminating → {completed, crashed} and
    /// busy → {completed, crashed}. Terminal states are sticky.
    pub fn can_transition(self, next: ProcessStatus) -> bool {
        match (self, next) {
            (ProcessStatus::Busy, ProcessStatus::Terminating) => true,
            (ProcessStatus::Busy, ProcessStatus::Completed | ProcessStatus::Crashed) => true,
            (ProcessStatus::Terminating, ProcessStatus::Completed | ProcessStatus::Crashed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProcessOutput {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExit {
    pub exit_code: Option<i64>,
    pub signal: Option<i32>,
    pub finished_at: DateTime<Utc>,
}

enum ControlMsg {
    Terminate { reply: oneshot::Sender<bool> },
}

#[derive(Debug)]
pub struct ProcessRecord {
    pub id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    status_tx: watch::Sender<ProcessStatus>,
    output_tx: broadcast::Sender<ProcessOutput>,
    /// Every line in arrival order, interleaved across stdout and stderr.
    /// The broadcast channel only reaches subscribers that existed when a
    /// line arrived; this buffer is the complete record.
    collected: StdMutex<Vec<ProcessOutput>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    last_activity: StdMutex<DateTime<Utc>>,
    exit: OnceLock<ProcessExit>,
    control_tx: mpsc::Sender<ControlMsg>,
}

impl ProcessRecord {
    pub fn status(&self) -> ProcessStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<ProcessOutput> {
        self.output_tx.subscribe()
    }

    pub fn collected_output(&self) -> Vec<ProcessOutput> {
        self.collected.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn exit(&self) -> Option<&ProcessExit> {
        self.exit.get()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    fn transition(&self, next: ProcessStatus) -> bool {
        let mut moved = false;
        self.status_tx.send_modify(|status| {
            if status.can_transition(next) {
                *status = next;
                moved = true;
            }
        });
        moved
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub spawned: u64,
    pub active: usize,
    pub completed: u64,
    pub crashed: u64,
    pub avg_duration_ms: f64,
}

#[derive(Default)]
struct StatsInner {
    spawned: u64,
    completed: u64,
    crashed: u64,
    total_duration_ms: u64,
}

struct ManagerInner {
    processes: DashMap<Uuid, Arc<ProcessRecord>>,
    stats: StdMutex<StatsInner>,
    grace: Duration,
    record_ttl: Duration,
}

#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_GRACE, PROCESS_RECORD_TTL)
    }

    pub fn with_config(grace: Duration, record_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                processes: DashMap::new(),
                stats: StdMutex::new(StatsInner::default()),
                grace,
                record_ttl,
            }),
        }
    }

    pub async fn spawn(&self, spec: CommandSpec) -> Result<Arc<ProcessRecord>, ProcessError> {
        let program = resolve_executable_path(&spec.program)
            .await
            .ok_or_else(|| ProcessError::ExecutableNotFound(spec.program.clone()))?;

        let mut cmd = Command::new(program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.group_spawn()?;
        let pid = child.inner().id().ok_or(ProcessError::NoPid)?;

        let stdin = child.inner().stdin.take();
        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();

        let (status_tx, _) = watch::channel(ProcessStatus::Busy);
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(4);

        let record = Arc::new(ProcessRecord {
            id: Uuid::new_v4(),
            pid,
            started_at: Utc::now(),
            status_tx,
            output_tx,
            collected: StdMutex::new(Vec::new()),
            stdin: tokio::sync::Mutex::new(stdin),
            last_activity: StdMutex::new(Utc::now()),
            exit: OnceLock::new(),
            control_tx,
        });

        self.inner.processes.insert(record.id, record.clone());
        {
            let mut stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.spawned += 1;
        }

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(record.clone(), stdout, true));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(record.clone(), stderr, false));
        }

        tokio::spawn(monitor(
            self.inner.clone(),
            record.clone(),
            child,
            control_rx,
            spec.timeout,
            readers,
        ));

        Ok(record)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ProcessRecord>> {
        self.inner.processes.get(&id).map(|entry| entry.value().clone())
    }

    pub async fn write_stdin(&self, id: Uuid, data: &str) -> Result<(), ProcessError> {
        let record = self.get(id).ok_or(ProcessError::NotFound(id))?;
        let mut guard = record.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::StdinClosed(id))?;
        stdin.write_all(data.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn close_stdin(&self, id: Uuid) -> Result<(), ProcessError> {
        let record = self.get(id).ok_or(ProcessError::NotFound(id))?;
        record.stdin.lock().await.take();
        Ok(())
    }

    /// Graceful-then-forceful termination. Resolves to the final status:
    /// `Completed` if the process acknowledged the signal before the force
    /// kill, `Crashed` otherwise.
    pub async fn terminate(&self, id: Uuid) -> Result<ProcessStatus, ProcessError> {
        let record = self.get(id).ok_or(ProcessError::NotFound(id))?;
        if record.status().is_terminal() {
            return Ok(record.status());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if record.control_tx.send(ControlMsg::Terminate { reply: reply_tx }).await.is_err() {
            // monitor already finished
            return Ok(record.status());
        }
        let _ = reply_rx.await;
        Ok(self.wait_for_exit(id).await.map(|_| record.status())?)
    }

    pub async fn wait_for_exit(&self, id: Uuid) -> Result<ProcessExit, ProcessError> {
        let record = self.get(id).ok_or(ProcessError::NotFound(id))?;
        let mut status_rx = record.subscribe_status();
        while !status_rx.borrow().is_terminal() {
            if status_rx.changed().await.is_err() {
                break;
            }
        }
        record.exit().cloned().ok_or(ProcessError::NotFound(id))
    }

    pub fn stats(&self) -> ManagerStats {
        let stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
        let finished = stats.completed + stats.crashed;
        let active = self
            .inner
            .processes
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .count();
        ManagerStats {
            spawned: stats.spawned,
            active,
            completed: stats.completed,
            crashed: stats.crashed,
            avg_duration_ms: if finished == 0 {
                0.0
            } else {
                stats.total_duration_ms as f64 / finished as f64
            },
        }
    }
}

fn spawn_reader<R>(
    record: Arc<ProcessRecord>,
    stream: R,
    is_stdout: bool,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            record.touch();
            let msg = if is_stdout {
                ProcessOutput::Stdout(line)
            } else {
                ProcessOutput::Stderr(line)
            };
            record.collected.lock().unwrap_or_else(|e| e.into_inner()).push(msg.clone());
            let _ = record.output_tx.send(msg);
        }
    })
}

enum ExitOutcome {
    Natural(std::io::Result<std::process::ExitStatus>),
    Terminated { graceful: bool, status: Option<std::process::ExitStatus> },
}

async fn monitor(
    inner: Arc<ManagerInner>,
    record: Arc<ProcessRecord>,
    mut child: AsyncGroupChild,
    mut control_rx: mpsc::Receiver<ControlMsg>,
    timeout: Option<Duration>,
    readers: Vec<tokio::task::JoinHandle<()>>,
) {
    let timeout_sleep = async {
        match timeout {
            Some(t) => sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout_sleep);

    // A process that exits on its own cancels the pending timeout by
    // winning the select.
    let outcome = loop {
        tokio::select! {
            status = child.wait() => {
                break ExitOutcome::Natural(status);
            }
            _ = &mut timeout_sleep => {
                tracing::warn!(pid = record.pid, "process exceeded its timeout, terminating");
                record.transition(ProcessStatus::Terminating);
                let (graceful, status) = terminate_child(&mut child, inner.grace).await;
                break ExitOutcome::Terminated { graceful, status };
            }
            Some(msg) = control_rx.recv() => {
                let ControlMsg::Terminate { reply } = msg;
                record.transition(ProcessStatus::Terminating);
                let (graceful, status) = terminate_child(&mut child, inner.grace).await;
                let _ = reply.send(graceful);
                break ExitOutcome::Terminated { graceful, status };
            }
        }
    };

    let finished_at = Utc::now();
    let (final_status, exit) = match outcome {
        ExitOutcome::Natural(Ok(status)) => classify_exit(status, finished_at),
        ExitOutcome::Natural(Err(e)) => {
            tracing::error!(pid = record.pid, "waiting on process failed: {e}");
            (
                ProcessStatus::Crashed,
                ProcessExit { exit_code: None, signal: None, finished_at },
            )
        }
        ExitOutcome::Terminated { graceful, status } => {
            let exit = status
                .map(|s| classify_exit(s, finished_at).1)
                .unwrap_or(ProcessExit { exit_code: None, signal: None, finished_at });
            let final_status =
                if graceful { ProcessStatus::Completed } else { ProcessStatus::Crashed };
            (final_status, exit)
        }
    };

    // let the readers drain EOF so collected output is complete before the
    // terminal status becomes visible; a grandchild holding the pipe open
    // must not stall the state machine
    for reader in readers {
        if tokio::time::timeout(Duration::from_secs(2), reader).await.is_err() {
            tracing::warn!(pid = record.pid, "output reader still open after exit");
        }
    }

    // exit data must be readable by the time the terminal status is visible
    let _ = record.exit.set(exit);
    record.transition(final_status);

    {
        let mut stats = inner.stats.lock().unwrap_or_else(|e| e.into_inner());
        match final_status {
            ProcessStatus::Completed => stats.completed += 1,
            ProcessStatus::Crashed => stats.crashed += 1,
            _ => {}
        }
        let duration = (finished_at - record.started_at).num_milliseconds().max(0) as u64;
        stats.total_duration_ms += duration;
    }

    let id = record.id;
    let ttl = inner.record_ttl;
    tokio::spawn(async move {
        sleep(ttl).await;
        inner.processes.remove(&id);
    });
}

fn classify_exit(
    status: std::process::ExitStatus,
    finished_at: DateTime<Utc>,
) -> (ProcessStatus, ProcessExit) {
    let exit_code = status.code().map(i64::from);
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    let final_status = if status.success() { ProcessStatus::Completed } else { ProcessStatus::Crashed };
    (final_status, ProcessExit { exit_code, signal, finished_at })
}

/// Escalation ladder over the whole process group. Returns whether the
/// process acknowledged a polite signal before the force kill.
async fn terminate_child(
    child: &mut AsyncGroupChild,
    grace: Duration,
) -> (bool, Option<std::process::ExitStatus>) {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{Signal, killpg},
            unistd::{Pid, getpgid},
        };

        if let Some(pid) = child.inner().id()
            && let Ok(pgid) = getpgid(Some(Pid::from_raw(pid as i32)))
        {
            for sig in [Signal::SIGINT, Signal::SIGTERM] {
                if let Err(e) = killpg(pgid, sig) {
                    tracing::warn!("failed to send {sig:?} to process group {pgid}: {e}");
                }
                sleep(grace).await;
                if let Ok(Some(status)) = child.inner().try_wait() {
                    return (true, Some(status));
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
    let status = child.wait().await.ok();
    (false, status)
}
