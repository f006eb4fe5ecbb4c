//! Single-process task broker: a priority FIFO queue with dependency
//! gating, a concurrency cap, retries, and per-task agent subprocess
//! lifecycle. Subprocess errors never escape as panics or queue stalls;
//! every failure ends up as a result record.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use chrono::Utc;
use dashmap::DashMap;
use executors::{
    Coalescer, CommandSpec, ProcessManager, ProcessOutput, SessionUpdate,
    hybrid::parse_json_line,
};
use serde_json::json;
use services::services::events::{EventBus, names};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::task::{EngineMetrics, TaskResult, TaskSpec};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("task {0} was cancelled before completion")]
    Cancelled(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug)]
struct QueuedTask {
    spec: TaskSpec,
    attempt: u32,
    retry: bool,
    seq: u64,
}

struct RunningTask {
    process_id: Option<Uuid>,
    cancelled: bool,
}

#[derive(Default)]
struct Totals {
    completed: u64,
    failed: u64,
    total_duration_ms: u64,
}

struct EngineInner {
    queue: StdMutex<Vec<QueuedTask>>,
    running: DashMap<Uuid, RunningTask>,
    completed: DashMap<Uuid, TaskResult>,
    waiters: StdMutex<HashMap<Uuid, Vec<oneshot::Sender<TaskResult>>>>,
    /// At most one live task per worktree path.
    worktrees: DashMap<PathBuf, Uuid>,
    processes: ProcessManager,
    bus: EventBus,
    max_concurrent: usize,
    seq: AtomicU64,
    accepting: AtomicBool,
    totals: StdMutex<Totals>,
    started: Instant,
    dispatch_gate: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub fn new(bus: EventBus, max_concurrent: usize) -> Self {
        Self::with_process_manager(bus, max_concurrent, ProcessManager::new())
    }

    pub fn with_process_manager(
        bus: EventBus,
        max_concurrent: usize,
        processes: ProcessManager,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                queue: StdMutex::new(Vec::new()),
                running: DashMap::new(),
                completed: DashMap::new(),
                waiters: StdMutex::new(HashMap::new()),
                worktrees: DashMap::new(),
                processes,
                bus,
                max_concurrent: max_concurrent.max(1),
                seq: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
                totals: StdMutex::new(Totals::default()),
                started: Instant::now(),
                dispatch_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn submit(&self, spec: TaskSpec) -> Result<Uuid, EngineError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let id = spec.id;
        self.enqueue(QueuedTask {
            spec,
            attempt: 1,
            retry: false,
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
        });
        self.inner.bus.emit(&names::execution("created"), json!({"task_id": id}));
        self.spawn_dispatch();
        Ok(id)
    }

    fn enqueue(&self, task: QueuedTask) {
        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(task);
        // retries strictly dominate priority; otherwise FIFO within priority
        queue.sort_by_key(|t| (!t.retry, t.spec.priority, t.seq));
    }

    fn spawn_dispatch(&self) {
        let engine = self.clone();
        tokio::spawn(async move { engine.dispatch().await });
    }

    /// One dispatch pass, bounded by the queue snapshot size so tasks
    /// re-pushed for unmet dependencies cannot livelock the loop.
    async fn dispatch(&self) {
        let _gate = self.inner.dispatch_gate.lock().await;

        let mut budget = {
            let queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.len()
        };

        while budget > 0 {
            if self.inner.running.len() >= self.inner.max_concurrent {
                break;
            }
            let Some(task) = ({
                let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                if queue.is_empty() { None } else { Some(queue.remove(0)) }
            }) else {
                break;
            };
            budget -= 1;

            // a failed dependency fails the dependent immediately, before
            // any subprocess is spawned
            let failed_dep = task.spec.dependencies.iter().find(|dep| {
                self.inner.completed.get(dep).map(|r| !r.success).unwrap_or(false)
            });
            if let Some(failed_dep) = failed_dep {
                let now = Utc::now();
                self.record_terminal(
                    &task.spec,
                    TaskResult {
                        task_id: task.spec.id,
                        success: false,
                        exit_code: None,
                        output: format!("dependency failure: task {failed_dep} failed"),
                        metadata: json!({"dependency_failed": failed_dep.to_string()}),
                        attempts: task.attempt,
                        started_at: now,
                        finished_at: now,
                    },
                );
                continue;
            }

            let unmet = task
                .spec
                .dependencies
                .iter()
                .any(|dep| !self.inner.completed.contains_key(dep));
            if unmet || self.inner.worktrees.contains_key(&task.spec.work_dir) {
                // not runnable yet: back to the tail
                let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.push(task);
                continue;
            }

            self.inner.worktrees.insert(task.spec.work_dir.clone(), task.spec.id);
            self.inner.running.insert(
                task.spec.id,
                RunningTask { process_id: None, cancelled: false },
            );
            self.inner
                .bus
                .emit(&names::execution("started"), json!({"task_id": task.spec.id, "attempt": task.attempt}));

            let engine = self.clone();
            tokio::spawn(async move { engine.run_task(task).await });
        }
    }

    async fn run_task(&self, task: QueuedTask) {
        let started_at = Utc::now();
        let outcome = self.execute(&task).await;
        let cancelled = self
            .inner
            .running
            .get(&task.spec.id)
            .map(|r| r.cancelled)
            .unwrap_or(false);

        self.inner.running.remove(&task.spec.id);
        self.inner.worktrees.remove(&task.spec.work_dir);

        // retry policy: only the terminal outcome lands in the completed
        // map; a retry-eligible failure jumps back to the head of the queue
        if !outcome.success && !cancelled && task.attempt <= task.spec.config.max_retries {
            tracing::info!(
                "task {} failed (attempt {}), retrying at queue head",
                task.spec.id,
                task.attempt
            );
            self.inner
                .bus
                .emit(&names::execution("updated"), json!({"task_id": task.spec.id, "retry": task.attempt + 1}));
            self.enqueue(QueuedTask {
                spec: task.spec,
                attempt: task.attempt + 1,
                retry: true,
                seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            });
            self.spawn_dispatch();
            return;
        }

        let result = TaskResult {
            task_id: task.spec.id,
            success: outcome.success && !cancelled,
            exit_code: outcome.exit_code,
            output: outcome.output,
            metadata: outcome.metadata,
            attempts: task.attempt,
            started_at,
            finished_at: Utc::now(),
        };
        self.record_terminal(&task.spec, result);
        self.spawn_dispatch();
    }

    async fn execute(&self, task: &QueuedTask) -> ExecOutcome {
        let mut command = match CommandSpec::from_command_line(
            &task.spec.agent_command,
            &task.spec.work_dir,
        ) {
            Ok(command) => command.envs(task.spec.config.env.clone()),
            Err(e) => {
                return ExecOutcome::failure(format!("invalid agent command: {e}"));
            }
        };
        if let Some(timeout) = task.spec.config.timeout {
            command = command.timeout(timeout);
        }

        let record = match self.inner.processes.spawn(command).await {
            Ok(record) => record,
            Err(e) => return ExecOutcome::failure(format!("failed to spawn agent: {e}")),
        };

        if let Some(mut running) = self.inner.running.get_mut(&task.spec.id) {
            running.process_id = Some(record.id);
        }

        if !task.spec.prompt.is_empty() {
            let mut prompt = task.spec.prompt.clone();
            if !prompt.ends_with('\n') {
                prompt.push('\n');
            }
            if let Err(e) = self.inner.processes.write_stdin(record.id, &prompt).await {
                tracing::warn!("could not deliver prompt to {}: {e}", record.id);
            }
        }
        let _ = self.inner.processes.close_stdin(record.id).await;

        let exit = match self.inner.processes.wait_for_exit(record.id).await {
            Ok(exit) => exit,
            Err(e) => {
                return ExecOutcome::failure(format!("agent process vanished before exit: {e}"));
            }
        };

        // the collected buffer is complete once the exit is visible, in
        // arrival order across both streams
        let mut coalescer = Coalescer::new();
        let mut events = Vec::new();
        let mut output = String::new();
        for msg in record.collected_output() {
            match msg {
                ProcessOutput::Stdout(line) => {
                    // hybrid stream: JSON event lines feed the coalescer,
                    // everything else is terminal output
                    if let Some(value) = parse_json_line(&line)
                        && let Some(update) = SessionUpdate::from_value(value)
                    {
                        events.extend(coalescer.push(update));
                    }
                    output.push_str(&line);
                    output.push('\n');
                }
                ProcessOutput::Stderr(line) => {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
        }
        events.extend(coalescer.flush());

        ExecOutcome {
            success: exit.exit_code == Some(0),
            exit_code: exit.exit_code,
            output,
            metadata: json!({
                "process_id": record.id,
                "signal": exit.signal,
                "events": events,
            }),
        }
    }

    /// Record a terminal outcome exactly once, wake waiters, emit events.
    fn record_terminal(&self, spec: &TaskSpec, result: TaskResult) {
        let event = if result.success { "completed" } else { "failed" };
        let duration_ms =
            (result.finished_at - result.started_at).num_milliseconds().max(0) as u64;

        if self.inner.completed.insert(spec.id, result.clone()).is_some() {
            tracing::error!("task {} recorded a terminal result twice", spec.id);
        }

        {
            let mut totals = self.inner.totals.lock().unwrap_or_else(|e| e.into_inner());
            if result.success {
                totals.completed += 1;
            } else {
                totals.failed += 1;
            }
            totals.total_duration_ms += duration_ms;
        }

        let waiters = {
            let mut waiters = self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(&spec.id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        self.inner.bus.emit(
            &names::execution(event),
            json!({"task_id": spec.id, "exit_code": result.exit_code, "attempts": result.attempts}),
        );
        let bare_event = if result.success { "task_complete" } else { "task_failed" };
        self.inner.bus.emit(bare_event, json!({"task_id": spec.id}));
    }

    pub fn state(&self, id: Uuid) -> Result<TaskState, EngineError> {
        if let Some(result) = self.inner.completed.get(&id) {
            return Ok(if result.success { TaskState::Completed } else { TaskState::Failed });
        }
        if self.inner.running.contains_key(&id) {
            return Ok(TaskState::Running);
        }
        let queued = {
            let queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.iter().any(|t| t.spec.id == id)
        };
        if queued { Ok(TaskState::Queued) } else { Err(EngineError::NotFound(id)) }
    }

    pub fn result(&self, id: Uuid) -> Option<TaskResult> {
        self.inner.completed.get(&id).map(|r| r.clone())
    }

    /// Resolve immediately when the task is done, otherwise register a
    /// waiter for its terminal result.
    pub async fn await_result(&self, id: Uuid) -> Result<TaskResult, EngineError> {
        if let Some(result) = self.result(id) {
            return Ok(result);
        }
        // registration happens under the waiters lock so a concurrent
        // completion either sees the waiter or already wrote the result
        let rx = {
            let mut waiters = self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(result) = self.result(id) {
                return Ok(result);
            }
            self.state(id)?;
            let (tx, rx) = oneshot::channel();
            waiters.entry(id).or_default().push(tx);
            rx
        };
        rx.await.map_err(|_| EngineError::Cancelled(id))
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        // queued: drop from the queue and record a cancelled result
        let dropped = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            let before = queue.len();
            let mut spec = None;
            queue.retain(|t| {
                if t.spec.id == id {
                    spec = Some(t.spec.clone());
                    false
                } else {
                    true
                }
            });
            (queue.len() < before).then_some(spec).flatten()
        };
        if let Some(spec) = dropped {
            let now = Utc::now();
            self.record_terminal(
                &spec,
                TaskResult {
                    task_id: id,
                    success: false,
                    exit_code: None,
                    output: "cancelled before start".to_string(),
                    metadata: json!({"cancelled": true}),
                    attempts: 0,
                    started_at: now,
                    finished_at: now,
                },
            );
            self.inner.bus.emit(&names::execution("cancelled"), json!({"task_id": id}));
            return Ok(());
        }

        // already terminal: nothing left to cancel
        if self.inner.completed.contains_key(&id) {
            return Ok(());
        }

        // running: mark, then terminate the subprocess; the run loop turns
        // the exit into a cancelled (failed) result
        let process_id = {
            let mut running =
                self.inner.running.get_mut(&id).ok_or(EngineError::NotFound(id))?;
            running.cancelled = true;
            running.process_id
        };
        if let Some(process_id) = process_id {
            let _ = self.inner.processes.terminate(process_id).await;
        }
        self.inner.bus.emit(&names::execution("cancelled"), json!({"task_id": id}));
        Ok(())
    }

    /// Stop accepting work, wait for in-flight tasks, then fail whatever
    /// is still queued.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let running: Vec<Uuid> =
            self.inner.running.iter().map(|entry| *entry.key()).collect();
        for id in running {
            let _ = self.await_result(id).await;
        }

        let drained: Vec<QueuedTask> = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for task in drained {
            let now = Utc::now();
            self.record_terminal(
                &task.spec,
                TaskResult {
                    task_id: task.spec.id,
                    success: false,
                    exit_code: None,
                    output: "engine shut down before start".to_string(),
                    metadata: json!({"cancelled": true}),
                    attempts: 0,
                    started_at: now,
                    finished_at: now,
                },
            );
        }
    }

    /// Immediate shutdown: also terminates running tasks.
    pub async fn shutdown_now(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let running: Vec<Uuid> =
            self.inner.running.iter().map(|entry| *entry.key()).collect();
        for id in running {
            let _ = self.cancel(id).await;
            let _ = self.await_result(id).await;
        }
        self.shutdown().await;
    }

    pub fn metrics(&self) -> EngineMetrics {
        let totals = self.inner.totals.lock().unwrap_or_else(|e| e.into_inner());
        let finished = totals.completed + totals.failed;
        let queued = {
            let queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.len()
        };
        let running = self.inner.running.len();
        let process_stats = self.inner.processes.stats();
        let elapsed_min = self.inner.started.elapsed().as_secs_f64() / 60.0;

        EngineMetrics {
            max_concurrent: self.inner.max_concurrent,
            currently_running: running,
            available_slots: self.inner.max_concurrent.saturating_sub(running),
            queued,
            completed: totals.completed,
            failed: totals.failed,
            avg_duration_ms: if finished == 0 {
                0.0
            } else {
                totals.total_duration_ms as f64 / finished as f64
            },
            success_rate: if finished == 0 {
                0.0
            } else {
                totals.completed as f64 / finished as f64
            },
            throughput_per_min: if elapsed_min <= 0.0 {
                0.0
            } else {
                finished as f64 / elapsed_min
            },
            processes_spawned: process_stats.spawned,
            processes_active: process_stats.active,
        }
    }
}

struct ExecOutcome {
    success: bool,
    exit_code: Option<i64>,
    output: String,
    metadata: serde_json::Value,
}

impl ExecOutcome {
    fn failure(message: String) -> Self {
        Self { success: false, exit_code: None, output: message, metadata: json!({}) }
    }
}
