//! Asynchronous job runner.
//!
//! [`JobRunner::start`] spawns the child and returns at once. Two reader
//! threads feed bounded tail buffers; a supervisor thread polls the child with
//! `wait_timeout`, acts on cancel requests and the wall-clock deadline, and
//! publishes the terminal [`Job`] snapshot exactly once to every completion
//! subscriber.
//!
//! Cancel and timeout kill the job's whole process group. Output readers get
//! [`READER_GRACE`] to drain after the child is gone; a pipe still held open
//! past that is abandoned so the job can reach its terminal state.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::ids::JobId;
use crate::core::job::{FailureReason, Job, JobState, extract_task_id};
use crate::core::tail::TailBuffer;
use crate::error::{OrchestratorError, OrchestratorResult, RecordKind};
use crate::io::config::JobsConfig;
use crate::io::process::{
    SpawnedChild, exit_code, join_readers_until, kill_process_tree, spawn_line_reader, spawn_piped,
};

/// How long output readers may keep draining once the child has exited.
pub const READER_GRACE: Duration = Duration::from_secs(2);

/// A fully resolved invocation. No shell is involved: `command[0]` is executed
/// directly with `command[1..]` as its argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub command: Vec<String>,
    /// Complete child environment; the parent environment is not inherited.
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_output_lines: usize,
    pub poll_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        RunnerSettings::from(&JobsConfig::default())
    }
}

impl From<&JobsConfig> for RunnerSettings {
    fn from(cfg: &JobsConfig) -> Self {
        Self {
            max_output_lines: cfg.max_output_lines,
            poll_interval: cfg.poll_interval(),
        }
    }
}

struct JobEntry {
    id: JobId,
    command: Vec<String>,
    created_at: DateTime<Utc>,
    state: JobState,
    task_id: Option<String>,
    last_message: Option<Value>,
    stdout: TailBuffer<String>,
    stderr: TailBuffer<String>,
    events: TailBuffer<Value>,
    cancel_requested: bool,
    subscribers: Vec<Sender<Job>>,
}

impl JobEntry {
    fn new(id: JobId, command: Vec<String>, capacity: usize) -> Self {
        Self {
            id,
            command,
            created_at: Utc::now(),
            state: JobState::Queued,
            task_id: None,
            last_message: None,
            stdout: TailBuffer::new(capacity),
            stderr: TailBuffer::new(capacity),
            events: TailBuffer::new(capacity),
            cancel_requested: false,
            subscribers: Vec::new(),
        }
    }

    fn record_stdout(&mut self, line: String) {
        if self.state.is_terminal() {
            return;
        }
        if line.trim_start().starts_with('{')
            && let Ok(event @ Value::Object(_)) = serde_json::from_str::<Value>(&line)
        {
            if self.task_id.is_none() {
                self.task_id = extract_task_id(&event);
            }
            self.last_message = Some(event.clone());
            self.events.push(event);
        }
        self.stdout.push(line);
    }

    fn snapshot(&self, tail_n: usize) -> Job {
        Job {
            id: self.id.clone(),
            state: self.state.clone(),
            command: self.command.clone(),
            created_at: self.created_at,
            task_id: self.task_id.clone(),
            last_message: self.last_message.clone(),
            stdout_tail: self.stdout.tail(tail_n),
            stderr_tail: self.stderr.tail(tail_n),
            events_tail: self.events.tail(tail_n),
        }
    }
}

/// How the supervisor loop ended.
enum Exit {
    Exited(ExitStatus),
    Canceled(Option<ExitStatus>),
    TimedOut(Option<ExitStatus>, Duration),
    WaitError,
}

struct Inner {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    settings: RunnerSettings,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry(&self, id: &JobId, f: impl FnOnce(&mut JobEntry)) {
        if let Some(entry) = self.jobs().get_mut(id) {
            f(entry);
        }
    }

    fn cancel_requested(&self, id: &JobId) -> bool {
        self.jobs().get(id).is_some_and(|e| e.cancel_requested)
    }

    fn finish(&self, id: &JobId, exit: Exit) {
        let completed_at = Utc::now();
        let (job, subscribers) = {
            let mut jobs = self.jobs();
            let Some(entry) = jobs.get_mut(id) else {
                return;
            };
            let started_at = entry.state.started_at();
            let next = match exit {
                // A granted cancel wins even if the child exited on its own meanwhile.
                Exit::Exited(status) if entry.cancel_requested => JobState::Canceled {
                    started_at,
                    completed_at,
                    returncode: exit_code(&status),
                },
                Exit::Canceled(status) => JobState::Canceled {
                    started_at,
                    completed_at,
                    returncode: status.as_ref().and_then(exit_code),
                },
                Exit::TimedOut(status, timeout) => {
                    entry.last_message = Some(json!({
                        "type": "timed_out",
                        "timeout_secs": timeout.as_secs(),
                    }));
                    JobState::Failed {
                        started_at,
                        completed_at,
                        returncode: status.as_ref().and_then(exit_code),
                        reason: FailureReason::TimedOut,
                    }
                }
                Exit::Exited(status) if status.success() => JobState::Succeeded {
                    started_at: started_at.unwrap_or(completed_at),
                    completed_at,
                    returncode: exit_code(&status).unwrap_or(0),
                },
                Exit::Exited(status) => JobState::Failed {
                    started_at,
                    completed_at,
                    returncode: exit_code(&status),
                    reason: FailureReason::Exit,
                },
                Exit::WaitError => JobState::Failed {
                    started_at,
                    completed_at,
                    returncode: None,
                    reason: FailureReason::WaitError,
                },
            };
            if !entry.state.transition(next) {
                warn!(job_id = %id, status = entry.state.status().as_str(), "job already terminal");
            }
            (
                entry.snapshot(usize::MAX),
                std::mem::take(&mut entry.subscribers),
            )
        };

        info!(
            job_id = %id,
            status = job.status().as_str(),
            returncode = ?job.returncode(),
            "job finished"
        );
        for tx in subscribers {
            if tx.send(job.clone()).is_err() {
                debug!(job_id = %id, "completion subscriber went away");
            }
        }
    }
}

/// In-process registry of jobs. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                settings,
            }),
        }
    }

    /// Start `spec` under a freshly generated id.
    pub fn start(&self, spec: JobSpec) -> OrchestratorResult<JobId> {
        self.start_with_id(JobId::generate(), spec)
    }

    /// Start `spec` under a caller-chosen id (callers that need the id to build
    /// the command, e.g. for a per-job output path).
    ///
    /// Returns once the child is spawned; spawn failures are reported here and
    /// leave no job behind.
    #[instrument(skip_all, fields(job_id = %id))]
    pub fn start_with_id(&self, id: JobId, spec: JobSpec) -> OrchestratorResult<JobId> {
        let Some((program, args)) = spec.command.split_first() else {
            return Err(OrchestratorError::Spawn("empty command".to_string()));
        };
        {
            let mut jobs = self.inner.jobs();
            if jobs.contains_key(&id) {
                return Err(OrchestratorError::Conflict {
                    kind: RecordKind::Job,
                    id: id.to_string(),
                });
            }
            jobs.insert(
                id.clone(),
                JobEntry::new(
                    id.clone(),
                    spec.command.clone(),
                    self.inner.settings.max_output_lines,
                ),
            );
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.workdir)
            .env_clear()
            .envs(&spec.env);
        let SpawnedChild {
            mut child,
            stdout,
            stderr,
        } = match spawn_piped(cmd, spec.stdin.map(String::into_bytes)) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.inner.jobs().remove(&id);
                return Err(OrchestratorError::Spawn(format!("{program}: {err:#}")));
            }
        };

        let started_at = Utc::now();
        self.inner.with_entry(&id, |entry| {
            entry.state.transition(JobState::Running { started_at });
        });
        info!(program = %program, workdir = %spec.workdir.display(), "job started");

        let readers = match self.spawn_readers(&id, stdout, stderr) {
            Ok(readers) => readers,
            Err(err) => {
                warn!(err = %err, "failed to start output readers, killing child");
                kill_process_tree(&mut child);
                self.inner.finish(&id, Exit::WaitError);
                return Err(OrchestratorError::Internal(err));
            }
        };
        let inner = Arc::clone(&self.inner);
        let job_id = id.clone();
        let timeout = spec.timeout;
        if let Err(err) = thread::Builder::new()
            .name(format!("job-{id}"))
            .spawn(move || supervise(&inner, &job_id, child, readers, timeout))
        {
            // The child went down with the closure; nothing will reap it.
            warn!(err = %err, "failed to start supervisor thread");
            self.inner.finish(&id, Exit::WaitError);
            return Err(OrchestratorError::Internal(
                anyhow!(err).context("spawn supervisor thread"),
            ));
        }
        Ok(id)
    }

    fn spawn_readers(
        &self,
        id: &JobId,
        stdout: ChildStdout,
        stderr: ChildStderr,
    ) -> anyhow::Result<Vec<JoinHandle<anyhow::Result<u64>>>> {
        let out_inner = Arc::clone(&self.inner);
        let out_id = id.clone();
        let stdout_handle = spawn_line_reader(&format!("job-{id}-stdout"), stdout, move |line| {
            out_inner.with_entry(&out_id, |entry| entry.record_stdout(line));
        })?;

        let err_inner = Arc::clone(&self.inner);
        let err_id = id.clone();
        let stderr_handle = spawn_line_reader(&format!("job-{id}-stderr"), stderr, move |line| {
            err_inner.with_entry(&err_id, |entry| {
                if !entry.state.is_terminal() {
                    entry.stderr.push(line);
                }
            });
        })?;

        Ok(vec![stdout_handle, stderr_handle])
    }

    /// Current state plus the last `tail_n` captured lines of each stream.
    pub fn get_status(&self, id: &JobId, tail_n: usize) -> OrchestratorResult<Job> {
        self.inner
            .jobs()
            .get(id)
            .map(|entry| entry.snapshot(tail_n))
            .ok_or_else(|| OrchestratorError::not_found(RecordKind::Job, id.as_str()))
    }

    /// Request termination. Returns `true` only for the first request against a
    /// live job; unknown, terminal or already-canceling jobs return `false`.
    ///
    /// The job becomes `canceled` once the child has actually exited.
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut jobs = self.inner.jobs();
        match jobs.get_mut(id) {
            Some(entry) if !entry.state.is_terminal() && !entry.cancel_requested => {
                entry.cancel_requested = true;
                info!(job_id = %id, "cancel requested");
                true
            }
            _ => false,
        }
    }

    /// Channel that receives the terminal snapshot exactly once.
    ///
    /// Subscribing to a job that already finished delivers its snapshot immediately.
    pub fn subscribe(&self, id: &JobId) -> OrchestratorResult<Receiver<Job>> {
        let (tx, rx) = mpsc::channel();
        let mut jobs = self.inner.jobs();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found(RecordKind::Job, id.as_str()))?;
        if entry.state.is_terminal() {
            // The receiver is still held here, so this cannot fail.
            let _ = tx.send(entry.snapshot(usize::MAX));
        } else {
            entry.subscribers.push(tx);
        }
        Ok(rx)
    }

    /// Run `on_done` once, on a background thread, with the terminal snapshot.
    pub fn await_completion<F>(&self, id: &JobId, on_done: F) -> OrchestratorResult<()>
    where
        F: FnOnce(Job) + Send + 'static,
    {
        let rx = self.subscribe(id)?;
        thread::Builder::new()
            .name(format!("job-{id}-completion"))
            .spawn(move || {
                if let Ok(job) = rx.recv() {
                    on_done(job);
                }
            })
            .context("spawn completion thread")?;
        Ok(())
    }

    /// Block until the job is terminal (or `timeout` elapses).
    pub fn wait(&self, id: &JobId, timeout: Option<Duration>) -> OrchestratorResult<Job> {
        let rx = self.subscribe(id)?;
        let job = match timeout {
            Some(limit) => rx
                .recv_timeout(limit)
                .map_err(|_| anyhow!("timed out after {limit:?} waiting for job {id}"))?,
            None => rx
                .recv()
                .map_err(|_| anyhow!("job {id} completion channel closed"))?,
        };
        Ok(job)
    }
}

fn supervise(
    inner: &Inner,
    id: &JobId,
    mut child: Child,
    readers: Vec<JoinHandle<anyhow::Result<u64>>>,
    timeout: Option<Duration>,
) {
    let deadline = timeout.map(|t| Instant::now() + t);
    let poll = inner.settings.poll_interval;
    let exit = loop {
        if inner.cancel_requested(id) {
            debug!(job_id = %id, "killing canceled job");
            break Exit::Canceled(kill_process_tree(&mut child));
        }
        if let (Some(deadline), Some(limit)) = (deadline, timeout)
            && Instant::now() >= deadline
        {
            warn!(job_id = %id, timeout_secs = limit.as_secs(), "job timed out, killing");
            break Exit::TimedOut(kill_process_tree(&mut child), limit);
        }
        match child.wait_timeout(poll) {
            Ok(Some(status)) => break Exit::Exited(status),
            Ok(None) => {}
            Err(err) => {
                warn!(job_id = %id, err = %err, "wait for job failed");
                kill_process_tree(&mut child);
                break Exit::WaitError;
            }
        }
    };

    // Drain remaining output before publishing so the terminal snapshot is complete.
    for result in join_readers_until(readers, Instant::now() + READER_GRACE) {
        if let Err(err) = result {
            warn!(job_id = %id, err = %format!("{err:#}"), "output reader failed");
        }
    }
    inner.finish(id, exit);
}
