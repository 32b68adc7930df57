//! Process supervisor for media-relay
//!
//! Owns the registries of running encoder processes and guarantees that every
//! spawned process is reaped and removed from its registry exactly once,
//! whether it exits on its own, fails, is cancelled by a disconnecting client,
//! or is killed at shutdown.

use crate::config::Config;
use crate::encode::EncoderArgs;
use crate::housekeeping::TempClaims;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Identifier of one supervised encoder invocation
pub type ProcessId = Uuid;

/// Error type for spawning encoder processes
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Encoder binary could not be found
    #[error("Encoder binary not found: {0}")]
    NotFound(String),

    /// The OS refused to start the process
    #[error("Failed to spawn encoder: {0}")]
    Io(#[from] std::io::Error),
}

/// What a supervised process is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// On-demand transcode streamed to a client; counts toward admission
    Transcode,
    /// Lossless cache write
    Cache,
    /// Video thumbnail stage
    Thumbnail,
    /// Cover art extraction
    Cover,
}

impl ProcessKind {
    fn is_background(self) -> bool {
        !matches!(self, ProcessKind::Transcode)
    }
}

/// Terminal result of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Process exited; `None` when it was ended by a signal
    Exited(Option<i32>),
    /// Waiting on the process failed
    Errored(String),
}

impl ProcessOutcome {
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessOutcome::Exited(code) => *code,
            ProcessOutcome::Errored(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

const RUNNING: u8 = 0;
const TERMINATING: u8 = 1;
const KILLED: u8 = 2;
const FINISHED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillRequest {
    Terminate,
    Kill,
}

/// Kill switch shared between the registry, process handles and the waiter
/// task that owns the child.
#[derive(Debug)]
pub struct ProcessControl {
    state: AtomicU8,
    requests: mpsc::UnboundedSender<KillRequest>,
}

impl ProcessControl {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<KillRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: AtomicU8::new(RUNNING),
                requests: tx,
            }),
            rx,
        )
    }

    /// Ask the process to stop.
    ///
    /// Graceful mode sends SIGTERM and escalates to SIGKILL after the grace
    /// window; force mode kills immediately. Returns false when the request
    /// was a no-op because the process is already being stopped that way or
    /// has finished, so repeated calls never schedule a second escalation.
    pub fn cleanup(&self, force: bool) -> bool {
        if force {
            let prev = self.state.fetch_max(KILLED, Ordering::SeqCst);
            if prev >= KILLED {
                return false;
            }
            let _ = self.requests.send(KillRequest::Kill);
            true
        } else {
            if self
                .state
                .compare_exchange(RUNNING, TERMINATING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return false;
            }
            let _ = self.requests.send(KillRequest::Terminate);
            true
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FINISHED
    }

    fn mark_finished(&self) {
        self.state.store(FINISHED, Ordering::SeqCst);
    }
}

/// Registry record for one in-flight encoder invocation
#[derive(Debug, Clone)]
pub struct RunningProcessEntry {
    pub id: ProcessId,
    pub kind: ProcessKind,
    /// Owning account, `None` for anonymous requests
    pub owner: Option<String>,
    /// OS pid, known once the spawn is confirmed
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub started_at_unix_ms: i64,
    control: Arc<ProcessControl>,
}

impl RunningProcessEntry {
    pub fn confirmed(&self) -> bool {
        self.pid.is_some()
    }
}

/// Serializable view of a registry entry
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessSnapshot {
    pub id: String,
    pub kind: ProcessKind,
    pub owner: Option<String>,
    pub pid: Option<u32>,
    pub started_at_unix_ms: i64,
    pub age_ms: u64,
}

/// Process-keyed registry, the single source of truth for concurrency
/// accounting.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Arc<Mutex<HashMap<ProcessId, RunningProcessEntry>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, RunningProcessEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an unconfirmed entry that no process backs, holding capacity
    /// until released.
    #[cfg(test)]
    pub(crate) fn reserve(&self, kind: ProcessKind, owner: Option<String>) -> (ProcessId, Arc<ProcessControl>) {
        let (control, _rx) = ProcessControl::new();
        let id = self.insert(kind, owner, control.clone());
        (id, control)
    }

    fn insert(&self, kind: ProcessKind, owner: Option<String>, control: Arc<ProcessControl>) -> ProcessId {
        let id = Uuid::new_v4();
        let entry = RunningProcessEntry {
            id,
            kind,
            owner,
            pid: None,
            started_at: Instant::now(),
            started_at_unix_ms: unix_timestamp_ms(),
            control,
        };
        self.lock().insert(id, entry);
        id
    }

    fn confirm(&self, id: ProcessId, pid: Option<u32>) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.pid = pid;
        }
    }

    /// Remove an entry. Every exit path funnels through here.
    pub fn release(&self, id: ProcessId) -> Option<RunningProcessEntry> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of entries owned by `owner` (`None` counts anonymous entries)
    pub fn count_owner(&self, owner: Option<&str>) -> usize {
        self.lock()
            .values()
            .filter(|e| e.owner.as_deref() == owner)
            .count()
    }

    pub fn get(&self, id: ProcessId) -> Option<RunningProcessEntry> {
        self.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let mut list: Vec<ProcessSnapshot> = self
            .lock()
            .values()
            .map(|e| ProcessSnapshot {
                id: e.id.to_string(),
                kind: e.kind,
                owner: e.owner.clone(),
                pid: e.pid,
                started_at_unix_ms: e.started_at_unix_ms,
                age_ms: e.started_at.elapsed().as_millis() as u64,
            })
            .collect();
        list.sort_by_key(|s| s.started_at_unix_ms);
        list
    }

    fn controls(&self) -> Vec<Arc<ProcessControl>> {
        self.lock().values().map(|e| e.control.clone()).collect()
    }
}

/// Everything needed to start one encoder process
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: EncoderArgs,
    pub kind: ProcessKind,
    pub owner: Option<String>,
    /// Pipe stdout back to the caller instead of discarding it
    pub capture_stdout: bool,
    /// Forward stderr lines to debug logs
    pub log_stderr: bool,
    /// SIGTERM to SIGKILL escalation window
    pub grace: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, kind: ProcessKind, args: EncoderArgs) -> Self {
        Self {
            program: program.into(),
            args,
            kind,
            owner: None,
            capture_stdout: false,
            log_stderr: false,
            grace: Duration::from_millis(5000),
        }
    }

    /// Invocation of the configured encoder with the configured grace window
    pub fn from_config(cfg: &Config, kind: ProcessKind, args: EncoderArgs) -> Self {
        let mut inv = Self::new(cfg.encoder.program(), kind, args);
        inv.log_stderr = cfg.encoder.debug;
        inv.grace = Duration::from_millis(cfg.encoder.cleanup_grace_ms);
        inv
    }

    pub fn owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Cloneable handle used to stop a supervised process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: ProcessId,
    pub pid: Option<u32>,
    control: Arc<ProcessControl>,
}

impl ProcessHandle {
    /// See [`ProcessControl::cleanup`]
    pub fn cleanup(&self, force: bool) -> bool {
        self.control.cleanup(force)
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }
}

/// A freshly spawned process: its stdout (when captured) and its exit
pub struct SupervisedProcess {
    handle: ProcessHandle,
    stdout: Option<ChildStdout>,
    exit: oneshot::Receiver<ProcessOutcome>,
}

impl SupervisedProcess {
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait for the terminal transition
    pub async fn wait(self) -> ProcessOutcome {
        drop(self.stdout);
        self.exit
            .await
            .unwrap_or_else(|_| ProcessOutcome::Errored("supervisor task ended".to_string()))
    }
}

/// Long-lived owner of the transcode and background registries
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    transcodes: ProcessTable,
    background: ProcessTable,
    temps: TempClaims,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of client-facing transcodes (admission counts these)
    pub fn transcodes(&self) -> &ProcessTable {
        &self.transcodes
    }

    /// Registry of cache, thumbnail and cover processes
    pub fn background(&self) -> &ProcessTable {
        &self.background
    }

    /// Temp files currently owned by an in-flight cache or thumbnail write
    pub fn temps(&self) -> &TempClaims {
        &self.temps
    }

    fn table_for(&self, kind: ProcessKind) -> &ProcessTable {
        if kind.is_background() {
            &self.background
        } else {
            &self.transcodes
        }
    }

    /// Start an encoder process under supervision.
    ///
    /// The registry entry is inserted before the OS spawn so concurrent
    /// admissions see it; if the spawn never gets confirmed the entry is
    /// released again before returning the error.
    pub fn spawn(&self, inv: Invocation) -> Result<SupervisedProcess, SpawnError> {
        let table = self.table_for(inv.kind).clone();
        let (control, requests) = ProcessControl::new();
        let id = table.insert(inv.kind, inv.owner.clone(), control.clone());

        let mut cmd = Command::new(&inv.program);
        cmd.args(inv.args.iter())
            .stdin(Stdio::null())
            .stdout(if inv.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if inv.log_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                table.release(id);
                control.mark_finished();
                debug!(program = %inv.program, kind = ?inv.kind, error = %e, "Encoder spawn failed");
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    SpawnError::NotFound(inv.program.clone())
                } else {
                    SpawnError::Io(e)
                });
            }
        };

        let pid = child.id();
        table.confirm(id, pid);
        debug!(pid = ?pid, kind = ?inv.kind, owner = ?inv.owner, "Encoder process started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "media_relay::ffmpeg", pid = ?pid, "{}", line);
                }
            });
        }

        let stdout = child.stdout.take();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(watch_process(
            child,
            id,
            table,
            control.clone(),
            requests,
            inv.grace,
            exit_tx,
        ));

        Ok(SupervisedProcess {
            handle: ProcessHandle { id, pid, control },
            stdout,
            exit: exit_rx,
        })
    }

    /// Spawn and wait for the process to finish
    pub async fn run(&self, inv: Invocation) -> Result<ProcessOutcome, SpawnError> {
        Ok(self.spawn(inv)?.wait().await)
    }

    /// Force-kill every tracked process, main and background alike
    pub fn unload(&self) -> usize {
        let mut killed = 0;
        for control in self
            .transcodes
            .controls()
            .into_iter()
            .chain(self.background.controls())
        {
            if control.cleanup(true) {
                killed += 1;
            }
        }
        debug!(killed, "Unload requested kill of tracked processes");
        killed
    }

    /// Wait until both registries drain, up to `timeout`
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !(self.transcodes.is_empty() && self.background.is_empty()) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

/// Owns the child until its terminal transition, serving kill requests and
/// the SIGKILL escalation timer, then releases the registry entry.
async fn watch_process(
    mut child: Child,
    id: ProcessId,
    table: ProcessTable,
    control: Arc<ProcessControl>,
    mut requests: mpsc::UnboundedReceiver<KillRequest>,
    grace: Duration,
    exit_tx: oneshot::Sender<ProcessOutcome>,
) {
    let pid = child.id();
    let mut escalate_at: Option<tokio::time::Instant> = None;

    let outcome = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ProcessOutcome::Exited(status.code()),
                    Err(e) => ProcessOutcome::Errored(e.to_string()),
                };
            }
            Some(request) = requests.recv() => match request {
                KillRequest::Terminate => {
                    send_terminate(&mut child);
                    if escalate_at.is_none() {
                        escalate_at = Some(tokio::time::Instant::now() + grace);
                    }
                }
                KillRequest::Kill => {
                    escalate_at = None;
                    if let Err(e) = child.start_kill() {
                        debug!(pid = ?pid, error = %e, "SIGKILL failed");
                    }
                }
            },
            _ = tokio::time::sleep_until(escalate_at.unwrap_or_else(tokio::time::Instant::now)), if escalate_at.is_some() => {
                escalate_at = None;
                match child.start_kill() {
                    Ok(()) => debug!(pid = ?pid, "Force killed after grace period"),
                    Err(e) => debug!(pid = ?pid, error = %e, "SIGKILL failed"),
                }
            }
        }
    };

    // Dropping the pending escalation here is what clears the timer.
    drop(child.stdin.take());
    drop(child.stdout.take());
    drop(child.stderr.take());
    control.mark_finished();
    table.release(id);

    debug!(pid = ?pid, outcome = ?outcome, "Encoder process finished");
    let _ = exit_tx.send(outcome);
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Terminate failed");
    }
}

/// Get current timestamp in milliseconds
fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
