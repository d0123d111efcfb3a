//! Process service: runs shell commands on behalf of clients.
//!
//! Started processes get an agent-local pid. Their output is kept in a log
//! and published line by line as `process_stdout` / `process_stderr`
//! events; `process_started` and `process_died` bracket the lifetime.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use exec_protocol::{
    Event, EventBody, EventError, EventTypes, Methods, Periodical, RpcError, RpcErrorCode,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{CallContext, EventPublisher, ExecutionMode, Handler, HandlerError, parse_params};

/// Error code for calls naming a pid the agent does not know.
pub const NO_SUCH_PROCESS: i32 = -32100;

const DEFAULT_LOG_LIMIT: usize = 50;
const DEFAULT_MAX_LOG_LINES: usize = 10_000;
const DEFAULT_MAX_EXITED: usize = 100;
/// How long to wait for output readers after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("No process with id {0}")]
    NoSuchProcess(u64),
    #[error("Command line must not be empty")]
    EmptyCommand,
    #[error("Failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<ProcessError> for HandlerError {
    fn from(e: ProcessError) -> Self {
        match &e {
            ProcessError::NoSuchProcess(_) => Self::Rpc(RpcError::new(
                RpcErrorCode::Custom(NO_SUCH_PROCESS),
                e.to_string(),
            )),
            ProcessError::EmptyCommand => Self::Rpc(RpcError::invalid_params(e.to_string())),
            ProcessError::Spawn(_) => Self::Internal(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    Stdout,
    Stderr,
}

/// One line of process output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub kind: LogKind,
    pub time: DateTime<Utc>,
    pub text: String,
}

/// Public view of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDescriptor {
    pub pid: u64,
    pub name: String,
    pub command_line: String,
    #[serde(rename = "type")]
    pub process_type: String,
    pub alive: bool,
    pub native_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

struct ManagedProcess {
    pid: u64,
    name: String,
    command_line: String,
    process_type: String,
    native_pid: Option<u32>,
    state: watch::Sender<ProcessState>,
    logs: RwLock<VecDeque<LogLine>>,
    kill: Notify,
}

impl ManagedProcess {
    fn descriptor(&self) -> ProcessDescriptor {
        let state = *self.state.borrow();
        ProcessDescriptor {
            pid: self.pid,
            name: self.name.clone(),
            command_line: self.command_line.clone(),
            process_type: self.process_type.clone(),
            alive: state == ProcessState::Running,
            native_pid: self.native_pid,
            exit_code: match state {
                ProcessState::Exited(code) => code,
                ProcessState::Running => None,
            },
        }
    }

    fn is_alive(&self) -> bool {
        *self.state.borrow() == ProcessState::Running
    }

    /// Append a line, evicting the oldest once `max_lines` are held.
    fn record(&self, line: LogLine, max_lines: usize) {
        let mut logs = self.logs.write();
        while logs.len() >= max_lines.max(1) {
            logs.pop_front();
        }
        logs.push_back(line);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event bodies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessStatusBody {
    #[serde(flatten)]
    base: EventBody,
    pid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_line: Option<String>,
    native_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<Option<i32>>,
}

impl Periodical for ProcessStatusBody {
    fn set_time(&mut self, time: DateTime<Utc>) {
        self.base.set_time(time);
    }
}

#[derive(Serialize)]
struct ProcessOutputBody {
    #[serde(flatten)]
    base: EventBody,
    pid: u64,
    text: String,
}

impl Periodical for ProcessOutputBody {
    fn set_time(&mut self, time: DateTime<Utc>) {
        self.base.set_time(time);
    }
}

fn publish(publisher: &EventPublisher, event: Result<Event, EventError>) {
    match event {
        Ok(event) => publisher(event),
        Err(e) => warn!("Dropping malformed process event: {e}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Bounds on what the registry retains.
#[derive(Debug, Clone, Copy)]
pub struct RetentionLimits {
    /// Output lines kept per process; older lines are evicted first.
    pub max_log_lines: usize,
    /// Exited processes kept for inspection; the oldest pids go first.
    pub max_exited: usize,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            max_exited: DEFAULT_MAX_EXITED,
        }
    }
}

/// Owns every process started through the agent.
pub struct ProcessRegistry {
    next_pid: AtomicU64,
    processes: RwLock<HashMap<u64, Arc<ManagedProcess>>>,
    publisher: EventPublisher,
    limits: RetentionLimits,
}

impl ProcessRegistry {
    pub fn new(publisher: EventPublisher) -> Self {
        Self::with_limits(publisher, RetentionLimits::default())
    }

    pub fn with_limits(publisher: EventPublisher, limits: RetentionLimits) -> Self {
        Self {
            next_pid: AtomicU64::new(1),
            processes: RwLock::new(HashMap::new()),
            publisher,
            limits,
        }
    }

    /// Spawn `command_line` through `sh -c` and start supervising it.
    pub fn start(
        &self,
        name: &str,
        command_line: &str,
        process_type: &str,
    ) -> Result<ProcessDescriptor, ProcessError> {
        if command_line.trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(ProcessState::Running);
        let process = Arc::new(ManagedProcess {
            pid,
            name: name.to_string(),
            command_line: command_line.to_string(),
            process_type: process_type.to_string(),
            native_pid: child.id(),
            state,
            logs: RwLock::new(VecDeque::new()),
            kill: Notify::new(),
        });
        {
            let mut processes = self.processes.write();
            prune_exited(&mut processes, self.limits.max_exited);
            processes.insert(pid, process.clone());
        }

        info!(pid, native_pid = ?process.native_pid, "Process started: {command_line}");
        publish(
            &self.publisher,
            Event::now(
                EventTypes::PROCESS_STARTED,
                ProcessStatusBody {
                    base: EventBody::default(),
                    pid,
                    name: Some(process.name.clone()),
                    command_line: Some(process.command_line.clone()),
                    native_pid: process.native_pid,
                    exit_code: None,
                },
            ),
        );

        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|out| {
                tokio::spawn(pump_output(
                    process.clone(),
                    LogKind::Stdout,
                    out,
                    self.limits.max_log_lines,
                    self.publisher.clone(),
                ))
            }),
            child.stderr.take().map(|err| {
                tokio::spawn(pump_output(
                    process.clone(),
                    LogKind::Stderr,
                    err,
                    self.limits.max_log_lines,
                    self.publisher.clone(),
                ))
            }),
        ]
        .into_iter()
        .flatten()
        .collect();

        let publisher = self.publisher.clone();
        let supervised = process.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = supervised.kill.notified() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    debug!(pid, "Killing process");
                    if let Err(e) = child.start_kill() {
                        warn!(pid, "Failed to kill process: {e}");
                    }
                    child.wait().await
                }
            };

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, "Failed to reap process: {e}");
                    None
                }
            };
            supervised.state.send_replace(ProcessState::Exited(exit_code));

            // The died event follows the last line of output.
            for mut reader in readers {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                    reader.abort();
                }
            }

            info!(pid, ?exit_code, "Process exited");
            publish(
                &publisher,
                Event::now(
                    EventTypes::PROCESS_DIED,
                    ProcessStatusBody {
                        base: EventBody::default(),
                        pid,
                        name: None,
                        command_line: None,
                        native_pid: supervised.native_pid,
                        exit_code: Some(exit_code),
                    },
                ),
            );
        });

        Ok(process.descriptor())
    }

    /// Ask a running process to stop. Killing a dead process is a no-op.
    pub fn kill(&self, pid: u64) -> Result<(), ProcessError> {
        let process = self.find(pid)?;
        if process.is_alive() {
            process.kill.notify_one();
        }
        Ok(())
    }

    pub fn get(&self, pid: u64) -> Result<ProcessDescriptor, ProcessError> {
        Ok(self.find(pid)?.descriptor())
    }

    /// Processes ordered by pid; dead ones only when `all` is set.
    pub fn list(&self, all: bool) -> Vec<ProcessDescriptor> {
        let mut list: Vec<ProcessDescriptor> = self
            .processes
            .read()
            .values()
            .filter(|p| all || p.is_alive())
            .map(|p| p.descriptor())
            .collect();
        list.sort_by_key(|p| p.pid);
        list
    }

    pub fn logs(&self, pid: u64, skip: usize, limit: usize) -> Result<Vec<LogLine>, ProcessError> {
        let process = self.find(pid)?;
        let logs = process.logs.read();
        Ok(logs.iter().skip(skip).take(limit).cloned().collect())
    }

    /// Resolve once the process has exited, yielding its exit code.
    pub async fn wait_exit(&self, pid: u64) -> Result<Option<i32>, ProcessError> {
        let mut rx = self.find(pid)?.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, ProcessState::Exited(_)))
            .await
            .map(|s| *s);
        match state {
            Ok(ProcessState::Exited(code)) => Ok(code),
            _ => Err(ProcessError::NoSuchProcess(pid)),
        }
    }

    /// Forget exited processes beyond the retention limit.
    pub fn prune(&self) -> usize {
        prune_exited(&mut self.processes.write(), self.limits.max_exited)
    }

    /// Kill every process that is still running.
    pub fn shutdown(&self) {
        let processes = self.processes.read();
        let mut killed = 0;
        for process in processes.values().filter(|p| p.is_alive()) {
            process.kill.notify_one();
            killed += 1;
        }
        info!("Process registry shutdown: {killed} running processes killed");
    }

    fn find(&self, pid: u64) -> Result<Arc<ManagedProcess>, ProcessError> {
        self.processes
            .read()
            .get(&pid)
            .cloned()
            .ok_or(ProcessError::NoSuchProcess(pid))
    }
}

/// Drop the oldest exited processes so at most `keep` remain.
fn prune_exited(processes: &mut HashMap<u64, Arc<ManagedProcess>>, keep: usize) -> usize {
    let mut exited: Vec<u64> = processes
        .values()
        .filter(|p| !p.is_alive())
        .map(|p| p.pid)
        .collect();
    if exited.len() <= keep {
        return 0;
    }
    exited.sort_unstable();
    let excess = exited.len() - keep;
    for pid in &exited[..excess] {
        processes.remove(pid);
    }
    debug!(removed = excess, "Pruned exited processes");
    excess
}

async fn pump_output<R: AsyncRead + Unpin>(
    process: Arc<ManagedProcess>,
    kind: LogKind,
    reader: R,
    max_lines: usize,
    publisher: EventPublisher,
) {
    let event_type = match kind {
        LogKind::Stdout => EventTypes::PROCESS_STDOUT,
        LogKind::Stderr => EventTypes::PROCESS_STDERR,
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                let time = Utc::now();
                process.record(
                    LogLine {
                        kind,
                        time,
                        text: text.clone(),
                    },
                    max_lines,
                );
                publish(
                    &publisher,
                    Event::at(
                        event_type,
                        ProcessOutputBody {
                            base: EventBody::default(),
                            pid: process.pid,
                            text,
                        },
                        time,
                    ),
                );
            }
            Ok(None) => break,
            Err(e) => {
                debug!(pid = process.pid, "Output reader ended: {e}");
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// `process.start`: spawn a command and return its descriptor.
pub struct StartProcess {
    registry: Arc<ProcessRegistry>,
}

/// `process.kill`: fire-and-forget kill.
pub struct KillProcess {
    registry: Arc<ProcessRegistry>,
}

/// `process.getProcess`
pub struct GetProcess {
    registry: Arc<ProcessRegistry>,
}

/// `process.getProcesses`
pub struct GetProcesses {
    registry: Arc<ProcessRegistry>,
}

/// `process.getLogs`
pub struct GetLogs {
    registry: Arc<ProcessRegistry>,
}

/// `process.wait`: answers when the process exits.
pub struct WaitProcess {
    registry: Arc<ProcessRegistry>,
}

macro_rules! handler_ctor {
    ($($ty:ident),*) => {
        $(impl $ty {
            pub fn new(registry: Arc<ProcessRegistry>) -> Self {
                Self { registry }
            }
        })*
    };
}

handler_ctor!(StartProcess, KillProcess, GetProcess, GetProcesses, GetLogs, WaitProcess);

impl Handler for StartProcess {
    type Params = StartParams;
    type Output = ProcessDescriptor;

    fn method(&self) -> &str {
        Methods::PROCESS_START
    }

    fn decode_params(&self, raw: Option<serde_json::Value>) -> Result<StartParams, RpcError> {
        let params: StartParams = parse_params(raw)?;
        if params.command_line.trim().is_empty() {
            return Err(RpcError::invalid_params("commandLine must not be empty"));
        }
        Ok(params)
    }

    async fn invoke(&self, p: StartParams, _cx: CallContext) -> Result<ProcessDescriptor, HandlerError> {
        Ok(self.registry.start(&p.name, &p.command_line, &p.process_type)?)
    }
}

impl Handler for KillProcess {
    type Params = PidParams;
    type Output = ();

    fn method(&self) -> &str {
        Methods::PROCESS_KILL
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::FireAndForget
    }

    async fn invoke(&self, p: PidParams, _cx: CallContext) -> Result<(), HandlerError> {
        Ok(self.registry.kill(p.pid)?)
    }
}

impl Handler for GetProcess {
    type Params = PidParams;
    type Output = ProcessDescriptor;

    fn method(&self) -> &str {
        Methods::PROCESS_GET_PROCESS
    }

    async fn invoke(&self, p: PidParams, _cx: CallContext) -> Result<ProcessDescriptor, HandlerError> {
        Ok(self.registry.get(p.pid)?)
    }
}

impl Handler for GetProcesses {
    type Params = Option<ListParams>;
    type Output = Vec<ProcessDescriptor>;

    fn method(&self) -> &str {
        Methods::PROCESS_GET_PROCESSES
    }

    async fn invoke(
        &self,
        p: Option<ListParams>,
        _cx: CallContext,
    ) -> Result<Vec<ProcessDescriptor>, HandlerError> {
        let all = p.map(|p| p.all).unwrap_or(false);
        Ok(self.registry.list(all))
    }
}

impl Handler for GetLogs {
    type Params = LogsParams;
    type Output = Vec<LogLine>;

    fn method(&self) -> &str {
        Methods::PROCESS_GET_LOGS
    }

    async fn invoke(&self, p: LogsParams, _cx: CallContext) -> Result<Vec<LogLine>, HandlerError> {
        Ok(self.registry.logs(p.pid, p.skip, p.limit)?)
    }
}

impl Handler for WaitProcess {
    type Params = PidParams;
    type Output = WaitResult;

    fn method(&self) -> &str {
        Methods::PROCESS_WAIT
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn invoke(&self, p: PidParams, cx: CallContext) -> Result<WaitResult, HandlerError> {
        tokio::select! {
            exit = self.registry.wait_exit(p.pid) => Ok(WaitResult {
                pid: p.pid,
                exit_code: exit?,
            }),
            _ = cx.cancelled() => {
                debug!(pid = p.pid, connection = %cx.connection_id, "Wait cancelled");
                Err(HandlerError::Cancelled)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameter types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StartParams {
    #[serde(default)]
    name: String,
    #[serde(rename = "commandLine")]
    command_line: String,
    #[serde(rename = "type", default)]
    process_type: String,
}

#[derive(Debug, Deserialize)]
pub struct PidParams {
    pid: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsParams {
    pid: u64,
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    DEFAULT_LOG_LIMIT
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitResult {
    pub pid: u64,
    pub exit_code: Option<i32>,
}
