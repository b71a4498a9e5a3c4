use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use crate::config::ProcessDefinition;

/// OS process identifier
pub type Pid = u32;

/// Exit code recorded when a child was killed by a signal or its wait failed
pub const ABNORMAL_EXIT_CODE: i32 = -1;

/// Lifecycle status of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Mutable runtime state of the current or most recent run of a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRuntimeState {
    /// Present only while running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(rename = "code", default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(rename = "logFile")]
    pub log_file_path: PathBuf,
}

impl ProcessRuntimeState {
    pub fn running(pid: Option<Pid>, log_file_path: PathBuf) -> Self {
        Self {
            pid,
            status: ProcessStatus::Running,
            started_at: Utc::now(),
            exited_at: None,
            exit_code: None,
            log_file_path,
        }
    }

    /// Final transition of a run. Later calls are ignored.
    pub fn mark_exited(&mut self, exit_code: i32, at: DateTime<Utc>) -> bool {
        if !self.status.is_running() {
            return false;
        }
        self.status = ProcessStatus::Exited;
        self.pid = None;
        self.exit_code = Some(exit_code);
        self.exited_at = Some(at.max(self.started_at));
        true
    }
}

/// A process definition together with its last known runtime state
///
/// This is both what the supervisor reports for a live entry and the unit the
/// registry persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    #[serde(flatten)]
    pub definition: ProcessDefinition,
    #[serde(flatten)]
    pub state: ProcessRuntimeState,
}

impl ProcessRecord {
    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

/// Map a reaped exit status to the recorded exit code
pub fn exit_code_of(status: Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status.code().unwrap_or(ABNORMAL_EXIT_CODE),
        Err(_) => ABNORMAL_EXIT_CODE,
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Owned output stream of a child process
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Trait representing a handle to a spawned child process
#[async_trait]
pub trait ProcessHandle: Send + Sync + 'static {
    /// Get the process ID (None if process has exited)
    fn get_pid(&self) -> Option<Pid>;

    /// Take the piped standard output, leaving `None` behind
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Take the piped standard error, leaving `None` behind
    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Wait for the process to exit and reap it
    async fn wait(&mut self) -> Result<ExitStatus>;
}

/// Process handle over a Tokio child with piped stdout and stderr
pub struct ChildProcessHandle {
    child: Child,
}

impl ChildProcessHandle {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcessHandle {
    fn get_pid(&self) -> Option<Pid> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|out| Box::new(out) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|err| Box::new(err) as OutputStream)
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

/// Command for a definition with arguments, working directory, merged environment
/// and piped output. Platforms add their own spawn flags before spawning.
pub fn build_command(definition: &ProcessDefinition) -> Command {
    let mut cmd = Command::new(&definition.command);
    cmd.args(&definition.args);

    if let Some(dir) = definition.working_dir() {
        cmd.current_dir(dir);
    }

    // Inherited environment is kept; definition entries win on conflict
    cmd.envs(&definition.env);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Core trait for spawning processes
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle;

    /// Spawn a process for the definition with stdout and stderr piped
    ///
    /// Must be called from within a Tokio runtime.
    fn spawn_process(&self, definition: &ProcessDefinition) -> std::io::Result<Self::Handle>;
}

/// Trait for terminating processes
pub trait ProcessTermination: Send + Sync {
    /// Send a single hard termination to the process and whatever it spawned.
    /// Does not wait for the exit.
    fn kill(&self, pid: Pid) -> TerminationResult;
}

/// Platform process manager combining spawning and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination + 'static {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state() -> ProcessRuntimeState {
        ProcessRuntimeState::running(Some(4242), PathBuf::from("/tmp/logs/web.log"))
    }

    #[test]
    fn test_exit_transition_is_final() {
        let mut state = state();
        let at = state.started_at + Duration::seconds(3);
        assert!(state.mark_exited(3, at));
        assert_eq!(state.status, ProcessStatus::Exited);
        assert_eq!(state.exit_code, Some(3));
        assert_eq!(state.pid, None);
        assert_eq!(state.exited_at, Some(at));

        assert!(!state.mark_exited(0, at + Duration::seconds(1)));
        assert_eq!(state.exit_code, Some(3));
        assert_eq!(state.exited_at, Some(at));
    }

    #[test]
    fn test_exited_at_never_precedes_started_at() {
        let mut state = state();
        let earlier = state.started_at - Duration::seconds(5);
        state.mark_exited(0, earlier);
        assert!(state.exited_at.unwrap() >= state.started_at);
    }

    #[test]
    fn test_exit_code_mapping() {
        let failed: Result<ExitStatus> = Err(anyhow::anyhow!("wait failed"));
        assert_eq!(exit_code_of(failed), ABNORMAL_EXIT_CODE);

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(exit_code_of(Ok(ExitStatus::from_raw(3 << 8))), 3);
            // killed by SIGKILL
            assert_eq!(exit_code_of(Ok(ExitStatus::from_raw(9))), ABNORMAL_EXIT_CODE);
        }
    }

    #[test]
    fn test_record_wire_format() {
        let record = ProcessRecord {
            definition: ProcessDefinition {
                id: "web".to_string(),
                name: "Web".to_string(),
                command: "python3".to_string(),
                args: vec!["-m".to_string(), "http.server".to_string()],
                ..Default::default()
            },
            state: state(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "web");
        assert_eq!(value["status"], "running");
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["logFile"], "/tmp/logs/web.log");
        assert!(value.get("code").is_none());
        assert!(value.get("startedAt").is_some());

        let back: ProcessRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
