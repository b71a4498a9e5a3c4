use std::process::{Command, Output};
use std::sync::Mutex;

use sysinfo::System;
use tracing::{info, warn};
use voltpanel_agent_core::{
    ChildProcessHandle, Pid, ProcessDefinition, ProcessLifecycle, ProcessManager,
    ProcessTermination, TerminationResult, build_command,
};

/// Windows process manager; stop force-terminates the child and its descendants
pub struct WindowsProcessManager {
    system: Mutex<System>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLifecycle for WindowsProcessManager {
    type Handle = ChildProcessHandle;

    fn spawn_process(&self, definition: &ProcessDefinition) -> std::io::Result<Self::Handle> {
        #[allow(unused_mut)]
        let mut cmd = build_command(definition);

        #[cfg(windows)]
        {
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        let child = cmd.spawn()?;

        if let Some(pid) = child.id() {
            info!(
                pid = %pid,
                command = %definition.command,
                args = ?definition.args,
                "Spawned Windows process"
            );
        }

        Ok(ChildProcessHandle::new(child))
    }
}

impl ProcessTermination for WindowsProcessManager {
    fn kill(&self, pid: Pid) -> TerminationResult {
        info!(root_pid = %pid, "Terminating process tree for root PID");

        match taskkill_tree(pid) {
            Ok(output) if output.status.success() => {
                info!(root_pid = %pid, "Successfully terminated process tree for PID");
                TerminationResult::Success
            }
            // taskkill reports a missing process with exit code 128
            Ok(output) if output.status.code() == Some(128) => {
                info!(root_pid = %pid, "Process tree for PID not found");
                TerminationResult::ProcessNotFound
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("Access is denied") {
                    warn!(root_pid = %pid, "Permission denied to terminate process tree");
                    TerminationResult::AccessDenied
                } else {
                    warn!(root_pid = %pid, error = %stderr.trim(), "taskkill failed");
                    TerminationResult::Failed(format!("taskkill failed: {}", stderr.trim()))
                }
            }
            Err(e) => {
                warn!(root_pid = %pid, error = %e, "Failed to run taskkill, terminating manually");
                self.kill_tree_manually(pid)
            }
        }
    }
}

/// Force-terminate a process and all of its descendants
fn taskkill_tree(pid: Pid) -> std::io::Result<Output> {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/F", "/T", "/PID", &pid.to_string()]);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    }

    cmd.output()
}

impl WindowsProcessManager {
    /// Fallback when taskkill is unavailable: walk the tree with sysinfo
    fn kill_tree_manually(&self, root: Pid) -> TerminationResult {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut descendants = Vec::new();
        Self::find_children_recursive(&system, root, &mut descendants);
        if !descendants.is_empty() {
            info!(count = descendants.len(), "Found child processes to terminate manually");
        }

        // Terminate children first (bottom-up approach)
        for child_pid in &descendants {
            if let Some(process) = system.process(sysinfo::Pid::from_u32(*child_pid)) {
                if !process.kill() {
                    warn!(pid = %child_pid, "Failed to terminate child process");
                }
            }
        }

        match system.process(sysinfo::Pid::from_u32(root)) {
            Some(process) if process.kill() => {
                info!(pid = %root, "Terminated process");
                TerminationResult::Success
            }
            Some(_) => TerminationResult::Failed(format!("failed to terminate process {root}")),
            None => {
                info!(pid = %root, "Process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
        }
    }

    /// Recursively find all child processes
    fn find_children_recursive(system: &System, parent_pid: Pid, result: &mut Vec<Pid>) {
        for (pid, process) in system.processes() {
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                // Recursively find grandchildren first
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        info!("Initializing Windows process manager with system monitoring");
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;
    use std::time::Duration;
    use voltpanel_agent_core::{ProcessHandle, exit_code_of};

    #[tokio::test]
    async fn test_kill_running_process() {
        let manager = WindowsProcessManager::new();
        let definition = ProcessDefinition::builder()
            .id("ping")
            .command("ping")
            .args(["-n", "30", "127.0.0.1"])
            .build()
            .unwrap();

        let mut handle = manager.spawn_process(&definition).unwrap();
        let pid = handle.get_pid().unwrap();
        assert_eq!(manager.kill(pid), TerminationResult::Success);

        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("terminated process must be reaped promptly");
        assert_eq!(exit_code_of(status), 1);
    }

    #[tokio::test]
    async fn test_kill_of_missing_process() {
        let manager = WindowsProcessManager::new();
        let definition = ProcessDefinition::builder()
            .id("quick")
            .command("cmd")
            .args(["/C", "exit 0"])
            .build()
            .unwrap();

        let mut handle = manager.spawn_process(&definition).unwrap();
        let pid = handle.get_pid().unwrap();
        handle.wait().await.unwrap();

        assert_eq!(manager.kill(pid), TerminationResult::ProcessNotFound);
    }
}
