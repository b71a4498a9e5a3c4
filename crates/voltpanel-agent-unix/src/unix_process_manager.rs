#[cfg(unix)]
mod unix_impl {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use tracing::{debug, info, warn};
    use voltpanel_agent_core::{
        ChildProcessHandle, Pid, ProcessDefinition, ProcessLifecycle, ProcessManager,
        ProcessTermination, TerminationResult, build_command,
    };

    /// Unix process manager; every child leads its own process group
    pub struct UnixProcessManager;

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcessLifecycle for UnixProcessManager {
        type Handle = ChildProcessHandle;

        fn spawn_process(&self, definition: &ProcessDefinition) -> std::io::Result<Self::Handle> {
            let mut cmd = build_command(definition);

            // New process group so a stop also reaches whatever the child spawned
            cmd.process_group(0);

            let child = cmd.spawn()?;

            if let Some(pid) = child.id() {
                info!(
                    "Spawned Unix process: {} (PID: {}) with args: {:?}",
                    definition.command, pid, definition.args
                );
            }

            Ok(ChildProcessHandle::new(child))
        }
    }

    impl ProcessTermination for UnixProcessManager {
        fn kill(&self, pid: Pid) -> TerminationResult {
            let Ok(raw) = i32::try_from(pid) else {
                return TerminationResult::Failed(format!("PID {pid} out of range"));
            };
            let nix_pid = NixPid::from_raw(raw);

            match signal::killpg(nix_pid, Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process group {}", pid);
                    TerminationResult::Success
                }
                // Group leader gone or never got its own group
                Err(Errno::ESRCH) => {
                    debug!("Process group {} not found, signalling the process", pid);
                    Self::kill_single(nix_pid)
                }
                Err(Errno::EPERM) => {
                    warn!("Permission denied to kill process group {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL to process group failed: {e}"))
                }
            }
        }
    }

    impl UnixProcessManager {
        fn kill_single(pid: NixPid) -> TerminationResult {
            match signal::kill(pid, Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process {}", pid);
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => {
                    info!("Process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(Errno::EPERM) => {
                    warn!("Permission denied to kill process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                }
            }
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager");
            Self
        }
    }
}

#[cfg(unix)]
pub use unix_impl::UnixProcessManager;

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use voltpanel_agent_core::{
        ProcessDefinition, ProcessHandle, ProcessLifecycle, ProcessManager, ProcessTermination,
        TerminationResult, exit_code_of,
    };

    fn shell(id: &str, script: &str) -> ProcessDefinition {
        ProcessDefinition::builder()
            .id(id)
            .command("sh")
            .args(["-c", script])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_pipes_output_and_env() {
        let manager = UnixProcessManager::new();
        let mut definition = shell("echo", "echo \"$GREETING\"; echo oops >&2");
        definition
            .env
            .insert("GREETING".to_string(), "hello".to_string());

        let mut handle = manager.spawn_process(&definition).unwrap();
        assert!(handle.get_pid().is_some());

        let mut out = String::new();
        handle
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        let mut err = String::new();
        handle
            .take_stderr()
            .unwrap()
            .read_to_string(&mut err)
            .await
            .unwrap();

        assert_eq!(out, "hello\n");
        assert_eq!(err, "oops\n");
        assert_eq!(exit_code_of(handle.wait().await), 0);
    }

    #[tokio::test]
    async fn test_kill_reaches_the_whole_group() {
        let manager = UnixProcessManager::new();
        // the shell waits on a grandchild that shares its process group
        let mut handle = manager
            .spawn_process(&shell("tree", "sleep 30 & wait"))
            .unwrap();
        let pid = handle.get_pid().unwrap();

        assert_eq!(manager.kill(pid), TerminationResult::Success);

        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("killed process must be reaped promptly");
        assert_eq!(exit_code_of(status), -1);
    }

    #[tokio::test]
    async fn test_kill_of_missing_process() {
        let manager = UnixProcessManager::new();
        let mut handle = manager.spawn_process(&shell("quick", "exit 0")).unwrap();
        let pid = handle.get_pid().unwrap();
        handle.wait().await.unwrap();

        assert_eq!(manager.kill(pid), TerminationResult::ProcessNotFound);
    }
}
