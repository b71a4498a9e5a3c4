//! Lifecycle owner of the panel's child processes.
//!
//! A [`Supervisor`] keeps one live entry per process id. Starting a process
//! spawns it through the platform [`ProcessManager`], then hands its output
//! pipes to two capture tasks and the child itself to a wait task. The wait task
//! is the only place where an entry moves from running to exited.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::Retryable;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{LogSink, capture_output};
use crate::config::{DEFAULT_LOG_TAIL_BYTES, DataDir, ProcessDefinition, SupervisorConfig};
use crate::error::SupervisorError;
use crate::event::PanelEvent;
use crate::hub::EventHub;
use crate::process::{
    ABNORMAL_EXIT_CODE, OutputStream, ProcessHandle, ProcessManager, ProcessRecord,
    ProcessRuntimeState, TerminationResult, exit_code_of,
};
use crate::registry::ProcessRegistry;

/// How long the wait task lets capture tasks flush after the child is reaped.
/// Grandchildren holding the pipes open are cut off after this.
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Inner<M> {
    manager: M,
    processes: Mutex<HashMap<String, ProcessRecord>>,
    registry: ProcessRegistry,
    hub: EventHub<PanelEvent>,
    data_dir: DataDir,
    config: SupervisorConfig,
}

impl<M> Inner<M> {
    fn processes(&self) -> MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, record: &ProcessRecord) {
        if let Err(e) = self.registry.upsert(record.clone()) {
            warn!(id = %record.id(), error = %e, "Failed to persist process record");
        }
    }
}

/// Cloneable handle to the process table, registry and event hub
pub struct Supervisor<M: ProcessManager> {
    inner: Arc<Inner<M>>,
}

impl<M: ProcessManager> Clone for Supervisor<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ProcessManager> Supervisor<M> {
    /// Prepare the data directory, load the registry and settle records left
    /// running by a previous panel run.
    pub fn new(config: SupervisorConfig, manager: M) -> Result<Self, SupervisorError> {
        let data_dir = DataDir::ensure(&config.data_dir).map_err(|e| {
            SupervisorError::Configuration(format!(
                "cannot prepare data directory {}: {e}",
                config.data_dir.display()
            ))
        })?;
        let registry = ProcessRegistry::open(data_dir.registry_path())?;

        let now = Utc::now();
        for mut record in registry.list() {
            if record.state.mark_exited(ABNORMAL_EXIT_CODE, now) {
                info!(id = %record.id(), "Marking process from previous run as exited");
                registry.upsert(record)?;
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                manager,
                processes: Mutex::new(HashMap::new()),
                registry,
                hub: EventHub::new(config.subscriber_queue_capacity),
                data_dir,
                config,
            }),
        })
    }

    pub fn hub(&self) -> &EventHub<PanelEvent> {
        &self.inner.hub
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.inner.data_dir
    }

    /// Spawn `definition` and begin supervising it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, definition: ProcessDefinition) -> Result<ProcessRecord, SupervisorError> {
        definition.validate()?;
        let id = definition.id.clone();

        let mut processes = self.inner.processes();
        if processes
            .get(&id)
            .is_some_and(|entry| entry.state.status.is_running())
        {
            return Err(SupervisorError::AlreadyRunning(id));
        }

        let log_path = self.inner.data_dir.log_path(&id);
        let spawn_failed = |source: std::io::Error| SupervisorError::SpawnFailed {
            id: id.clone(),
            source,
        };
        let sink = LogSink::open(&log_path).map_err(spawn_failed)?;
        let mut handle = self
            .inner
            .manager
            .spawn_process(&definition)
            .map_err(spawn_failed)?;

        let pid = handle.get_pid();
        let record = ProcessRecord {
            definition,
            state: ProcessRuntimeState::running(pid, log_path),
        };
        processes.insert(id.clone(), record.clone());
        self.inner.persist(&record);
        info!(id = %id, pid = ?pid, command = %record.definition.command, "Process started");

        self.inner.hub.publish(PanelEvent::Started {
            process_id: id.clone(),
            pid,
            timestamp: record.state.started_at,
        });

        let captures = [handle.take_stdout(), handle.take_stderr()]
            .into_iter()
            .flatten()
            .map(|stream| self.spawn_capture(&id, stream, sink.clone()))
            .collect();
        tokio::spawn(Self::wait_for_exit(
            Arc::clone(&self.inner),
            id,
            handle,
            captures,
        ));

        Ok(record)
    }

    fn spawn_capture(&self, id: &str, stream: OutputStream, sink: LogSink) -> JoinHandle<()> {
        let id = id.to_string();
        let hub = self.inner.hub.clone();
        tokio::spawn(async move { capture_output(&id, stream, sink, hub).await })
    }

    async fn wait_for_exit(
        inner: Arc<Inner<M>>,
        id: String,
        mut handle: M::Handle,
        captures: Vec<JoinHandle<()>>,
    ) {
        let status = handle.wait().await;
        if let Err(e) = &status {
            warn!(id = %id, error = %e, "Waiting on process failed");
        }
        let code = exit_code_of(status);

        let drain = drain_captures(captures);
        if tokio::time::timeout(CAPTURE_DRAIN_TIMEOUT, drain)
            .await
            .is_err()
        {
            debug!(id = %id, "Output still open after exit, not waiting for it");
        }

        let exited_at = Utc::now();
        let record = {
            let processes = inner.processes();
            let Some(entry) = processes.get(&id) else {
                return;
            };
            let mut record = entry.clone();
            if !record.state.mark_exited(code, exited_at) {
                return;
            }
            record
        };

        // The registry holds the exit before the entry leaves Running
        let writer = Arc::clone(&inner);
        let exited = record.clone();
        match tokio::task::spawn_blocking(move || writer.registry.update_run(exited)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => debug!(id = %id, "Newer run already recorded, exit not persisted"),
            Ok(Err(e)) => warn!(id = %id, error = %e, "Failed to persist process record"),
            Err(e) => warn!(id = %id, error = %e, "Registry write task failed"),
        }

        if let Some(entry) = inner.processes().get_mut(&id) {
            if entry.state.started_at == record.state.started_at {
                *entry = record;
            }
        }
        info!(id = %id, code, "Process exited");

        inner.hub.publish(PanelEvent::Exited {
            process_id: id,
            code,
            timestamp: exited_at,
        });
    }

    /// Send a hard kill to a running process. Does not wait for it to exit.
    pub fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let processes = self.inner.processes();
        let entry = processes
            .get(id)
            .filter(|entry| entry.state.status.is_running())
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let pid = entry
            .state
            .pid
            .ok_or_else(|| SupervisorError::NoProcessHandle(id.to_string()))?;

        match self.inner.manager.kill(pid) {
            // Already gone: the wait task records the exit
            TerminationResult::Success | TerminationResult::ProcessNotFound => {
                info!(id = %id, pid, "Kill signal sent");
                Ok(())
            }
            TerminationResult::AccessDenied => Err(SupervisorError::TerminateFailed {
                id: id.to_string(),
                reason: "permission denied".to_string(),
            }),
            TerminationResult::Failed(reason) => {
                Err(SupervisorError::TerminateFailed {
                    id: id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Stop the process if it is running and start it again from its stored
    /// definition.
    pub async fn restart(&self, id: &str) -> Result<ProcessRecord, SupervisorError> {
        let definition = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?
            .definition;

        match self.stop(id) {
            Ok(()) => {}
            // Not running any more is the common case
            Err(e) if e.is_client_error() => {
                debug!(id = %id, error = %e, "Stop before restart ignored");
            }
            Err(e) => warn!(id = %id, error = %e, "Stop before restart failed, starting anyway"),
        }

        (|| async { self.start(definition.clone()) })
            .retry(self.inner.config.restart.backoff())
            .when(|e: &SupervisorError| e.is_retryable())
            .notify(|_, delay| {
                debug!(id = %id, ?delay, "Previous run not reaped yet, retrying start");
            })
            .await
    }

    /// Snapshot of every live entry
    pub fn list(&self) -> Vec<ProcessRecord> {
        self.inner.processes().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.inner.processes().get(id).cloned()
    }

    /// Contents of the process log, or only its last `log_tail_bytes` (at most
    /// 64 KiB) bytes
    pub async fn read_log(&self, id: &str, tail_only: bool) -> Result<Vec<u8>, SupervisorError> {
        let record = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let unavailable = |source: std::io::Error| SupervisorError::LogUnavailable {
            id: id.to_string(),
            source,
        };

        let tail_bytes = self.inner.config.log_tail_bytes.min(DEFAULT_LOG_TAIL_BYTES);
        let mut file = tokio::fs::File::open(&record.state.log_file_path)
            .await
            .map_err(unavailable)?;
        if tail_only {
            let len = file.metadata().await.map_err(unavailable)?.len();
            let offset = len.saturating_sub(tail_bytes);
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(unavailable)?;
        }

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .await
            .map_err(unavailable)?;
        if tail_only && contents.len() as u64 > tail_bytes {
            // The file grew between stat and read
            let excess = contents.len() - tail_bytes as usize;
            contents.drain(..excess);
        }
        Ok(contents)
    }

    /// Kill every running child. Exits are still recorded by their wait tasks.
    pub fn shutdown(&self) {
        let running: Vec<String> = self
            .inner
            .processes()
            .values()
            .filter(|entry| entry.state.status.is_running())
            .map(|entry| entry.id().to_string())
            .collect();

        info!(count = running.len(), "Stopping all running processes");
        for id in running {
            match self.stop(&id) {
                Ok(()) | Err(SupervisorError::NotFound(_)) => {}
                Err(e) => warn!(id = %id, error = %e, "Failed to stop process during shutdown"),
            }
        }
    }
}

async fn drain_captures(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Output capture task failed");
        }
    }
}
