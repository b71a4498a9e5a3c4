mod unix_process_manager;

pub use unix_process_manager::UnixProcessManager;

pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl voltpanel_agent_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> UnixProcessManager {
        <UnixProcessManager as voltpanel_agent_core::ProcessManager>::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
