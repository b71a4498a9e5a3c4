use voltpanel_agent_core::{
    ProcessManagerFactory, Supervisor, SupervisorConfig, SupervisorError,
};

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    #[cfg(unix)]
    type Manager = voltpanel_agent_unix::UnixProcessManager;

    #[cfg(windows)]
    type Manager = voltpanel_agent_windows::WindowsProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return voltpanel_agent_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return voltpanel_agent_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return voltpanel_agent_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return voltpanel_agent_windows::WindowsProcessManagerFactory::platform_name();
    }
}

/// Process manager of the platform this crate was built for
pub type PlatformProcessManager = <PlatformProcessManagerFactory as ProcessManagerFactory>::Manager;

/// Supervisor driving the platform process manager
pub type PanelSupervisor = Supervisor<PlatformProcessManager>;

/// Convenience function to create a supervisor for the current platform
pub fn create_supervisor(config: SupervisorConfig) -> Result<PanelSupervisor, SupervisorError> {
    tracing::info!(
        platform = PlatformProcessManagerFactory::platform_name(),
        data_dir = %config.data_dir.display(),
        "Creating process supervisor"
    );
    Supervisor::new(config, PlatformProcessManagerFactory::create_process_manager())
}
