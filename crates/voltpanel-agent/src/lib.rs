//! VoltPanel Agent - supervision of the control panel's local processes
//!
//! Re-exports the platform-independent core and wires in the process manager
//! of the platform being built for.

pub mod logging;
mod platform_factory;

pub use platform_factory::{
    PanelSupervisor, PlatformProcessManager, PlatformProcessManagerFactory, create_supervisor,
};
pub use voltpanel_agent_core::*;
