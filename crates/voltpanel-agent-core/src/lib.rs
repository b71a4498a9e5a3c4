//! VoltPanel Agent Core - Platform-independent process supervision
//!
//! This crate provides the data model, configuration, error types, event hub,
//! process registry and the generic supervisor that the platform-specific
//! process managers plug into.

mod capture;
mod config;
mod error;
mod event;
mod hub;
mod process;
mod registry;
mod supervisor;

pub use capture::{LineCodec, LogSink, MAX_LINE_BYTES, capture_output};
pub use config::*;
pub use error::*;
pub use event::PanelEvent;
pub use hub::{EventHub, SubscriberId, Subscription};
pub use process::*;
pub use registry::ProcessRegistry;
pub use supervisor::Supervisor;
