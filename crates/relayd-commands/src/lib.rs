//! Command dispatch for relay devices.
//!
//! Provides:
//! - [`CommandPublisher`]: the seam between command logic and MQTT paths
//! - [`CommandDispatcher`]: shared session first, one-shot connection on unavailability
//! - [`CommandService`]: channel lookup, dispatch and audit for manual commands

pub mod dispatch;
pub mod error;
pub mod service;

pub use dispatch::{CommandDispatcher, CommandPublisher};
pub use error::{CommandError, Result};
pub use service::CommandService;
