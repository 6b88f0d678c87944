//! Core types for relayd.
//!
//! Shared by the MQTT client, the command layer, storage and the scheduler.

pub mod command;
pub mod config;
pub mod error;
pub mod event;

pub use command::{CommandAction, CommandEnvelope};
pub use config::{BrokerConfig, RelaydConfig, SchedulerSettings, StorageSettings};
pub use error::{Error, Result};
pub use event::{
    DeviceSnapshot, DeviceStatus, PowerState, Presence, RealtimeEvent, RealtimeMessage,
    StatusSource,
};
