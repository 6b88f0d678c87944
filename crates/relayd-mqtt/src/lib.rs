//! MQTT 3.1.1 over WebSocket for relay devices.
//!
//! - [`codec`]: packet encoding and stream reassembly
//! - [`transport`]: supervised, self-reconnecting session
//! - [`proxy`]: shared realtime proxy with serialized QoS 1 publishing and
//!   device event fanout
//! - [`compat`]: Tasmota topic and payload conventions
//! - [`oneshot`]: connect-act-disconnect helpers
//! - [`discovery`]: passive device discovery

pub mod codec;
pub mod compat;
pub mod connector;
pub mod discovery;
pub mod error;
pub mod oneshot;
pub mod proxy;
pub mod transport;

pub use codec::{CodecError, Packet, QoS};
pub use compat::{
    build_command_publish_targets, normalize_command_channel, parse_realtime_message,
    realtime_subscribe_topics, PublishTarget,
};
pub use connector::{Connector, Link, WsConnector};
pub use discovery::{DiscoveredDevice, DiscoveryCollector, ObservedPower};
pub use error::{MqttError, Result};
pub use oneshot::OneShotClient;
pub use proxy::{EventCallback, ProxyConfig, RealtimeProxy, Subscription};
pub use transport::{ConnectionState, Session, SessionConfig, TransportEvent};
