//! Supervised MQTT session.
//!
//! A single background task owns the broker link. It runs the
//! CONNECT/CONNACK handshake, keeps the session alive with PINGREQ,
//! reassembles inbound frames, and reconnects after a fixed delay until
//! [`Session::stop`] is called. Every physical connection gets a new
//! epoch; outbound frames tagged with an older epoch are dropped so a
//! publish never leaks onto a connection it was not meant for.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use relayd_core::BrokerConfig;

use crate::codec::{pull_one_packet, Connect, Packet, QoS};
use crate::connector::{Connector, Link};
use crate::error::{MqttError, Result};

/// Connection parameters shared by the realtime session and one-shot clients.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    /// Socket open and CONNACK deadline
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for SessionConfig {
    fn from(broker: &BrokerConfig) -> Self {
        Self {
            client_id_prefix: broker.client_id_prefix.clone(),
            username: broker.username.clone().filter(|u| !u.is_empty()),
            password: broker.password.clone().filter(|p| !p.is_empty()),
            keep_alive_secs: broker.keep_alive_secs,
            connect_timeout: Duration::from_millis(broker.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(broker.heartbeat_interval_ms),
            reconnect_delay: Duration::from_millis(broker.reconnect_delay_ms),
        }
    }
}

impl SessionConfig {
    /// Fresh client id: `<prefix>-<8 hex chars>`.
    pub fn client_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_id_prefix, &suffix[..8])
    }

    pub fn connect_packet(&self, client_id: String) -> Packet {
        Packet::Connect(Connect {
            client_id,
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive_secs: self.keep_alive_secs,
            clean_session: true,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// What the session reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// CONNACK accepted; frames for `epoch` may now be sent.
    Connected { epoch: u64 },
    /// Inbound packet other than CONNACK and PINGRESP.
    Packet { epoch: u64, packet: Packet },
    /// Attempt `epoch` ended, whether or not it ever connected.
    Disconnected { epoch: u64, reason: String },
}

#[derive(Debug)]
struct OutboundFrame {
    epoch: u64,
    frame: Bytes,
}

/// Handle to the background session task.
pub struct Session {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start connecting in the background.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(endpoint = connector.endpoint(), "Starting MQTT session");
        let supervisor = Supervisor {
            connector,
            config,
            events: events_tx,
            outbound: outbound_rx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        let session = Self {
            outbound: outbound_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        };
        (session, events_rx)
    }

    /// Queue an encoded frame for the connection identified by `epoch`.
    pub fn send(&self, epoch: u64, frame: Bytes) -> Result<()> {
        self.outbound
            .send(OutboundFrame { epoch, frame })
            .map_err(|_| MqttError::Stopped)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the link and disable reconnects. Waits for the task to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "MQTT session task ended abnormally");
            }
        }
    }
}

enum ConnectionEnd {
    Stopped,
    Lost(String),
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Handshake { deadline: Instant },
    Connected { next_ping: Instant },
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut epoch = 0u64;
        loop {
            epoch += 1;
            self.state.send_replace(ConnectionState::Connecting);
            let end = self.run_connection(epoch).await;
            self.state.send_replace(ConnectionState::Disconnected);

            let reason = match &end {
                ConnectionEnd::Stopped => "session stopped".to_string(),
                ConnectionEnd::Lost(reason) => reason.clone(),
            };
            let _ = self
                .events
                .send(TransportEvent::Disconnected { epoch, reason });

            match end {
                ConnectionEnd::Stopped => {
                    info!(epoch, "MQTT session stopped");
                    return;
                }
                ConnectionEnd::Lost(reason) => {
                    warn!(
                        epoch,
                        reason = %reason,
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "MQTT connection lost, scheduling reconnect"
                    );
                    tokio::select! {
                        _ = wait_for_shutdown(&mut self.shutdown) => {
                            info!(epoch, "MQTT session stopped");
                            return;
                        }
                        _ = sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    async fn run_connection(&mut self, epoch: u64) -> ConnectionEnd {
        let opened = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => return ConnectionEnd::Stopped,
            opened = timeout(self.config.connect_timeout, self.connector.open()) => opened,
        };
        let mut link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return ConnectionEnd::Lost(e.to_string()),
            Err(_) => return ConnectionEnd::Lost("Timed out opening broker connection".into()),
        };

        let client_id = self.config.client_id();
        debug!(epoch, client_id = %client_id, "Sending CONNECT");
        let connect = self.config.connect_packet(client_id);
        if let Err(e) = send_packet(link.as_mut(), &connect).await {
            link.close().await;
            return ConnectionEnd::Lost(e.to_string());
        }

        let mut buffer = BytesMut::new();
        let mut phase = Phase::Handshake {
            deadline: Instant::now() + self.config.connect_timeout,
        };

        let end = loop {
            let timer = match phase {
                Phase::Handshake { deadline } => deadline,
                Phase::Connected { next_ping } => next_ping,
            };

            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    if matches!(phase, Phase::Connected { .. }) {
                        self.state.send_replace(ConnectionState::Closing);
                        if let Err(e) = send_packet(link.as_mut(), &Packet::Disconnect).await {
                            debug!(epoch, error = %e, "DISCONNECT not delivered");
                        }
                    }
                    break ConnectionEnd::Stopped;
                }
                _ = sleep_until(timer) => match phase {
                    Phase::Handshake { .. } => {
                        break ConnectionEnd::Lost("Timed out waiting for CONNACK".into());
                    }
                    Phase::Connected { .. } => {
                        trace!(epoch, "PINGREQ");
                        if let Err(e) = send_packet(link.as_mut(), &Packet::PingReq).await {
                            break ConnectionEnd::Lost(e.to_string());
                        }
                        phase = Phase::Connected {
                            next_ping: Instant::now() + self.config.heartbeat_interval,
                        };
                    }
                },
                frame = self.outbound.recv() => match frame {
                    None => break ConnectionEnd::Stopped,
                    Some(frame) if frame.epoch == epoch && matches!(phase, Phase::Connected { .. }) => {
                        if let Err(e) = link.send(frame.frame).await {
                            break ConnectionEnd::Lost(e.to_string());
                        }
                    }
                    Some(frame) => {
                        debug!(epoch, frame_epoch = frame.epoch, "Dropping frame for a stale connection");
                    }
                },
                chunk = link.recv() => match chunk {
                    None => break ConnectionEnd::Lost("Connection closed by broker".into()),
                    Some(Err(e)) => break ConnectionEnd::Lost(e.to_string()),
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        if let Err(end) = self
                            .process_inbound(epoch, &mut buffer, &mut phase, link.as_mut())
                            .await
                        {
                            break end;
                        }
                    }
                },
            }
        };

        link.close().await;
        end
    }

    async fn process_inbound(
        &mut self,
        epoch: u64,
        buffer: &mut BytesMut,
        phase: &mut Phase,
        link: &mut dyn Link,
    ) -> std::result::Result<(), ConnectionEnd> {
        loop {
            let frame = match pull_one_packet(buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    return Err(ConnectionEnd::Lost(format!("Corrupt MQTT stream: {}", e)));
                }
            };
            let packet = match Packet::decode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(epoch, error = %e, "Dropping malformed MQTT packet");
                    continue;
                }
            };

            match *phase {
                Phase::Handshake { .. } => match packet {
                    Packet::ConnAck(ack) if ack.return_code == 0 => {
                        *phase = Phase::Connected {
                            next_ping: Instant::now() + self.config.heartbeat_interval,
                        };
                        self.state.send_replace(ConnectionState::Connected);
                        info!(epoch, "MQTT session connected");
                        let _ = self.events.send(TransportEvent::Connected { epoch });
                    }
                    Packet::ConnAck(ack) => {
                        return Err(ConnectionEnd::Lost(
                            MqttError::ConnectionRejected(ack.return_code).to_string(),
                        ));
                    }
                    other => {
                        debug!(epoch, packet = other.name(), "Ignoring packet before CONNACK");
                    }
                },
                Phase::Connected { .. } => match packet {
                    Packet::PingResp => trace!(epoch, "PINGRESP"),
                    Packet::Publish(publish) => {
                        if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id)
                        {
                            send_packet(link, &Packet::PubAck { packet_id })
                                .await
                                .map_err(|e| ConnectionEnd::Lost(e.to_string()))?;
                        }
                        let _ = self.events.send(TransportEvent::Packet {
                            epoch,
                            packet: Packet::Publish(publish),
                        });
                    }
                    other => {
                        let _ = self.events.send(TransportEvent::Packet {
                            epoch,
                            packet: other,
                        });
                    }
                },
            }
        }
    }
}

pub(crate) async fn send_packet(link: &mut dyn Link, packet: &Packet) -> Result<()> {
    let frame = packet.encode()?;
    link.send(frame).await
}

/// Resolves once shutdown was requested or the handle was dropped.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
