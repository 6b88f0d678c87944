//! Short-lived connections: connect, do one thing, disconnect.
//!
//! Used when no realtime session is running (CLI invocations) and as the
//! last-resort publish path when the shared session is unavailable.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use rand::Rng;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use relayd_core::{BrokerConfig, CommandEnvelope, Presence, RealtimeMessage};

use crate::codec::{pull_one_packet, Packet, Publish, QoS, Subscribe};
use crate::compat::{
    build_command_publish_targets, extract_lwt_device_id, lwt_snapshot_subscribe_topics,
    parse_realtime_message, realtime_subscribe_topics,
};
use crate::connector::{Connector, Link};
use crate::discovery::{DiscoveredDevice, DiscoveryCollector};
use crate::error::{MqttError, Result};
use crate::transport::{send_packet, SessionConfig};

/// Connect-act-disconnect client.
#[derive(Clone)]
pub struct OneShotClient {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    /// Deadline for each wait: open+CONNACK, PUBACK, SUBACK
    timeout: Duration,
}

impl OneShotClient {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig, timeout: Duration) -> Self {
        Self {
            connector,
            config,
            timeout,
        }
    }

    pub fn from_broker_config(connector: Arc<dyn Connector>, broker: &BrokerConfig) -> Self {
        Self::new(
            connector,
            SessionConfig::from(broker),
            Duration::from_millis(broker.publish_timeout_ms),
        )
    }

    /// Publish one QoS 1 message on a fresh connection and wait for PUBACK.
    pub async fn publish_once(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        let mut conn = self.connect().await?;
        let packet_id: u16 = rand::thread_rng().gen_range(1..=u16::MAX);
        let result = conn
            .publish_acked(Publish::at_least_once(topic, payload, packet_id), self.timeout)
            .await;
        conn.close().await;
        if result.is_ok() {
            debug!(topic, packet_id, "One-shot publish acknowledged");
        }
        result
    }

    /// Publish a command to its first resolved target.
    pub async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<()> {
        let targets = build_command_publish_targets(
            envelope.device_id(),
            envelope.action(),
            envelope.command_channel(),
        );
        let target = targets
            .first()
            .ok_or_else(|| MqttError::NoPublishTarget(envelope.device_id().to_string()))?;
        info!(
            request_id = envelope.request_id(),
            topic = %target.topic,
            "Publishing command over one-shot connection"
        );
        self.publish_once(&target.topic, Bytes::from(target.payload.clone()))
            .await
            .map_err(|e| {
                warn!(topic = %target.topic, error = %e, "One-shot publish failed");
                MqttError::OneShotFailed {
                    topic: target.topic.clone(),
                    source: Box::new(e),
                }
            })
    }

    /// Collect retained LWT presence for `device_ids` (all devices if empty).
    ///
    /// Returns whatever arrived within `wait` after the subscription was
    /// acknowledged, stopping early once every requested device reported.
    pub async fn read_lwt_snapshot(
        &self,
        device_ids: &[String],
        wait: Duration,
    ) -> Result<BTreeMap<String, Presence>> {
        let topics = lwt_snapshot_subscribe_topics(device_ids);
        let wanted: BTreeSet<String> = device_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        let mut conn = self.connect().await?;
        let result = async {
            conn.subscribe(topics, self.timeout).await?;
            let mut snapshot = BTreeMap::new();
            let deadline = Instant::now() + wait;
            while let Some(packet) = conn.next_packet(deadline).await? {
                let Packet::Publish(publish) = packet else {
                    continue;
                };
                let Some(device_id) = extract_lwt_device_id(&publish.topic) else {
                    continue;
                };
                if !wanted.is_empty() && !wanted.contains(&device_id) {
                    continue;
                }
                let payload = publish.payload_str();
                if let Some(RealtimeMessage::Lwt { presence, .. }) =
                    parse_realtime_message(&publish.topic, &payload)
                {
                    snapshot.insert(device_id, presence);
                }
                if !wanted.is_empty() && snapshot.len() >= wanted.len() {
                    break;
                }
            }
            Ok::<_, MqttError>(snapshot)
        }
        .await;
        conn.close().await;
        result
    }

    /// Listen on every realtime topic for `window` and report what was seen.
    pub async fn scan_devices(&self, window: Duration) -> Result<Vec<DiscoveredDevice>> {
        let mut conn = self.connect().await?;
        let result = async {
            conn.subscribe(realtime_subscribe_topics(), self.timeout).await?;
            let mut collector = DiscoveryCollector::new();
            let deadline = Instant::now() + window;
            while let Some(packet) = conn.next_packet(deadline).await? {
                if let Packet::Publish(publish) = packet {
                    collector.observe(&publish.topic, &publish.payload_str(), Utc::now());
                }
            }
            info!(devices = collector.len(), "Discovery window closed");
            Ok::<_, MqttError>(collector.finish())
        }
        .await;
        conn.close().await;
        result
    }

    async fn connect(&self) -> Result<OneShotConnection> {
        let deadline = Instant::now() + self.timeout;
        let link = timeout_at(deadline, self.connector.open())
            .await
            .map_err(|_| MqttError::Timeout("broker connection".into()))??;
        let mut conn = OneShotConnection::new(link);

        let client_id = self.config.client_id();
        debug!(client_id = %client_id, endpoint = self.connector.endpoint(), "One-shot CONNECT");
        let handshake = async {
            conn.send(&self.config.connect_packet(client_id)).await?;
            match conn
                .wait_for(deadline, "CONNACK", |p| matches!(p, Packet::ConnAck(_)))
                .await?
            {
                Packet::ConnAck(ack) if ack.return_code != 0 => {
                    Err(MqttError::ConnectionRejected(ack.return_code))
                }
                _ => Ok::<(), MqttError>(()),
            }
        }
        .await;

        match handshake {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.link.close().await;
                Err(e)
            }
        }
    }
}

struct OneShotConnection {
    link: Box<dyn Link>,
    buffer: BytesMut,
    /// Packets read while waiting for something else
    stash: VecDeque<Packet>,
}

impl OneShotConnection {
    fn new(link: Box<dyn Link>) -> Self {
        Self {
            link,
            buffer: BytesMut::new(),
            stash: VecDeque::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        send_packet(self.link.as_mut(), packet).await
    }

    async fn publish_acked(&mut self, publish: Publish, wait: Duration) -> Result<()> {
        let packet_id = publish.packet_id;
        let topic = publish.topic.clone();
        self.send(&Packet::Publish(publish)).await?;
        self.wait_for(Instant::now() + wait, "PUBACK", |p| {
            matches!(p, Packet::PubAck { packet_id: id } if Some(*id) == packet_id)
        })
        .await
        .map_err(|e| match e {
            MqttError::Timeout(_) => MqttError::PublishTimeout { topic },
            other => other,
        })?;
        Ok(())
    }

    async fn subscribe(&mut self, topics: Vec<String>, wait: Duration) -> Result<()> {
        let packet_id: u16 = rand::thread_rng().gen_range(1..=u16::MAX);
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            filters: topics
                .into_iter()
                .map(|topic| (topic, QoS::AtMostOnce))
                .collect(),
        });
        self.send(&subscribe).await?;
        self.wait_for(Instant::now() + wait, "SUBACK", |p| {
            matches!(p, Packet::SubAck(ack) if ack.packet_id == packet_id)
        })
        .await?;
        Ok(())
    }

    /// Next packet, or `None` once `deadline` passes.
    async fn next_packet(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        if let Some(packet) = self.stash.pop_front() {
            return Ok(Some(packet));
        }
        self.read_packet(deadline).await
    }

    async fn wait_for<F>(&mut self, deadline: Instant, what: &str, matches: F) -> Result<Packet>
    where
        F: Fn(&Packet) -> bool,
    {
        if let Some(index) = self.stash.iter().position(&matches) {
            if let Some(packet) = self.stash.remove(index) {
                return Ok(packet);
            }
        }
        loop {
            match self.read_packet(deadline).await? {
                Some(packet) if matches(&packet) => return Ok(packet),
                Some(packet) => self.stash.push_back(packet),
                None => return Err(MqttError::Timeout(what.to_string())),
            }
        }
    }

    async fn read_packet(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            if let Some(frame) = pull_one_packet(&mut self.buffer)? {
                match Packet::decode(&frame) {
                    Ok(packet) => {
                        if let Packet::Publish(Publish {
                            qos: QoS::AtLeastOnce,
                            packet_id: Some(packet_id),
                            ..
                        }) = &packet
                        {
                            self.send(&Packet::PubAck {
                                packet_id: *packet_id,
                            })
                            .await?;
                        }
                        return Ok(Some(packet));
                    }
                    Err(e) => {
                        debug!(error = %e, "Skipping malformed MQTT packet");
                        continue;
                    }
                }
            }
            match timeout_at(deadline, self.link.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(MqttError::ConnectionClosed),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(chunk))) => self.buffer.extend_from_slice(&chunk),
            }
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.send(&Packet::Disconnect).await {
            debug!(error = %e, "DISCONNECT not delivered");
        }
        self.link.close().await;
    }
}
