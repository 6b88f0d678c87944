//! Shared realtime proxy.
//!
//! One long-lived MQTT session serves the whole process. An actor task
//! owns all mutable state: the FIFO publish queue, the single in-flight
//! publish awaiting its PUBACK, the subscriber registry, and the cache of
//! the latest status and presence per device. Callers talk to it through
//! the cloneable [`RealtimeProxy`] handle.
//!
//! Publishes are serialized: the next QoS 1 PUBLISH is only sent once the
//! previous one was acknowledged, timed out, or failed. Callers waiting for
//! a connection, or for an acknowledgement, always get a definite answer:
//! success, timeout, disconnect, or stop.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use relayd_core::{BrokerConfig, CommandEnvelope, DeviceSnapshot, RealtimeEvent};

use crate::codec::{Packet, Publish, QoS, Subscribe};
use crate::compat::{
    build_command_publish_targets, parse_realtime_message, realtime_subscribe_topics,
    PublishTarget,
};
use crate::connector::Connector;
use crate::error::{MqttError, Result};
use crate::transport::{ConnectionState, Session, SessionConfig, TransportEvent};

/// Subscriber callback. Runs on the proxy task; keep it short.
pub type EventCallback = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub session: SessionConfig,
    /// PUBACK deadline per publish
    pub publish_timeout: Duration,
    /// How long a publish waits for a live session
    pub connection_wait: Duration,
    /// Topic filters subscribed after every CONNACK
    pub subscribe_topics: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for ProxyConfig {
    fn from(broker: &BrokerConfig) -> Self {
        let publish_timeout = Duration::from_millis(broker.publish_timeout_ms);
        Self {
            session: SessionConfig::from(broker),
            publish_timeout,
            connection_wait: publish_timeout,
            subscribe_topics: realtime_subscribe_topics(),
        }
    }
}

/// Cloneable handle to the proxy actor.
#[derive(Clone)]
pub struct RealtimeProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    commands: mpsc::UnboundedSender<ProxyCommand>,
    session: Arc<Session>,
    next_subscriber_id: AtomicU64,
    actor: Mutex<Option<JoinHandle<()>>>,
}

enum ProxyCommand {
    Subscribe {
        id: u64,
        device_ids: HashSet<String>,
        callback: EventCallback,
        replay_latest: bool,
    },
    Unsubscribe {
        id: u64,
    },
    Publish(PublishJob),
    Snapshot {
        device_id: String,
        reply: oneshot::Sender<Option<DeviceSnapshot>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

struct PublishJob {
    topic: String,
    payload: Bytes,
    wait_deadline: Instant,
    reply: oneshot::Sender<Result<()>>,
}

struct InFlight {
    topic: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<()>>,
}

impl RealtimeProxy {
    /// Spawn the session and the proxy actor.
    pub fn start(connector: Arc<dyn Connector>, config: ProxyConfig) -> Self {
        let (session, events) = Session::spawn(connector, config.session.clone());
        let session = Arc::new(session);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let actor = ProxyActor {
            config,
            session: session.clone(),
            commands: commands_rx,
            events,
            connected_epoch: None,
            packet_ids: PacketIdAllocator::default(),
            subscribers: BTreeMap::new(),
            latest: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
        };
        let handle = tokio::spawn(actor.run());

        Self {
            inner: Arc::new(ProxyInner {
                commands: commands_tx,
                session,
                next_subscriber_id: AtomicU64::new(1),
                actor: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    /// Register a callback for events of `device_ids` (all devices if empty).
    ///
    /// With `replay_latest`, the cached status and presence of each matching
    /// device are delivered before any live event.
    pub fn subscribe<I, S>(
        &self,
        device_ids: I,
        callback: EventCallback,
        replay_latest: bool,
    ) -> Result<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let device_ids: HashSet<String> = device_ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .commands
            .send(ProxyCommand::Subscribe {
                id,
                device_ids,
                callback,
                replay_latest,
            })
            .map_err(|_| MqttError::Stopped)?;
        Ok(Subscription {
            id,
            commands: self.inner.commands.clone(),
            active: true,
        })
    }

    /// Publish one QoS 1 message and wait for its PUBACK.
    pub async fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        self.enqueue(topic.into(), payload.into())?
            .await
            .map_err(|_| MqttError::Stopped)?
    }

    /// Publish to every target; succeeds if at least one is acknowledged.
    pub async fn publish_targets(&self, targets: &[PublishTarget]) -> Result<()> {
        let mut pending = Vec::with_capacity(targets.len());
        for target in targets {
            let reply = self.enqueue(target.topic.clone(), Bytes::from(target.payload.clone()))?;
            pending.push(async move {
                let outcome = reply.await.map_err(|_| MqttError::Stopped).and_then(|r| r);
                (target.topic.clone(), outcome)
            });
        }
        aggregate_publish_results(join_all(pending).await)
    }

    pub async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<()> {
        let targets = build_command_publish_targets(
            envelope.device_id(),
            envelope.action(),
            envelope.command_channel(),
        );
        if targets.is_empty() {
            return Err(MqttError::NoPublishTarget(envelope.device_id().to_string()));
        }
        debug!(
            request_id = envelope.request_id(),
            device_id = envelope.device_id(),
            action = %envelope.action(),
            "Publishing command via realtime session"
        );
        self.publish_targets(&targets).await
    }

    /// Latest cached status and presence for one device.
    pub async fn latest_snapshot(&self, device_id: &str) -> Result<Option<DeviceSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(ProxyCommand::Snapshot {
                device_id: device_id.trim().to_string(),
                reply,
            })
            .map_err(|_| MqttError::Stopped)?;
        rx.await.map_err(|_| MqttError::Stopped)
    }

    /// Fail all outstanding work, close the session and stop reconnecting.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(ProxyCommand::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
        self.inner.session.stop().await;
        let actor = self.inner.actor.lock().take();
        if let Some(actor) = actor {
            if let Err(e) = actor.await {
                warn!(error = %e, "Realtime proxy task ended abnormally");
            }
        }
    }

    fn enqueue(&self, topic: String, payload: Bytes) -> Result<oneshot::Receiver<Result<()>>> {
        let (reply, rx) = oneshot::channel();
        let job = PublishJob {
            topic,
            payload,
            wait_deadline: Instant::now(),
            reply,
        };
        self.inner
            .commands
            .send(ProxyCommand::Publish(job))
            .map_err(|_| MqttError::Stopped)?;
        Ok(rx)
    }
}

/// Combine per-target outcomes of one logical publish.
///
/// Any success wins. When every target failed only because no session was
/// available, that error is returned as is; otherwise all failures are
/// folded into [`MqttError::AllTargetsFailed`].
pub fn aggregate_publish_results(results: Vec<(String, Result<()>)>) -> Result<()> {
    if results.is_empty() {
        return Err(MqttError::NoPublishTarget(String::new()));
    }
    if results.iter().any(|(_, outcome)| outcome.is_ok()) {
        return Ok(());
    }

    let mut failures: Vec<(String, MqttError)> = results
        .into_iter()
        .filter_map(|(topic, outcome)| outcome.err().map(|e| (topic, e)))
        .collect();
    if failures.iter().all(|(_, e)| e.is_unavailable()) {
        return Err(failures.remove(0).1);
    }
    let details = failures
        .iter()
        .map(|(topic, e)| format!("{}: {}", topic, e))
        .collect::<Vec<_>>()
        .join("; ");
    Err(MqttError::AllTargetsFailed { details })
}

/// Registration returned by [`RealtimeProxy::subscribe`].
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    commands: mpsc::UnboundedSender<ProxyCommand>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if std::mem::take(&mut self.active) {
            let _ = self.commands.send(ProxyCommand::Unsubscribe { id: self.id });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Packet ids 1..=65535, wrapping, never 0.
#[derive(Debug)]
struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIdAllocator {
    fn next(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    fn reset(&mut self) {
        self.next = 1;
    }
}

struct Subscriber {
    device_ids: HashSet<String>,
    callback: EventCallback,
}

impl Subscriber {
    fn wants(&self, device_id: &str) -> bool {
        self.device_ids.is_empty() || self.device_ids.contains(device_id)
    }
}

struct ProxyActor {
    config: ProxyConfig,
    session: Arc<Session>,
    commands: mpsc::UnboundedReceiver<ProxyCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    connected_epoch: Option<u64>,
    packet_ids: PacketIdAllocator,
    subscribers: BTreeMap<u64, Subscriber>,
    latest: HashMap<String, DeviceSnapshot>,
    queue: VecDeque<PublishJob>,
    in_flight: HashMap<u16, InFlight>,
}

impl ProxyActor {
    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ProxyCommand::Stop { reply }) => {
                        self.fail_all(|| MqttError::Stopped);
                        let _ = reply.send(());
                        info!("Realtime proxy stopped");
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.fail_all(|| MqttError::Stopped);
                        return;
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_transport(event),
                    None => {
                        self.fail_all(|| MqttError::Stopped);
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
            self.pump();
        }
    }

    fn handle_command(&mut self, command: ProxyCommand) {
        match command {
            ProxyCommand::Subscribe {
                id,
                device_ids,
                callback,
                replay_latest,
            } => {
                let subscriber = Subscriber {
                    device_ids,
                    callback,
                };
                if replay_latest {
                    let mut replay: Vec<&RealtimeEvent> = self
                        .latest
                        .iter()
                        .filter(|(device_id, _)| subscriber.wants(device_id))
                        .flat_map(|(_, snapshot)| snapshot.events())
                        .collect();
                    replay.sort_by_key(|event| event.ts);
                    for event in replay {
                        deliver(id, &subscriber, event);
                    }
                }
                debug!(subscriber_id = id, "Subscriber registered");
                self.subscribers.insert(id, subscriber);
            }
            ProxyCommand::Unsubscribe { id } => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(subscriber_id = id, "Subscriber removed");
                }
            }
            ProxyCommand::Publish(mut job) => {
                job.wait_deadline = Instant::now() + self.config.connection_wait;
                self.queue.push_back(job);
            }
            ProxyCommand::Snapshot { device_id, reply } => {
                let _ = reply.send(self.latest.get(&device_id).cloned());
            }
            ProxyCommand::Stop { .. } => {}
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { epoch } => {
                self.connected_epoch = Some(epoch);
                self.packet_ids.reset();
                self.send_subscribe(epoch);
            }
            TransportEvent::Disconnected { epoch, reason } => {
                if self.connected_epoch == Some(epoch) {
                    self.connected_epoch = None;
                }
                let in_flight = self.in_flight.len();
                if in_flight > 0 {
                    warn!(
                        epoch,
                        in_flight,
                        waiting = self.queue.len(),
                        reason = %reason,
                        "Failing in-flight publish after disconnect"
                    );
                }
                for (_, pending) in self.in_flight.drain() {
                    let _ = pending.reply.send(Err(MqttError::ConnectionClosed));
                }
                // Queued jobs keep waiting for the reconnect until their own
                // connection wait runs out.
                self.expire(Instant::now());
            }
            TransportEvent::Packet { epoch, packet } => {
                if self.connected_epoch != Some(epoch) {
                    return;
                }
                match packet {
                    Packet::PubAck { packet_id } => match self.in_flight.remove(&packet_id) {
                        Some(pending) => {
                            debug!(packet_id, topic = %pending.topic, "PUBACK received");
                            let _ = pending.reply.send(Ok(()));
                        }
                        None => debug!(packet_id, "PUBACK for unknown packet id"),
                    },
                    Packet::Publish(publish) => self.dispatch(&publish),
                    Packet::SubAck(ack) => {
                        let refused = ack.return_codes.iter().filter(|code| **code == 0x80).count();
                        if refused > 0 {
                            warn!(refused, "Broker refused some realtime topic filters");
                        } else {
                            debug!(filters = ack.return_codes.len(), "Realtime subscription active");
                        }
                    }
                    other => debug!(packet = other.name(), "Ignoring unexpected packet"),
                }
            }
        }
    }

    fn send_subscribe(&mut self, epoch: u64) {
        if self.config.subscribe_topics.is_empty() {
            return;
        }
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: self.packet_ids.next(),
            filters: self
                .config
                .subscribe_topics
                .iter()
                .map(|topic| (topic.clone(), QoS::AtMostOnce))
                .collect(),
        });
        match subscribe.encode() {
            Ok(frame) => {
                if let Err(e) = self.session.send(epoch, frame) {
                    warn!(error = %e, "Could not queue SUBSCRIBE");
                }
            }
            Err(e) => warn!(error = %e, "Could not encode SUBSCRIBE"),
        }
    }

    fn dispatch(&mut self, publish: &Publish) {
        let payload = publish.payload_str();
        let Some(message) = parse_realtime_message(&publish.topic, &payload) else {
            return;
        };
        let event = RealtimeEvent::new(message, Utc::now());

        // Cache first so a subscriber registering from a callback sees it.
        self.latest
            .entry(event.device_id().to_string())
            .or_default()
            .apply(&event);

        for (id, subscriber) in &self.subscribers {
            if subscriber.wants(event.device_id()) {
                deliver(*id, subscriber, &event);
            }
        }
    }

    /// Send the next queued publish if the session is up and nothing is in flight.
    fn pump(&mut self) {
        let Some(epoch) = self.connected_epoch else {
            return;
        };
        while self.in_flight.is_empty() {
            let Some(job) = self.queue.pop_front() else {
                return;
            };
            if job.reply.is_closed() {
                continue;
            }
            let packet_id = self.packet_ids.next();
            let packet = Packet::Publish(Publish::at_least_once(
                job.topic.clone(),
                job.payload.clone(),
                packet_id,
            ));
            let sent = packet
                .encode()
                .map_err(MqttError::from)
                .and_then(|frame| self.session.send(epoch, frame));
            if let Err(e) = sent {
                let _ = job.reply.send(Err(e));
                continue;
            }
            debug!(packet_id, topic = %job.topic, "PUBLISH sent");
            self.in_flight.insert(
                packet_id,
                InFlight {
                    topic: job.topic,
                    deadline: Instant::now() + self.config.publish_timeout,
                    reply: job.reply,
                },
            );
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let acks = self.in_flight.values().map(|pending| pending.deadline);
        let waits = self
            .connected_epoch
            .is_none()
            .then(|| self.queue.iter().map(|job| job.wait_deadline))
            .into_iter()
            .flatten();
        acks.chain(waits).min()
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .in_flight
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for packet_id in expired {
            if let Some(pending) = self.in_flight.remove(&packet_id) {
                warn!(packet_id, topic = %pending.topic, "PUBACK timeout");
                let _ = pending
                    .reply
                    .send(Err(MqttError::PublishTimeout { topic: pending.topic }));
            }
        }

        if self.connected_epoch.is_none() {
            let (expired, waiting): (VecDeque<_>, VecDeque<_>) = self
                .queue
                .drain(..)
                .partition(|job| job.wait_deadline <= now);
            self.queue = waiting;
            for job in expired {
                let _ = job.reply.send(Err(MqttError::ConnectionUnavailable(
                    "timed out waiting for realtime MQTT connection".into(),
                )));
            }
        }
    }

    fn fail_all(&mut self, error: impl Fn() -> MqttError) {
        for (_, pending) in self.in_flight.drain() {
            let _ = pending.reply.send(Err(error()));
        }
        for job in self.queue.drain(..) {
            let _ = job.reply.send(Err(error()));
        }
        self.subscribers.clear();
    }
}

fn deliver(id: u64, subscriber: &Subscriber, event: &RealtimeEvent) {
    let callback = &subscriber.callback;
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!(
            subscriber_id = id,
            device_id = event.device_id(),
            "Realtime subscriber panicked, continuing fanout"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_ids_wrap_and_skip_zero() {
        let mut ids = PacketIdAllocator { next: u16::MAX - 1 };
        assert_eq!(ids.next(), u16::MAX - 1);
        assert_eq!(ids.next(), u16::MAX);
        assert_eq!(ids.next(), 1);
        ids.reset();
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn test_aggregate_any_success_wins() {
        let results = vec![
            ("a".to_string(), Err(MqttError::PublishTimeout { topic: "a".into() })),
            ("b".to_string(), Ok(())),
            ("c".to_string(), Err(MqttError::ConnectionClosed)),
        ];
        assert!(aggregate_publish_results(results).is_ok());
    }

    #[test]
    fn test_aggregate_names_every_topic() {
        let results = vec![
            (
                "cmnd/a/POWER".to_string(),
                Err(MqttError::PublishTimeout {
                    topic: "cmnd/a/POWER".into(),
                }),
            ),
            ("cmnd/b/POWER".to_string(), Err(MqttError::ConnectionClosed)),
            ("cmnd/c/POWER".to_string(), Err(MqttError::Stopped)),
        ];
        let err = aggregate_publish_results(results).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Failed to publish command on all MQTT topic profiles ("));
        for topic in ["cmnd/a/POWER", "cmnd/b/POWER", "cmnd/c/POWER"] {
            assert!(message.contains(topic), "{} missing from {}", topic, message);
        }
    }

    #[test]
    fn test_aggregate_keeps_unavailable_kind() {
        let results = vec![(
            "cmnd/a/POWER".to_string(),
            Err(MqttError::ConnectionUnavailable("no session".into())),
        )];
        assert!(matches!(
            aggregate_publish_results(results),
            Err(MqttError::ConnectionUnavailable(_))
        ));
    }
}
