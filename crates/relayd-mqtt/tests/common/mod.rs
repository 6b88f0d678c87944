//! Scripted in-memory broker shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use relayd_mqtt::codec::{pull_one_packet, ConnAck, Publish, QoS, SubAck};
use relayd_mqtt::connector::memory::{self, MemoryPeer};
use relayd_mqtt::{Connector, Packet};

#[derive(Default)]
struct BrokerState {
    /// `None` never answers CONNECT
    connack_code: Option<u8>,
    silent_topics: HashSet<String>,
    published: Vec<(String, String)>,
    subscribe_requests: usize,
    connects: usize,
    next_peer: u64,
    peers: Vec<(u64, mpsc::UnboundedSender<Bytes>)>,
    retained: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn start() -> (Arc<dyn Connector>, FakeBroker) {
        let (connector, mut acceptor) = memory::pair();
        let broker = FakeBroker {
            state: Arc::new(Mutex::new(BrokerState {
                connack_code: Some(0),
                ..Default::default()
            })),
        };
        let state = broker.state.clone();
        tokio::spawn(async move {
            while let Some(peer) = acceptor.accept().await {
                tokio::spawn(serve(peer, state.clone()));
            }
        });
        (Arc::new(connector), broker)
    }

    pub fn reject_with(&self, code: u8) {
        self.state.lock().connack_code = Some(code);
    }

    pub fn ignore_connect(&self) {
        self.state.lock().connack_code = None;
    }

    pub fn accept_connect(&self) {
        self.state.lock().connack_code = Some(0);
    }

    /// Never PUBACK publishes on `topic`.
    pub fn withhold_ack(&self, topic: &str) {
        self.state.lock().silent_topics.insert(topic.to_string());
    }

    /// Messages sent to every subscriber right after SUBACK.
    pub fn retain(&self, topic: &str, payload: &str) {
        self.state
            .lock()
            .retained
            .push((topic.to_string(), payload.to_string()));
    }

    /// Push a QoS 0 message to every live connection.
    pub fn deliver(&self, topic: &str, payload: &str) {
        let frame = Packet::Publish(Publish::at_most_once(topic, payload.to_string()))
            .encode()
            .unwrap();
        for (_, peer) in &self.state.lock().peers {
            let _ = peer.send(frame.clone());
        }
    }

    /// Drop every live connection.
    pub fn disconnect_all(&self) {
        self.state.lock().peers.clear();
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().published.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn subscribe_requests(&self) -> usize {
        self.state.lock().subscribe_requests
    }

    /// Wait until `n` SUBSCRIBE packets were handled.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        for _ in 0..1_000 {
            if self.subscribe_requests() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never saw {} subscriptions", n);
    }

    pub async fn wait_for_published(&self, n: usize) {
        for _ in 0..1_000 {
            if self.published().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never saw {} publishes", n);
    }
}

fn send_to(state: &Mutex<BrokerState>, peer_id: u64, packet: Packet) -> bool {
    let frame = packet.encode().unwrap();
    let state = state.lock();
    match state.peers.iter().find(|(id, _)| *id == peer_id) {
        Some((_, peer)) => peer.send(frame).is_ok(),
        None => false,
    }
}

async fn serve(peer: MemoryPeer, state: Arc<Mutex<BrokerState>>) {
    let MemoryPeer {
        mut inbound,
        outbound,
    } = peer;
    let peer_id = {
        let mut state = state.lock();
        state.next_peer += 1;
        let id = state.next_peer;
        state.peers.push((id, outbound));
        id
    };

    let mut buffer = BytesMut::new();
    while let Some(chunk) = inbound.recv().await {
        buffer.extend_from_slice(&chunk);
        while let Some(frame) = pull_one_packet(&mut buffer).unwrap() {
            let packet = Packet::decode(&frame).unwrap();
            match packet {
                Packet::Connect(_) => {
                    let code = {
                        let mut state = state.lock();
                        state.connects += 1;
                        state.connack_code
                    };
                    if let Some(return_code) = code {
                        send_to(
                            &state,
                            peer_id,
                            Packet::ConnAck(ConnAck {
                                session_present: false,
                                return_code,
                            }),
                        );
                    }
                }
                Packet::Subscribe(subscribe) => {
                    let retained = {
                        let mut state = state.lock();
                        state.subscribe_requests += 1;
                        state.retained.clone()
                    };
                    send_to(
                        &state,
                        peer_id,
                        Packet::SubAck(SubAck {
                            packet_id: subscribe.packet_id,
                            return_codes: vec![0; subscribe.filters.len()],
                        }),
                    );
                    for (topic, payload) in retained {
                        send_to(
                            &state,
                            peer_id,
                            Packet::Publish(Publish::at_most_once(topic, payload)),
                        );
                    }
                }
                Packet::Publish(publish) => {
                    let silent = {
                        let mut state = state.lock();
                        state.published.push((
                            publish.topic.clone(),
                            String::from_utf8_lossy(&publish.payload).into_owned(),
                        ));
                        state.silent_topics.contains(&publish.topic)
                    };
                    if let (QoS::AtLeastOnce, Some(packet_id), false) =
                        (publish.qos, publish.packet_id, silent)
                    {
                        send_to(&state, peer_id, Packet::PubAck { packet_id });
                    }
                }
                Packet::PingReq => {
                    send_to(&state, peer_id, Packet::PingResp);
                }
                Packet::Disconnect => {
                    state.lock().peers.retain(|(id, _)| *id != peer_id);
                    return;
                }
                _ => {}
            }
        }
    }
    state.lock().peers.retain(|(id, _)| *id != peer_id);
}
