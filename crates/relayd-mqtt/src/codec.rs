//! MQTT 3.1.1 packet codec.
//!
//! Covers the subset a publishing/subscribing client needs: CONNECT,
//! CONNACK, PUBLISH (QoS 0/1), PUBACK, SUBSCRIBE, SUBACK, PINGREQ,
//! PINGRESP and DISCONNECT. Frames arrive in arbitrary chunks, so
//! [`pull_one_packet`] reassembles them from a growable buffer before
//! [`Packet::decode`] parses a complete frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const CONNECT: u8 = 0x10;
pub const CONNACK: u8 = 0x20;
pub const PUBLISH: u8 = 0x30;
pub const PUBACK: u8 = 0x40;
pub const SUBSCRIBE: u8 = 0x82;
pub const SUBACK: u8 = 0x90;
pub const PINGREQ: u8 = 0xC0;
pub const PINGRESP: u8 = 0xD0;
pub const DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// Largest value the four-byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// More than four remaining-length bytes; the stream cannot be resynchronised.
    #[error("Malformed remaining length")]
    MalformedRemainingLength,

    #[error("Remaining length {0} exceeds protocol maximum")]
    PayloadTooLarge(usize),

    #[error("Truncated packet: missing {0}")]
    Truncated(&'static str),

    #[error("Unsupported packet type 0x{0:02X}")]
    UnsupportedPacketType(u8),

    #[error("Invalid QoS level {0}")]
    InvalidQos(u8),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("String of {0} bytes exceeds 65535")]
    StringTooLong(usize),

    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQos(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    /// 0 means accepted; anything else is a refusal
    pub return_code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present for QoS 1 and 2 only
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn at_most_once(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
            payload: payload.into(),
        }
    }

    pub fn at_least_once(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        packet_id: u16,
    ) -> Self {
        Self {
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            packet_id: Some(packet_id),
            payload: payload.into(),
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS per filter, or 0x80 for a refused filter
    pub return_codes: Vec<u8>,
}

/// A complete control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Serialize into a single wire frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        let first_byte = match self {
            Packet::Connect(connect) => {
                write_string(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if connect.clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                if connect.username.is_some() {
                    flags |= FLAG_USERNAME;
                }
                if connect.password.is_some() {
                    flags |= FLAG_PASSWORD;
                }
                body.put_u8(flags);
                body.put_u16(connect.keep_alive_secs);
                write_string(&mut body, &connect.client_id)?;
                if let Some(username) = &connect.username {
                    write_string(&mut body, username)?;
                }
                if let Some(password) = &connect.password {
                    write_string(&mut body, password)?;
                }
                CONNECT
            }
            Packet::ConnAck(ack) => {
                body.put_u8(u8::from(ack.session_present));
                body.put_u8(ack.return_code);
                CONNACK
            }
            Packet::Publish(publish) => {
                write_string(&mut body, &publish.topic)?;
                if publish.qos != QoS::AtMostOnce {
                    match publish.packet_id {
                        Some(id) if id != 0 => body.put_u16(id),
                        _ => return Err(CodecError::Malformed("QoS>0 publish needs a packet id")),
                    }
                }
                body.put_slice(&publish.payload);
                PUBLISH
                    | (u8::from(publish.dup) << 3)
                    | ((publish.qos as u8) << 1)
                    | u8::from(publish.retain)
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                PUBACK
            }
            Packet::Subscribe(subscribe) => {
                if subscribe.filters.is_empty() {
                    return Err(CodecError::Malformed("subscribe without topic filters"));
                }
                body.put_u16(subscribe.packet_id);
                for (filter, qos) in &subscribe.filters {
                    write_string(&mut body, filter)?;
                    body.put_u8(*qos as u8);
                }
                SUBSCRIBE
            }
            Packet::SubAck(ack) => {
                body.put_u16(ack.packet_id);
                body.put_slice(&ack.return_codes);
                SUBACK
            }
            Packet::PingReq => PINGREQ,
            Packet::PingResp => PINGRESP,
            Packet::Disconnect => DISCONNECT,
        };

        let mut frame = BytesMut::with_capacity(body.len() + 5);
        frame.put_u8(first_byte);
        encode_remaining_length(body.len(), &mut frame)?;
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Parse one complete frame as produced by [`pull_one_packet`].
    pub fn decode(frame: &[u8]) -> Result<Packet> {
        let first_byte = *frame.first().ok_or(CodecError::Truncated("fixed header"))?;
        let (remaining, length_bytes) = decode_remaining_length(&frame[1..])?
            .ok_or(CodecError::Truncated("remaining length"))?;
        let header_len = 1 + length_bytes;
        let expected = header_len + remaining;
        if frame.len() < expected {
            return Err(CodecError::Truncated("packet body"));
        }
        if frame.len() > expected {
            return Err(CodecError::Malformed("trailing bytes after packet"));
        }
        let mut body = &frame[header_len..];

        let packet = match first_byte & 0xF0 {
            CONNECT => Packet::Connect(decode_connect(&mut body)?),
            CONNACK => {
                let flags = read_u8(&mut body, "CONNACK flags")?;
                let return_code = read_u8(&mut body, "CONNACK return code")?;
                Packet::ConnAck(ConnAck {
                    session_present: flags & 0x01 == 0x01,
                    return_code,
                })
            }
            PUBLISH => Packet::Publish(decode_publish(first_byte, &mut body)?),
            PUBACK => Packet::PubAck {
                packet_id: read_u16(&mut body, "PUBACK packet id")?,
            },
            0x80 => {
                let packet_id = read_u16(&mut body, "SUBSCRIBE packet id")?;
                let mut filters = Vec::new();
                while body.has_remaining() {
                    let filter = read_string(&mut body, "topic filter")?;
                    let qos = QoS::from_bits(read_u8(&mut body, "requested QoS")? & 0x03)?;
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(CodecError::Malformed("subscribe without topic filters"));
                }
                Packet::Subscribe(Subscribe { packet_id, filters })
            }
            SUBACK => {
                let packet_id = read_u16(&mut body, "SUBACK packet id")?;
                let return_codes = body.to_vec();
                body.advance(return_codes.len());
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                })
            }
            PINGREQ => Packet::PingReq,
            PINGRESP => Packet::PingResp,
            DISCONNECT => Packet::Disconnect,
            _ => return Err(CodecError::UnsupportedPacketType(first_byte)),
        };

        if body.has_remaining() {
            return Err(CodecError::Malformed("unexpected bytes in packet body"));
        }
        Ok(packet)
    }
}

fn decode_connect(body: &mut &[u8]) -> Result<Connect> {
    if read_string(body, "protocol name")? != PROTOCOL_NAME {
        return Err(CodecError::Malformed("unknown protocol name"));
    }
    if read_u8(body, "protocol level")? != PROTOCOL_LEVEL {
        return Err(CodecError::Malformed("unsupported protocol level"));
    }
    let flags = read_u8(body, "connect flags")?;
    if flags & FLAG_WILL != 0 {
        return Err(CodecError::Malformed("will messages are not supported"));
    }
    let keep_alive_secs = read_u16(body, "keep alive")?;
    let client_id = read_string(body, "client id")?;
    let username = if flags & FLAG_USERNAME != 0 {
        Some(read_string(body, "username")?)
    } else {
        None
    };
    let password = if flags & FLAG_PASSWORD != 0 {
        Some(read_string(body, "password")?)
    } else {
        None
    };
    Ok(Connect {
        client_id,
        username,
        password,
        keep_alive_secs,
        clean_session: flags & FLAG_CLEAN_SESSION != 0,
    })
}

fn decode_publish(first_byte: u8, body: &mut &[u8]) -> Result<Publish> {
    let qos = QoS::from_bits((first_byte >> 1) & 0x03)?;
    let topic = read_string(body, "topic name")?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(read_u16(body, "PUBLISH packet id")?)
    };
    let payload = Bytes::copy_from_slice(body);
    body.advance(payload.len());
    Ok(Publish {
        topic,
        qos,
        retain: first_byte & 0x01 == 0x01,
        dup: first_byte & 0x08 == 0x08,
        packet_id,
        payload,
    })
}

/// Split the first complete frame off `buffer`.
///
/// Returns `Ok(None)` while the frame is still incomplete. An error means
/// the stream is corrupt and the connection should be dropped.
pub fn pull_one_packet(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    let Some((remaining, length_bytes)) = decode_remaining_length(&buffer[1..])? else {
        return Ok(None);
    };
    let total = 1 + length_bytes + remaining;
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some(buffer.split_to(total).freeze()))
}

/// Decode the variable-length remaining-length field.
///
/// Returns `(value, bytes_used)`, or `None` if `bytes` ends before the
/// terminating byte.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    for (index, byte) in bytes.iter().take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if bytes.len() >= 4 {
        return Err(CodecError::MalformedRemainingLength);
    }
    Ok(None)
}

pub fn encode_remaining_length(mut value: usize, out: &mut BytesMut) -> Result<()> {
    if value > MAX_REMAINING_LENGTH {
        return Err(CodecError::PayloadTooLarge(value));
    }
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

fn write_string(out: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::StringTooLong(value.len()))?;
    out.put_u16(len);
    out.put_slice(value.as_bytes());
    Ok(())
}

fn read_u8(body: &mut &[u8], what: &'static str) -> Result<u8> {
    if body.remaining() < 1 {
        return Err(CodecError::Truncated(what));
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut &[u8], what: &'static str) -> Result<u16> {
    if body.remaining() < 2 {
        return Err(CodecError::Truncated(what));
    }
    Ok(body.get_u16())
}

fn read_string(body: &mut &[u8], what: &'static str) -> Result<String> {
    let len = usize::from(read_u16(body, what)?);
    if body.remaining() < len {
        return Err(CodecError::Truncated(what));
    }
    let value = std::str::from_utf8(&body[..len])
        .map_err(|_| CodecError::InvalidUtf8(what))?
        .to_string();
    body.advance(len);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> (Vec<Packet>, Vec<u8>) {
        let packets = vec![
            Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: 0,
            }),
            Packet::Publish(Publish::at_most_once("stat/plug/POWER", "ON")),
            Packet::Publish(Publish::at_least_once(
                "tele/plug/STATE",
                vec![b'x'; 300],
                7,
            )),
            Packet::PubAck { packet_id: 65535 },
            Packet::SubAck(SubAck {
                packet_id: 1,
                return_codes: vec![0, 1, 0x80],
            }),
            Packet::PingResp,
        ];
        let mut bytes = Vec::new();
        for packet in &packets {
            bytes.extend_from_slice(&packet.encode().unwrap());
        }
        (packets, bytes)
    }

    fn drain(buffer: &mut BytesMut, out: &mut Vec<Packet>) {
        while let Some(frame) = pull_one_packet(buffer).unwrap() {
            out.push(Packet::decode(&frame).unwrap());
        }
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for (value, expected) in [
            (0usize, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (2_097_152, vec![0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut out = BytesMut::new();
            encode_remaining_length(value, &mut out).unwrap();
            assert_eq!(out.as_ref(), expected.as_slice(), "encoding {}", value);
            assert_eq!(
                decode_remaining_length(&expected).unwrap(),
                Some((value, expected.len()))
            );
        }
    }

    #[test]
    fn test_remaining_length_rejects_fifth_byte() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(
            decode_remaining_length(&bytes),
            Err(CodecError::MalformedRemainingLength)
        );

        let mut buffer = BytesMut::from(&[PUBLISH, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert!(pull_one_packet(&mut buffer).is_err());
    }

    #[test]
    fn test_remaining_length_too_large_to_encode() {
        let mut out = BytesMut::new();
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut out),
            Err(CodecError::PayloadTooLarge(MAX_REMAINING_LENGTH + 1))
        );
    }

    #[test]
    fn test_truncated_input_waits_for_more() {
        let frame = Packet::Publish(Publish::at_most_once("a/b", "payload"))
            .encode()
            .unwrap();
        for cut in 0..frame.len() {
            let mut buffer = BytesMut::from(&frame[..cut]);
            assert_eq!(pull_one_packet(&mut buffer).unwrap(), None, "cut at {}", cut);
            assert_eq!(buffer.len(), cut);
        }
    }

    #[test]
    fn test_reassembly_is_independent_of_chunking() {
        let (expected, bytes) = sample_stream();

        for chunk_size in [1usize, 2, 3, 5, 64, 299, 1024] {
            let mut buffer = BytesMut::new();
            let mut decoded = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                buffer.extend_from_slice(chunk);
                drain(&mut buffer, &mut decoded);
            }
            assert_eq!(decoded, expected, "chunk size {}", chunk_size);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_connect_encoding_layout() {
        let connect = Packet::Connect(Connect {
            client_id: "relayd-0a1b2c3d".into(),
            username: Some("user".into()),
            password: Some("pass".into()),
            keep_alive_secs: 30,
            clean_session: true,
        });
        let frame = connect.encode().unwrap();

        assert_eq!(frame[0], CONNECT);
        // protocol name "MQTT", level 4, flags, keepalive 30
        assert_eq!(&frame[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(frame[8], 4);
        assert_eq!(frame[9], FLAG_USERNAME | FLAG_PASSWORD | FLAG_CLEAN_SESSION);
        assert_eq!(&frame[10..12], &[0x00, 30]);
        assert_eq!(Packet::decode(&frame).unwrap(), connect);
    }

    #[test]
    fn test_connect_without_credentials_has_no_flags() {
        let frame = Packet::Connect(Connect {
            client_id: "c".into(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            clean_session: true,
        })
        .encode()
        .unwrap();
        assert_eq!(frame[9], FLAG_CLEAN_SESSION);
    }

    #[test]
    fn test_publish_qos_encoding() {
        let qos0 = Packet::Publish(Publish::at_most_once("t", "1")).encode().unwrap();
        assert_eq!(qos0.as_ref(), &[0x30, 0x04, 0x00, 0x01, b't', b'1']);

        let qos1 = Packet::Publish(Publish::at_least_once("t", "1", 0x0102))
            .encode()
            .unwrap();
        assert_eq!(
            qos1.as_ref(),
            &[0x32, 0x06, 0x00, 0x01, b't', 0x01, 0x02, b'1']
        );
    }

    #[test]
    fn test_qos1_publish_requires_packet_id() {
        let mut publish = Publish::at_least_once("t", "x", 1);
        publish.packet_id = None;
        assert!(Packet::Publish(publish).encode().is_err());
    }

    #[test]
    fn test_decode_publish_flags_and_id() {
        let frame = [0x3B, 0x06, 0x00, 0x01, b't', 0x00, 0x09, b'!'];
        match Packet::decode(&frame).unwrap() {
            Packet::Publish(publish) => {
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert!(publish.dup);
                assert!(publish.retain);
                assert_eq!(publish.packet_id, Some(9));
                assert_eq!(publish.payload.as_ref(), b"!");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_connack_and_puback() {
        assert_eq!(
            Packet::decode(&[0x20, 0x02, 0x00, 0x05]).unwrap(),
            Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: 5
            })
        );
        assert_eq!(
            Packet::decode(&[0x40, 0x02, 0x12, 0x34]).unwrap(),
            Packet::PubAck { packet_id: 0x1234 }
        );
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert_eq!(
            Packet::decode(&[0x40, 0x01, 0x12]),
            Err(CodecError::Truncated("PUBACK packet id"))
        );
        assert_eq!(
            Packet::decode(&[0x36, 0x03, 0x00, 0x01, b't']),
            Err(CodecError::InvalidQos(3))
        );
        assert_eq!(
            Packet::decode(&[0xF0, 0x00]),
            Err(CodecError::UnsupportedPacketType(0xF0))
        );
        assert_eq!(
            Packet::decode(&[0x30, 0x03, 0x00, 0x01, 0xFF]),
            Err(CodecError::InvalidUtf8("topic name"))
        );
    }

    #[test]
    fn test_subscribe_frame() {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 3,
            filters: vec![
                ("stat/+/POWER".into(), QoS::AtMostOnce),
                ("tele/+/LWT".into(), QoS::AtLeastOnce),
            ],
        });
        let frame = subscribe.encode().unwrap();
        assert_eq!(frame[0], SUBSCRIBE);
        assert_eq!(Packet::decode(&frame).unwrap(), subscribe);

        let empty = Packet::Subscribe(Subscribe {
            packet_id: 4,
            filters: Vec::new(),
        });
        assert!(empty.encode().is_err());
    }

    #[test]
    fn test_control_packets_are_two_bytes() {
        assert_eq!(Packet::PingReq.encode().unwrap().as_ref(), &[0xC0, 0x00]);
        assert_eq!(Packet::Disconnect.encode().unwrap().as_ref(), &[0xE0, 0x00]);
    }
}
