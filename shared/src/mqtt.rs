//! MQTT 3.1.1 packet codec (QoS 0 subset)
//!
//! Every packet is framed as:
//! ```text
//! [ 1 byte: type << 4 | flags ][ 1-4 bytes: remaining length ][ N bytes: body ]
//! ```
//!
//! Only what a publishing client needs is modelled: CONNECT, CONNACK,
//! PUBLISH, PINGREQ, PINGRESP and DISCONNECT. Anything else decodes as
//! [`Packet::Other`] so a reader can skip it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum packet size accepted in either direction
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Broker port used when the URL does not name one
pub const DEFAULT_PORT: u16 = 1883;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_CLEAN_SESSION: u8 = 0x02;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum MqttError {
    #[error("Packet too large: {0} bytes (max: {MAX_PACKET_SIZE})")]
    PacketTooLarge(usize),

    #[error("Malformed remaining length")]
    MalformedLength,

    #[error("Malformed packet: {0}")]
    Malformed(&'static str),

    #[error("String field too long: {0} bytes")]
    StringTooLong(usize),

    #[error("Invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
}

/// CONNECT packet contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// MQTT control packets understood by the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, return_code: u8 },
    Publish { topic: String, payload: Bytes },
    PingReq,
    PingResp,
    Disconnect,
    /// Any other packet type, body discarded
    Other(u8),
}

/// Topic a device publishes its telemetry on
pub fn telemetry_topic(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/telemetry/{device_id}")
}

/// Parse `mqtt://host[:port]` into a `host:port` socket address string
pub fn parse_broker_url(url: &str) -> Result<String, MqttError> {
    let rest = url
        .strip_prefix("mqtt://")
        .ok_or_else(|| MqttError::InvalidUrl(format!("{url} (expected mqtt://host[:port])")))?;
    let authority = rest.trim_end_matches('/');

    if authority.is_empty() || authority.contains('/') {
        return Err(MqttError::InvalidUrl(url.to_string()));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            port.parse::<u16>()
                .map_err(|_| MqttError::InvalidUrl(url.to_string()))?;
            Ok(authority.to_string())
        }
        Some(_) => Err(MqttError::InvalidUrl(url.to_string())),
        None => Ok(format!("{authority}:{DEFAULT_PORT}")),
    }
}

/// Encode a packet into the provided buffer
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<(), MqttError> {
    let mut body = BytesMut::new();

    let header = match packet {
        Packet::Connect(connect) => {
            put_string(&mut body, PROTOCOL_NAME)?;
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

            put_string(&mut body, &connect.client_id)?;
            if let Some(username) = &connect.username {
                put_string(&mut body, username)?;
            }
            if let Some(password) = &connect.password {
                put_string(&mut body, password)?;
            }
            CONNECT << 4
        }
        Packet::ConnAck {
            session_present,
            return_code,
        } => {
            body.put_u8(u8::from(*session_present));
            body.put_u8(*return_code);
            CONNACK << 4
        }
        Packet::Publish { topic, payload } => {
            put_string(&mut body, topic)?;
            body.put_slice(payload);
            PUBLISH << 4
        }
        Packet::PingReq => PINGREQ << 4,
        Packet::PingResp => PINGRESP << 4,
        Packet::Disconnect => DISCONNECT << 4,
        Packet::Other(_) => return Err(MqttError::Malformed("unsupported packet type")),
    };

    if body.len() > MAX_PACKET_SIZE {
        return Err(MqttError::PacketTooLarge(body.len()));
    }

    buf.reserve(1 + 4 + body.len());
    buf.put_u8(header);
    put_remaining_length(buf, body.len());
    buf.put_slice(&body);

    Ok(())
}

/// Encode a packet into a fresh buffer
pub fn encode_to_bytes(packet: &Packet) -> Result<Bytes, MqttError> {
    let mut buf = BytesMut::new();
    encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Try to decode one packet from a buffer
///
/// Returns:
/// - `Ok(Some(packet))` if a complete packet was decoded and consumed
/// - `Ok(None)` if more data is needed (buffer untouched)
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, MqttError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let Some((remaining, len_bytes)) = peek_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    if remaining > MAX_PACKET_SIZE {
        return Err(MqttError::PacketTooLarge(remaining));
    }

    let total_len = 1 + len_bytes + remaining;
    if buf.len() < total_len {
        return Ok(None);
    }

    let header = buf[0];
    buf.advance(1 + len_bytes);
    let mut body = buf.split_to(remaining).freeze();

    let packet = match header >> 4 {
        CONNECT => Packet::Connect(decode_connect(&mut body)?),
        CONNACK => {
            if body.remaining() < 2 {
                return Err(MqttError::Malformed("short CONNACK"));
            }
            Packet::ConnAck {
                session_present: body.get_u8() & 0x01 != 0,
                return_code: body.get_u8(),
            }
        }
        PUBLISH => {
            let qos = (header >> 1) & 0x03;
            let topic = get_string(&mut body)?;
            if qos > 0 {
                // Packet identifier; not needed for a QoS 0 client
                get_u16(&mut body)?;
            }
            Packet::Publish {
                topic,
                payload: body,
            }
        }
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        other => Packet::Other(other),
    };

    Ok(Some(packet))
}

fn decode_connect(body: &mut Bytes) -> Result<Connect, MqttError> {
    let protocol = get_string(body)?;
    if protocol != PROTOCOL_NAME {
        return Err(MqttError::Malformed("unknown protocol name"));
    }
    if body.remaining() < 2 {
        return Err(MqttError::Malformed("short CONNECT"));
    }
    let _level = body.get_u8();
    let flags = body.get_u8();
    let keep_alive_secs = get_u16(body)?;
    let client_id = get_string(body)?;

    let username = if flags & FLAG_USERNAME != 0 {
        Some(get_string(body)?)
    } else {
        None
    };
    let password = if flags & FLAG_PASSWORD != 0 {
        Some(get_string(body)?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        keep_alive_secs,
        clean_session: flags & FLAG_CLEAN_SESSION != 0,
        username,
        password,
    })
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Returns `(length, bytes used)`, or `None` if the length is still incomplete
fn peek_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, MqttError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, byte) in bytes.iter().enumerate() {
        if i >= 4 {
            return Err(MqttError::MalformedLength);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if bytes.len() >= 4 {
        return Err(MqttError::MalformedLength);
    }
    Ok(None)
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), MqttError> {
    let len = u16::try_from(s.len()).map_err(|_| MqttError::StringTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u16(body: &mut Bytes) -> Result<u16, MqttError> {
    if body.remaining() < 2 {
        return Err(MqttError::Malformed("truncated field"));
    }
    Ok(body.get_u16())
}

fn get_string(body: &mut Bytes) -> Result<String, MqttError> {
    let len = usize::from(get_u16(body)?);
    if body.remaining() < len {
        return Err(MqttError::Malformed("truncated string"));
    }
    let raw = body.split_to(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct PacketDecoder {
    /// Partial packet data being accumulated
    buffer: BytesMut,
}

impl PacketDecoder {
    /// Create a new packet decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next packet from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete packets
    pub fn decode_next(&mut self) -> Result<Option<Packet>, MqttError> {
        decode(&mut self.buffer)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
